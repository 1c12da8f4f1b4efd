//! Just enough HTTP/1.1 for the bridge's four JSON endpoints.
//!
//! One request per connection: the request line, headers, and an optional
//! `Content-Length` body are read, and a single JSON response is written
//! with `Connection: close`.

use std::io;

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::BridgeError;

/// Cap on the request line plus headers.
pub const MAX_HEADER_BYTES: u64 = 8 * 1024;

/// Cap on a request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Path with any query string removed.
    pub path: String,
    pub body: Vec<u8>,
}

/// Read one request.  `Ok(None)` when the peer closed before sending
/// anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = (&mut *reader).take(MAX_HEADER_BYTES);

    let mut request_line = String::new();
    if read_head_line(&mut head, &mut request_line).await? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(BridgeError::BadRequest(format!(
            "malformed request line '{}'",
            request_line.trim_end()
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(BridgeError::BadRequest(format!("unsupported version '{version}'")));
    }
    let path = target.split('?').next().unwrap_or(target).to_string();
    let method = method.to_ascii_uppercase();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if read_head_line(&mut head, &mut line).await? == 0 {
            return Err(BridgeError::BadRequest("headers truncated".into()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(BridgeError::BadRequest(format!("malformed header '{line}'")));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| BridgeError::BadRequest(format!("bad content-length '{}'", value.trim())))?;
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err(BridgeError::BadRequest(format!(
            "body of {content_length} bytes exceeds {MAX_BODY_BYTES}"
        )));
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(Some(Request { method, path, body }))
}

async fn read_head_line<R>(head: &mut R, line: &mut String) -> Result<usize, BridgeError>
where
    R: AsyncBufRead + Unpin,
{
    head.read_line(line).await.map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData => BridgeError::BadRequest("request head is not valid UTF-8".into()),
        _ => BridgeError::Io(e),
    })
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Error response carrying `{"detail": message}`.
    pub fn detail(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "detail": message.into() }),
        }
    }

    /// Serialised status line, headers, and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            self.status,
            reason_phrase(self.status),
            body.len(),
            body
        )
        .into_bytes()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(raw: &str) -> Result<Option<Request>, BridgeError> {
        let mut reader = raw.as_bytes();
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn reads_get_without_body() {
        let req = parse("GET /status?verbose=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/status");
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn reads_post_body_by_content_length() {
        let body = r#"{"command":"SET_MODE","type":"on"}"#;
        let raw = format!(
            "POST /send_command HTTP/1.1\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let req = parse(&raw).await.unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.body, body.as_bytes());
    }

    #[tokio::test]
    async fn empty_connection_is_none() {
        assert_eq!(parse("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_garbage() {
        assert!(matches!(parse("hello\r\n\r\n").await, Err(BridgeError::BadRequest(_))));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nContent-Length: lots\r\n\r\n").await,
            Err(BridgeError::BadRequest(_))
        ));
        assert!(matches!(
            parse("GET / HTTP/1.1\r\nHost localhost\r\n\r\n").await,
            Err(BridgeError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn rejects_non_utf8_head() {
        let mut reader: &[u8] = b"GET /st\xffatus HTTP/1.1\r\n\r\n";
        assert!(matches!(read_request(&mut reader).await, Err(BridgeError::BadRequest(_))));

        let mut reader: &[u8] = b"GET /status HTTP/1.1\r\nX-Name: \xfe\r\n\r\n";
        assert!(matches!(read_request(&mut reader).await, Err(BridgeError::BadRequest(_))));
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let raw = format!("POST /send_command HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY_BYTES + 1);
        assert!(matches!(parse(&raw).await, Err(BridgeError::BadRequest(_))));
    }

    #[test]
    fn response_wire_format() {
        let bytes = Response::detail(404, "No ACK received").to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with(r#"{"detail":"No ACK received"}"#));
    }
}
