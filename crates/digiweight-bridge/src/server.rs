//! [`BridgeServer`] – HTTP front end for the serial link.
//!
//! Listens on `127.0.0.1:8000` (configurable via [`BridgeServer::with_addr`]).
//! Each connection carries one request.  Link I/O runs on the blocking pool
//! so a slow device never stalls the accept loop.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use digiweight_link::{
    AckMailbox, DATA_PREFIX, LinkError, SerialLinkManager, StateStore, TelemetryReader,
};
use digiweight_types::Command;
use serde_json::json;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::BridgeError;
use crate::http::{self, Request, Response};

/// Default listen address.
pub const DEFAULT_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8000));

/// `/status` value with a real device attached.
pub const ONLINE_STATUS: &str = "running";

/// `/status` value when the simulator stands in for the device.
pub const OFFLINE_STATUS: &str = "running in offline mode";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Lines an `/ack` request may consume while skipping telemetry.
const MAX_ACK_SCAN: usize = 64;

// ---------------------------------------------------------------------------
// BridgeServer
// ---------------------------------------------------------------------------

/// Serves the bridge endpoints and runs the telemetry reader while up.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use digiweight_bridge::BridgeServer;
/// use digiweight_link::{LinkConfig, SerialConnector, SerialLinkManager, StateStore};
///
/// #[tokio::main]
/// async fn main() {
///     let link = SerialLinkManager::open(Arc::new(SerialConnector::default()), LinkConfig::default())
///         .expect("device not found");
///     BridgeServer::new(Arc::new(link), StateStore::new())
///         .run(async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await
///         .expect("bridge server failed");
/// }
/// ```
pub struct BridgeServer {
    link: Arc<SerialLinkManager>,
    store: StateStore,
    acks: AckMailbox,
    addr: SocketAddr,
    offline: bool,
}

struct Shared {
    link: Arc<SerialLinkManager>,
    store: StateStore,
    acks: AckMailbox,
    offline: bool,
}

impl BridgeServer {
    pub fn new(link: Arc<SerialLinkManager>, store: StateStore) -> Self {
        Self {
            link,
            store,
            acks: AckMailbox::new(),
            addr: DEFAULT_ADDR,
            offline: false,
        }
    }

    /// Override the listen address (builder-style).
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Report offline mode on `/status`.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        TcpListener::bind(self.addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: self.addr,
                source,
            })
    }

    /// Bind the configured address and [`serve`](Self::serve) until
    /// `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then stop
    /// and join the telemetry reader and close the link.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Io`] if the reader thread cannot be started,
    /// [`BridgeError::ReaderPanicked`] if it died.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = TelemetryReader::new(Arc::clone(&self.link), self.store.clone())
            .with_acks(self.acks.clone())
            .spawn(Arc::clone(&stop))?;

        let shared = Arc::new(Shared {
            link: self.link,
            store: self.store,
            acks: self.acks,
            offline: self.offline,
        });

        info!(addr = %local, offline = shared.offline, "bridge server listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &shared).await {
                                warn!(peer = %peer, error = %e, "connection failed");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
            }
        }

        info!("bridge server shutting down");
        drop(listener);
        stop.store(true, Ordering::Release);
        let joined = task::spawn_blocking(move || reader.join()).await;
        shared.link.close();

        match joined {
            Ok(Ok(())) => Ok(()),
            _ => Err(BridgeError::ReaderPanicked),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(stream: TcpStream, shared: &Shared) -> Result<(), BridgeError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let response = match tokio::time::timeout(REQUEST_TIMEOUT, http::read_request(&mut reader)).await {
        Err(_) => Response::detail(408, "request timed out"),
        Ok(Ok(None)) => return Ok(()),
        Ok(Ok(Some(request))) => route(shared, request).await,
        Ok(Err(BridgeError::BadRequest(msg))) => Response::detail(400, msg),
        Ok(Err(e)) => return Err(e),
    };

    write_half.write_all(&response.to_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

async fn route(shared: &Shared, request: Request) -> Response {
    let response = match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/status") => status(shared),
        ("GET", "/data") => data(shared),
        ("POST", "/send_command") => send_command(shared, &request.body).await,
        ("GET", "/ack") => ack(shared).await,
        (_, "/status" | "/data" | "/send_command" | "/ack") => {
            Response::detail(405, "Method Not Allowed")
        }
        _ => Response::detail(404, "Not Found"),
    };
    debug!(
        method = %request.method,
        path = %request.path,
        status = response.status,
        "request handled"
    );
    response
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

fn status(shared: &Shared) -> Response {
    let status = if shared.offline {
        OFFLINE_STATUS
    } else {
        ONLINE_STATUS
    };
    Response::ok(json!({ "status": status }))
}

fn data(shared: &Shared) -> Response {
    match serde_json::to_value(shared.store.snapshot()) {
        Ok(body) => Response::ok(body),
        Err(e) => {
            error!(error = %e, "failed to serialise device state");
            Response::detail(500, "failed to serialise device state")
        }
    }
}

async fn send_command(shared: &Shared, body: &[u8]) -> Response {
    let command: Command = match serde_json::from_slice(body) {
        Ok(command) => command,
        Err(e) => return Response::detail(422, format!("invalid command: {e}")),
    };
    let wire = match command.to_wire() {
        Ok(wire) => wire,
        Err(e) => return Response::detail(422, e.to_string()),
    };

    let name = command.name();
    let link = Arc::clone(&shared.link);
    match task::spawn_blocking(move || link.write_line(wire.as_bytes())).await {
        Ok(Ok(())) => {
            info!(command = name, "command sent");
            Response::ok(json!({ "status": "command sent" }))
        }
        Ok(Err(e)) => {
            error!(command = name, error = %e, "command write failed");
            Response::detail(500, format!("failed to send command: {e}"))
        }
        Err(e) => {
            error!(command = name, error = %e, "command write task failed");
            Response::detail(500, "command write task failed")
        }
    }
}

async fn ack(shared: &Shared) -> Response {
    let link = Arc::clone(&shared.link);
    let store = shared.store.clone();
    let acks = shared.acks.clone();
    match task::spawn_blocking(move || poll_ack(&link, &store, &acks)).await {
        Ok(Ok(Some(line))) => Response::ok(json!({ "ack": line })),
        Ok(Ok(None)) => Response::detail(404, "No ACK received"),
        Ok(Err(e)) => {
            warn!(error = %e, "ack read failed");
            Response::detail(500, format!("failed to read ack: {e}"))
        }
        Err(e) => {
            error!(error = %e, "ack read task failed");
            Response::detail(500, "ack read task failed")
        }
    }
}

/// A reply the reader already parked, else one non-blocking pass over the
/// link.  Telemetry met on the way is applied, not returned.
fn poll_ack(
    link: &SerialLinkManager,
    store: &StateStore,
    acks: &AckMailbox,
) -> Result<Option<String>, LinkError> {
    if let Some(line) = acks.pop() {
        return Ok(Some(line));
    }
    for _ in 0..MAX_ACK_SCAN {
        match link.read_line()? {
            Some(line) if line.starts_with(DATA_PREFIX) => {
                if let Err(e) = store.ingest_line(&line) {
                    warn!(line, error = %e, "dropping malformed telemetry line");
                }
            }
            Some(line) => return Ok(Some(line)),
            None => return Ok(None),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use digiweight_link::{LinkConfig, SimDevice};
    use serde_json::Value;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct Harness {
        base: String,
        device: SimDevice,
        client: reqwest::Client,
        stop: oneshot::Sender<()>,
        server: JoinHandle<Result<(), BridgeError>>,
    }

    impl Harness {
        async fn start(offline: bool) -> Self {
            let device = SimDevice::new();
            let config = LinkConfig {
                poll_interval: Duration::from_millis(2),
                reconnect_interval: Duration::from_millis(10),
                ..LinkConfig::default()
            };
            let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), config)
                .unwrap();
            let server = BridgeServer::new(Arc::new(link), StateStore::new())
                .with_addr("127.0.0.1:0".parse().unwrap())
                .offline(offline);
            let listener = server.bind().await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (stop, rx) = oneshot::channel::<()>();
            let server = tokio::spawn(server.serve(listener, async move {
                let _ = rx.await;
            }));
            Self {
                base: format!("http://{addr}"),
                device,
                client: reqwest::Client::new(),
                stop,
                server,
            }
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.client.get(format!("{}{path}", self.base)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        async fn post(&self, path: &str, body: &Value) -> (u16, Value) {
            let resp = self
                .client
                .post(format!("{}{path}", self.base))
                .json(body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap())
        }

        async fn stop(self) {
            let _ = self.stop.send(());
            tokio::time::timeout(Duration::from_secs(5), self.server)
                .await
                .expect("server did not stop")
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn status_reports_mode() {
        let online = Harness::start(false).await;
        assert_eq!(online.get("/status").await, (200, json!({ "status": "running" })));
        online.stop().await;

        let offline = Harness::start(true).await;
        assert_eq!(
            offline.get("/status").await,
            (200, json!({ "status": "running in offline mode" }))
        );
        offline.stop().await;
    }

    #[tokio::test]
    async fn data_starts_all_null() {
        let h = Harness::start(false).await;
        let (code, body) = h.get("/data").await;
        assert_eq!(code, 200);
        let obj = body.as_object().unwrap();
        assert_eq!(obj.len(), 11);
        assert!(obj.values().all(Value::is_null));
        h.stop().await;
    }

    #[tokio::test]
    async fn data_reflects_telemetry() {
        let h = Harness::start(false).await;
        h.device.push_line("DATA:force:9.81|status:ok");

        let mut body = Value::Null;
        for _ in 0..100 {
            body = h.get("/data").await.1;
            if body["force"] == json!(9.81) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(body["force"], json!(9.81));
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["position"], Value::Null);
        h.stop().await;
    }

    #[tokio::test]
    async fn send_command_writes_wire_line() {
        let h = Harness::start(false).await;
        let cmd = json!({
            "command": "SET_PULSE",
            "type": "on",
            "duration": 50,
            "strength": 80,
            "frequency": 10
        });
        assert_eq!(
            h.post("/send_command", &cmd).await,
            (200, json!({ "status": "command sent" }))
        );

        let written = h.device.written();
        assert_eq!(written.len(), 1);
        let on_wire: Value = serde_json::from_str(&written[0]).unwrap();
        assert_eq!(on_wire, cmd);
        h.stop().await;
    }

    #[tokio::test]
    async fn invalid_command_is_422() {
        let h = Harness::start(false).await;
        let (code, body) = h
            .post("/send_command", &json!({ "command": "SET_MODE", "type": "sideways" }))
            .await;
        assert_eq!(code, 422);
        assert!(body["detail"].is_string());

        let (code, _) = h.post("/send_command", &json!({ "command": "LAUNCH" })).await;
        assert_eq!(code, 422);
        assert!(h.device.written().is_empty());
        h.stop().await;
    }

    #[tokio::test]
    async fn write_fault_is_500_and_link_survives() {
        let h = Harness::start(false).await;
        h.device.set_write_failure(true);
        let cmd = json!({ "command": "SET_MODE", "type": "off" });
        let (code, body) = h.post("/send_command", &cmd).await;
        assert_eq!(code, 500);
        assert!(body["detail"].as_str().unwrap().contains("failed to send command"));

        h.device.set_write_failure(false);
        assert_eq!(h.post("/send_command", &cmd).await.0, 200);
        h.stop().await;
    }

    #[tokio::test]
    async fn ack_is_404_when_nothing_pending() {
        let h = Harness::start(false).await;
        assert_eq!(
            h.get("/ack").await,
            (404, json!({ "detail": "No ACK received" }))
        );
        h.stop().await;
    }

    #[tokio::test]
    async fn ack_returns_device_reply() {
        let h = Harness::start(false).await;
        let cmd = json!({ "command": "SET_MODE", "type": "on" });
        assert_eq!(h.post("/send_command", &cmd).await.0, 200);

        let mut last = (0, Value::Null);
        for _ in 0..50 {
            last = h.get("/ack").await;
            if last.0 == 200 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last, (200, json!({ "ack": "ack:set_mode" })));
        h.stop().await;
    }

    #[tokio::test]
    async fn unknown_path_and_wrong_method() {
        let h = Harness::start(false).await;
        assert_eq!(h.get("/nope").await.0, 404);
        assert_eq!(h.get("/send_command").await.0, 405);
        assert_eq!(h.post("/status", &json!({})).await.0, 405);
        h.stop().await;
    }

    #[tokio::test]
    async fn non_utf8_request_line_gets_400() {
        use tokio::io::AsyncReadExt;

        let h = Harness::start(false).await;
        let addr = h.base.trim_start_matches("http://").to_string();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /st\xffatus HTTP/1.1\r\n\r\n").await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        let text = String::from_utf8_lossy(&reply);
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got {text:?}");
        assert!(text.contains("not valid UTF-8"));
        h.stop().await;
    }

    #[test]
    fn poll_ack_applies_telemetry_it_skips() {
        let device = SimDevice::new();
        let link = SerialLinkManager::open(Arc::new(device.connector("USB Serial Device")), LinkConfig::default())
            .unwrap();
        let store = StateStore::new();
        let acks = AckMailbox::new();

        device.push_line("DATA:position:7");
        device.push_line("ack:set_row");
        assert_eq!(poll_ack(&link, &store, &acks).unwrap().as_deref(), Some("ack:set_row"));
        assert_eq!(store.snapshot().position, Some(digiweight_types::TelemetryValue::Number(7.0)));

        acks.push("ack:parked".into());
        assert_eq!(poll_ack(&link, &store, &acks).unwrap().as_deref(), Some("ack:parked"));
        assert_eq!(poll_ack(&link, &store, &acks).unwrap(), None);
    }
}
