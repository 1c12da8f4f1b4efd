//! [`BridgeTransport`] – the four bridge calls the client makes, and
//! [`HttpTransport`], their reqwest implementation.

use async_trait::async_trait;
use digiweight_types::{Command, DeviceState};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::ClientError;

#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// `GET /status`.
    async fn status(&self) -> Result<String, ClientError>;

    /// `GET /data`.
    async fn data(&self) -> Result<DeviceState, ClientError>;

    /// `POST /send_command`.
    async fn send_command(&self, command: &Command) -> Result<(), ClientError>;

    /// `GET /ack`; `Ok(None)` when the bridge has nothing pending.
    async fn ack(&self) -> Result<Option<String>, ClientError>;
}

#[derive(Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Deserialize)]
struct AckBody {
    ack: String,
}

/// Talks to a bridge over HTTP.  Construct once and share.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// `base_url` is the bridge root, e.g. `http://127.0.0.1:8000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn ensure_success(status: StatusCode) -> Result<(), ClientError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ClientError::Status(status.as_u16()))
    }
}

#[async_trait]
impl BridgeTransport for HttpTransport {
    async fn status(&self) -> Result<String, ClientError> {
        let response = self.client.get(self.url("/status")).send().await?;
        ensure_success(response.status())?;
        let body: StatusBody = response.json().await?;
        Ok(body.status)
    }

    async fn data(&self) -> Result<DeviceState, ClientError> {
        let response = self.client.get(self.url("/data")).send().await?;
        ensure_success(response.status())?;
        Ok(response.json().await?)
    }

    async fn send_command(&self, command: &Command) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.url("/send_command"))
            .json(command)
            .send()
            .await?;
        ensure_success(response.status())
    }

    async fn ack(&self) -> Result<Option<String>, ClientError> {
        let response = self.client.get(self.url("/ack")).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        ensure_success(response.status())?;
        let body: AckBody = response.json().await?;
        Ok(Some(body.ack))
    }
}
