use crate::config::{Endpoints, PING_TIMEOUT, REQUEST_TIMEOUT};
use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use opc_core::wire::{
    CancelResponse, SubmitTaskRequest, SubmitTaskResponse, UserAssistRequest, UserAssistResponse,
};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Text frames from a session's push channel. The stream ends on a clean
/// close and yields an error when the channel fails.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub length_hint: Option<u64>,
}

impl Screenshot {
    /// Bytes charged to usage accounting: the advertised length when the
    /// agent sent one, else the payload size.
    pub fn accounted_bytes(&self) -> u64 {
        self.length_hint.unwrap_or(self.bytes.len() as u64)
    }
}

/// Everything the console asks of a session agent.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn screenshot(&self, address: &str) -> Result<Screenshot, TransportError>;

    async fn ping(&self, address: &str) -> Result<(), TransportError>;

    async fn submit_task(
        &self,
        address: &str,
        request: &SubmitTaskRequest,
    ) -> Result<SubmitTaskResponse, TransportError>;

    async fn cancel_task(
        &self,
        address: &str,
        task_id: &str,
    ) -> Result<CancelResponse, TransportError>;

    async fn user_assist(
        &self,
        address: &str,
        request: &UserAssistRequest,
    ) -> Result<UserAssistResponse, TransportError>;

    async fn mouse_click(&self, address: &str) -> Result<(), TransportError>;

    async fn mouse_move(&self, address: &str, x: i32, y: i32) -> Result<(), TransportError>;

    /// Resolves once the channel is open.
    async fn open_channel(&self, address: &str) -> Result<FrameStream, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpTransport {
    pub fn new(endpoints: Endpoints) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::from_reqwest("client", err))?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| TransportError::from_reqwest(url, err))
    }
}

async fn read_json<T>(url: &str, response: reqwest::Response) -> Result<T, TransportError>
where
    T: DeserializeOwned + Default,
{
    let body = response
        .text()
        .await
        .map_err(|err| TransportError::from_reqwest(url, err))?;
    if body.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&body).map_err(|err| TransportError::Decode {
        url: url.to_string(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl SessionTransport for HttpTransport {
    async fn screenshot(&self, address: &str) -> Result<Screenshot, TransportError> {
        let url = self.endpoints.http_url(address, "/screenshot");
        let response = self.send(&url, self.client.get(&url)).await?;
        let length_hint = response.content_length();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(&url, err))?;
        Ok(Screenshot {
            bytes: bytes.to_vec(),
            length_hint,
        })
    }

    async fn ping(&self, address: &str) -> Result<(), TransportError> {
        let url = self.endpoints.http_url(address, "/ping");
        self.send(&url, self.client.get(&url).timeout(PING_TIMEOUT))
            .await
            .map(|_| ())
    }

    async fn submit_task(
        &self,
        address: &str,
        request: &SubmitTaskRequest,
    ) -> Result<SubmitTaskResponse, TransportError> {
        let url = self.endpoints.http_url(address, "/llm-input");
        let response = self.send(&url, self.client.post(&url).json(request)).await?;
        read_json(&url, response).await
    }

    async fn cancel_task(
        &self,
        address: &str,
        task_id: &str,
    ) -> Result<CancelResponse, TransportError> {
        let url = self.endpoints.http_url(address, "/task-cancel");
        let request = self.client.post(&url).query(&[("taskId", task_id)]);
        let response = self.send(&url, request).await?;
        read_json(&url, response).await
    }

    async fn user_assist(
        &self,
        address: &str,
        request: &UserAssistRequest,
    ) -> Result<UserAssistResponse, TransportError> {
        let url = self.endpoints.http_url(address, "/user-assist");
        let response = self.send(&url, self.client.post(&url).json(request)).await?;
        read_json(&url, response).await
    }

    async fn mouse_click(&self, address: &str) -> Result<(), TransportError> {
        let url = self.endpoints.http_url(address, "/mouse-click");
        self.send(&url, self.client.get(&url)).await.map(|_| ())
    }

    async fn mouse_move(&self, address: &str, x: i32, y: i32) -> Result<(), TransportError> {
        let url = self.endpoints.http_url(address, "/mouse-input");
        let request = self.client.get(&url).query(&[("x", x), ("y", y)]);
        self.send(&url, request).await.map(|_| ())
    }

    async fn open_channel(&self, address: &str) -> Result<FrameStream, TransportError> {
        let url = self.endpoints.channel_url(address);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Channel(format!("{url}: {err}")))?;
        debug!(event = "channel_connected", url = %url);

        let frames = ws.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!(event = "channel_binary_frame_skipped");
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::Channel(err.to_string()))),
            }
        });
        Ok(Box::pin(frames))
    }
}
