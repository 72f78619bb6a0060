use opc_core::AddressError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("push channel error: {0}")]
    Channel(String),
    #[error("request to {url} timed out")]
    Timeout { url: String },
}

impl TransportError {
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return TransportError::Timeout {
                url: url.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            };
        }
        if err.is_decode() {
            return TransportError::Decode {
                url: url.to_string(),
                reason: err.to_string(),
            };
        }
        TransportError::Request {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("config error: {0}")]
    Config(String),
}

pub type ConsoleResult<T> = Result<T, ConsoleError>;
