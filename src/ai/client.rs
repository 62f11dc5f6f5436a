use crate::config::ChatConfig;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::str::FromStr;
use tracing::{debug, warn};

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    #[error("HTTP error! status: {status}, detail: {detail}")]
    Status { status: u16, detail: String },

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Timeout
        } else {
            ChatError::Transport(err.to_string())
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Raw response body as delivered by the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = ChatResult<Vec<u8>>> + Send>>;

// ============================================
// Request
// ============================================

/// Which assistant endpoint to talk to.
///
/// Both return newline-delimited JSON events; the streamed variant
/// additionally emits `token` events ahead of the final response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    #[default]
    Buffered,
    Streamed,
}

impl ResponseMode {
    pub fn path(self) -> &'static str {
        match self {
            ResponseMode::Buffered => "/ai/steve/v1/chat/no-stream",
            ResponseMode::Streamed => "/ai/steve/v1/chat/stream-tokens",
        }
    }

    /// Whether a turn starts with an empty agent message that tokens fill in.
    pub fn uses_placeholder(self) -> bool {
        matches!(self, ResponseMode::Streamed)
    }
}

impl FromStr for ResponseMode {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buffered" | "no-stream" => Ok(ResponseMode::Buffered),
            "streamed" | "stream" | "stream-tokens" => Ok(ResponseMode::Streamed),
            other => Err(ChatError::Config(format!(
                "unknown response mode '{other}', expected 'buffered' or 'streamed'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub thread_id: String,
}

// ============================================
// Transport
// ============================================

/// Sends one user message to the assistant and hands back the response body.
#[async_trait]
pub trait AssistantTransport: Send + Sync {
    async fn send(&self, request: &ChatRequest, mode: ResponseMode) -> ChatResult<ByteStream>;
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: String,
}

impl HttpTransport {
    pub fn new(config: &ChatConfig) -> ChatResult<Self> {
        // bounds stalls, not the length of a healthy token stream
        let client = Client::builder()
            .connect_timeout(config.idle_timeout)
            .read_timeout(config.idle_timeout)
            .build()
            .map_err(ChatError::from)?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
        })
    }

    fn endpoint(&self, mode: ResponseMode) -> String {
        format!("{}{}", self.base_url, mode.path())
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// Pulls a human readable detail out of an error response body.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: Some(serde_json::Value::String(detail)),
        }) => detail,
        Ok(ErrorBody {
            detail: Some(detail),
        }) if !detail.is_null() => detail.to_string(),
        Ok(_) => "Unknown error".to_string(),
        Err(_) if !body.trim().is_empty() => body.trim().to_string(),
        Err(_) => "Unknown error".to_string(),
    }
}

#[async_trait]
impl AssistantTransport for HttpTransport {
    async fn send(&self, request: &ChatRequest, mode: ResponseMode) -> ChatResult<ByteStream> {
        let url = self.endpoint(mode);
        debug!(%url, thread_id = %request.thread_id, "sending chat message");

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header(self.api_key_header.as_str(), key.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "assistant endpoint rejected request");
            return Err(ChatError::Status {
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ChatError::from));
        Ok(Box::pin(body))
    }
}
