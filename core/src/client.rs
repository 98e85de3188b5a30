use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use reqwest::header::COOKIE;
use tracing::debug;
use tracing::warn;

use crate::config::ClientConfig;
use crate::error::ClientErr;
use crate::models::ChatRequest;
use crate::models::Message;

/// Name of the cookie carrying the opaque bearer token.
pub const AUTH_COOKIE: &str = "Authorization";

/// Raw reply bytes as delivered by the relay.
pub type ReplyStream = BoxStream<'static, Result<Bytes, ClientErr>>;

/// The HTTP surface the conversation controller talks to.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Posts the full conversation and returns the streamed reply. Fails
    /// with [`ClientErr::Network`] on a non-success status.
    async fn post_chat(&self, messages: Vec<Message>) -> Result<ReplyStream, ClientErr>;
}

/// Client for a relay serving `POST /api/chat` and `GET /api/verify`.
#[derive(Debug, Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RelayClient {
    pub fn new(config: &ClientConfig, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.relay_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn with_cookie(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header(
                COOKIE,
                format!("{AUTH_COOKIE}={}", urlencoding::encode(token)),
            ),
            None => req,
        }
    }

    /// Asks the relay whether the current credential is accepted. `false`
    /// means the caller should send the user to log in again.
    pub async fn verify_session(&self) -> Result<bool, ClientErr> {
        let url = format!("{}/api/verify", self.base_url);
        let res = self.with_cookie(self.client.get(&url)).send().await?;
        debug!(status = %res.status(), "GET /api/verify");
        Ok(res.status().is_success())
    }
}

#[async_trait]
impl ChatBackend for RelayClient {
    async fn post_chat(&self, messages: Vec<Message>) -> Result<ReplyStream, ClientErr> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(url, messages = messages.len(), "POST (chat)");

        let res = self
            .with_cookie(self.client.post(&url))
            .json(&ChatRequest { messages })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            warn!(%status, "relay rejected chat request");
            return Err(ClientErr::Network { status });
        }

        Ok(res.bytes_stream().map_err(ClientErr::Reqwest).boxed())
    }
}
