//! ============================================================================
//! Bot API Transport - Messaging platform HTTP API
//! ============================================================================
//! Delivers content through the platform's bot HTTP API:
//! - `sendMessage` for text
//! - `copyMessage` for stored files/posts
//! Error replies are classified into `TransportError`.
//! ============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{classify_error, MessagingTransport, TransportError};
use crate::types::{Content, UserId};

/// Bot API base URL
const BOT_API: &str = "https://api.telegram.org";

/// Transport backed by the bot HTTP API
pub struct BotApiTransport {
    client: reqwest::Client,
    base_url: String,
    protect_content: bool,
}

impl BotApiTransport {
    /// Create a new transport with the bot token
    pub fn new(bot_token: &str) -> Self {
        Self::with_api_base(BOT_API, bot_token)
    }

    /// Point at a different API host (self-hosted bot API server)
    pub fn with_api_base(api_base: &str, bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
            protect_content: false,
        }
    }

    /// Forbid forwarding/saving of copied content
    pub fn protect_content(mut self, protect: bool) -> Self {
        self.protect_content = protect;
        self
    }

    async fn call<T: Serialize + ?Sized>(&self, method: &str, body: &T) -> Result<(), TransportError> {
        let url = format!("{}/{}", self.base_url, method);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to reach bot API: {}", e)))?;

        let status = response.status();
        let reply: ApiResponse = response.json().await.map_err(|e| {
            TransportError::Other(format!("Failed to parse bot API response ({}): {}", status, e))
        })?;

        interpret_response(reply)
    }
}

#[async_trait]
impl MessagingTransport for BotApiTransport {
    async fn send(&self, recipient: UserId, content: &Content) -> Result<(), TransportError> {
        match content {
            Content::Text { text } => {
                debug!("sendMessage to {}", recipient);
                let request = SendMessageRequest {
                    chat_id: recipient,
                    text,
                    disable_web_page_preview: true,
                };
                self.call("sendMessage", &request).await
            }
            Content::Copy { from_chat, message_id } => {
                debug!("copyMessage {}/{} to {}", from_chat, message_id, recipient);
                let request = CopyMessageRequest {
                    chat_id: recipient,
                    from_chat_id: *from_chat,
                    message_id: *message_id,
                    protect_content: self.protect_content,
                };
                self.call("copyMessage", &request).await
            }
        }
    }
}

/// Map an API envelope onto success or a classified error
fn interpret_response(reply: ApiResponse) -> Result<(), TransportError> {
    if reply.ok {
        return Ok(());
    }

    let retry_after = reply.parameters.and_then(|p| p.retry_after);
    let description = reply.description.unwrap_or_else(|| "unknown error".to_string());

    if reply.error_code == Some(429) {
        return Err(TransportError::RateLimited {
            retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
        });
    }

    Err(classify_error(&description, retry_after))
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct CopyMessageRequest {
    chat_id: i64,
    from_chat_id: i64,
    message_id: i64,
    protect_content: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<(), TransportError> {
        interpret_response(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_ok_reply() {
        assert_eq!(parse(r#"{"ok":true,"result":{"message_id":5}}"#), Ok(()));
    }

    #[test]
    fn test_flood_reply_uses_parameters() {
        let result = parse(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 12","parameters":{"retry_after":12}}"#,
        );
        assert_eq!(
            result,
            Err(TransportError::RateLimited { retry_after: Duration::from_secs(12) })
        );
    }

    #[test]
    fn test_forbidden_replies() {
        assert_eq!(
            parse(r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#),
            Err(TransportError::Blocked)
        );
        assert_eq!(
            parse(r#"{"ok":false,"error_code":403,"description":"Forbidden: user is deactivated"}"#),
            Err(TransportError::Deactivated)
        );
    }

    #[test]
    fn test_base_url() {
        let transport = BotApiTransport::with_api_base("http://localhost:8081/", "123:abc");
        assert_eq!(transport.base_url, "http://localhost:8081/bot123:abc");
    }
}
