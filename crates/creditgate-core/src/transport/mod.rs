//! ============================================================================
//! Transport Module - Messaging platform seam
//! ============================================================================
//! The engine only needs to push content to a recipient and to know which of
//! three kinds of failure came back:
//! - transient rate limit (with the platform's retry delay)
//! - permanent (recipient blocked the bot, or the account is gone)
//! - anything else
//!
//! ## Usage
//! ```rust,ignore
//! use creditgate_core::transport::{BotApiTransport, send_with_retry, RetryPolicy};
//!
//! let transport = BotApiTransport::new(&bot_token);
//! let outcome = send_with_retry(&transport, user_id, &content, &RetryPolicy::default()).await;
//! ```
//! ============================================================================

mod bot_api;
mod retry;

pub use bot_api::BotApiTransport;
pub use retry::{send_with_retry, DeliveryOutcome, RetryPolicy};

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{Content, UserId};

/// Fallback wait when the platform signals a rate limit without a delay
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Delivery failure, classified
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Recipient blocked the bot")]
    Blocked,

    #[error("Recipient account is deactivated")]
    Deactivated,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Blocked and deactivated recipients will never accept a message again
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Blocked | TransportError::Deactivated)
    }
}

/// Narrow send capability the engine consumes
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    async fn send(&self, recipient: UserId, content: &Content) -> Result<(), TransportError>;
}

/// Classify a platform error description.
/// `retry_after_secs` is the structured delay when the platform provides one.
pub fn classify_error(description: &str, retry_after_secs: Option<u64>) -> TransportError {
    let lower = description.to_lowercase();

    if lower.contains("too many requests")
        || lower.contains("flood")
        || lower.contains("retry after")
        || lower.contains("429")
    {
        let retry_after = retry_after_secs
            .or_else(|| parse_retry_after(&lower))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER);
        return TransportError::RateLimited { retry_after };
    }

    if lower.contains("deactivated") || lower.contains("user is deleted") {
        return TransportError::Deactivated;
    }

    if lower.contains("blocked by the user") || lower.contains("user is blocked") {
        return TransportError::Blocked;
    }

    TransportError::Other(description.to_string())
}

/// Pull N out of "... retry after N"
fn parse_retry_after(lower: &str) -> Option<u64> {
    let (_, rest) = lower.split_once("retry after")?;
    rest.trim_start()
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|digits| digits.parse().ok())
}

/// Argument of a `/start` command, if any
pub fn resolve_start_payload(text: &str) -> Option<&str> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let command = parts.next()?;
    let command = command.split('@').next().unwrap_or(command);
    if command != "/start" {
        return None;
    }
    parts.next().map(str::trim).filter(|payload| !payload.is_empty())
}

/// What a `/start` payload asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPayload<'a> {
    /// Plain start, no payload
    Empty,
    /// Verification deep link carrying a token
    Verify(&'a str),
    /// Encoded content reference
    Content(&'a str),
}

impl<'a> StartPayload<'a> {
    pub const VERIFY_PREFIX: &'static str = "verify_";

    pub fn parse(text: &'a str) -> Self {
        match resolve_start_payload(text) {
            None => StartPayload::Empty,
            Some(payload) => match payload.strip_prefix(Self::VERIFY_PREFIX) {
                Some(token) => StartPayload::Verify(token),
                None => StartPayload::Content(payload),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_error("Too Many Requests: retry after 7", None),
            TransportError::RateLimited { retry_after: Duration::from_secs(7) }
        );
        assert_eq!(
            classify_error("Too Many Requests", Some(3)),
            TransportError::RateLimited { retry_after: Duration::from_secs(3) }
        );
        assert_eq!(
            classify_error("FLOOD_WAIT", None),
            TransportError::RateLimited { retry_after: DEFAULT_RETRY_AFTER }
        );
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(
            classify_error("Forbidden: bot was blocked by the user", None),
            TransportError::Blocked
        );
        assert_eq!(
            classify_error("Forbidden: user is deactivated", None),
            TransportError::Deactivated
        );
        assert_eq!(classify_error("INPUT_USER_DEACTIVATED", None), TransportError::Deactivated);
        assert!(TransportError::Blocked.is_permanent());
        assert!(!TransportError::Other("x".into()).is_permanent());
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(
            classify_error("Bad Request: chat not found", None),
            TransportError::Other("Bad Request: chat not found".to_string())
        );
    }

    #[test]
    fn test_resolve_start_payload() {
        assert_eq!(resolve_start_payload("/start abc"), Some("abc"));
        assert_eq!(resolve_start_payload("/start@files_bot  abc "), Some("abc"));
        assert_eq!(resolve_start_payload("/start"), None);
        assert_eq!(resolve_start_payload("/help abc"), None);
    }

    #[test]
    fn test_start_payload_kinds() {
        assert_eq!(StartPayload::parse("/start verify_tok123"), StartPayload::Verify("tok123"));
        assert_eq!(StartPayload::parse("/start Z2V0LTEyMw"), StartPayload::Content("Z2V0LTEyMw"));
        assert_eq!(StartPayload::parse("/start"), StartPayload::Empty);
    }
}
