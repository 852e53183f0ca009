//! ============================================================================
//! Engine Configuration
//! ============================================================================
//! All knobs of the credit engine. Loaded from the process environment (after
//! an optional `.env` file); every value has a default matching production.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::rate_limit::RateLimitPolicy;
use crate::types::{EngineError, EngineResult};

/// Credits a brand-new account starts with
pub const DEFAULT_START_CREDITS: u64 = 15;

/// Credits granted per successful token redemption
pub const DEFAULT_VERIFY_BONUS: u64 = 10;

/// Balance below which a held tier is revoked
pub const DEFAULT_PREMIUM_FLOOR: u64 = 20;

/// One day in seconds
pub const DAY_SECS: i64 = 86_400;

/// Operator-local day boundary for "today" statistics (UTC+05:30)
pub const DEFAULT_STATS_UTC_OFFSET_MINUTES: i32 = 330;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bot username used in deep links
    pub bot_username: String,
    /// Host serving deep links
    pub link_domain: String,
    /// Messaging platform bot token (only needed for the bot API transport)
    pub bot_token: Option<String>,
    /// Shortener host, e.g. "publicearn.com"
    pub shortlink_url: Option<String>,
    pub shortlink_api_key: Option<String>,
    pub start_credits: u64,
    pub verify_bonus: u64,
    /// Redemption events per window
    pub verify_limit: RateLimitPolicy,
    /// Operator-assisted top-up credits per window
    pub top_up_limit: RateLimitPolicy,
    pub premium_floor: u64,
    pub stats_utc_offset_minutes: i32,
    pub db_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bot_username: "creditgate_bot".to_string(),
            link_domain: "t.me".to_string(),
            bot_token: None,
            shortlink_url: None,
            shortlink_api_key: None,
            start_credits: DEFAULT_START_CREDITS,
            verify_bonus: DEFAULT_VERIFY_BONUS,
            verify_limit: RateLimitPolicy::events(2, DAY_SECS),
            top_up_limit: RateLimitPolicy::credits(20, DAY_SECS),
            premium_floor: DEFAULT_PREMIUM_FLOOR,
            stats_utc_offset_minutes: DEFAULT_STATS_UTC_OFFSET_MINUTES,
            db_path: None,
        }
    }
}

impl EngineConfig {
    /// Load `.env` (if present) into the process environment, then `from_env`
    pub fn load() -> EngineResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Failed to read .env file: {}", e);
            }
        }
        Self::from_env()
    }

    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> EngineResult<Self> {
        let defaults = Self::default();

        let verify_max = env_parse("VERIFY_MAX_EVENTS", defaults.verify_limit.max_weight)?;
        let verify_window = env_parse("VERIFY_WINDOW_SECS", defaults.verify_limit.window_secs)?;
        let top_up_max = env_parse("TOPUP_MAX_CREDITS", defaults.top_up_limit.max_weight)?;
        let top_up_window = env_parse("TOPUP_WINDOW_SECS", defaults.top_up_limit.window_secs)?;

        let config = Self {
            bot_username: env_string("BOT_USERNAME").unwrap_or(defaults.bot_username),
            link_domain: env_string("BOT_LINK_DOMAIN").unwrap_or(defaults.link_domain),
            bot_token: env_string("TG_BOT_TOKEN"),
            shortlink_url: env_string("SHORTLINK_URL"),
            shortlink_api_key: env_string("SHORTLINK_API"),
            start_credits: env_parse("START_CREDITS", defaults.start_credits)?,
            verify_bonus: env_parse("VERIFY_BONUS", defaults.verify_bonus)?,
            verify_limit: RateLimitPolicy::events(verify_max, verify_window),
            top_up_limit: RateLimitPolicy::credits(top_up_max, top_up_window),
            premium_floor: env_parse("PREMIUM_FLOOR", defaults.premium_floor)?,
            stats_utc_offset_minutes: env_parse(
                "STATS_UTC_OFFSET_MINUTES",
                defaults.stats_utc_offset_minutes,
            )?,
            db_path: env_string("CREDITGATE_DB_PATH"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.bot_username.trim().is_empty() {
            return Err(EngineError::Config("BOT_USERNAME must not be empty".to_string()));
        }
        if self.verify_limit.window_secs <= 0 || self.top_up_limit.window_secs <= 0 {
            return Err(EngineError::Config("rate-limit windows must be positive".to_string()));
        }
        if self.shortlink_url.is_some() != self.shortlink_api_key.is_some() {
            warn!("Only one of SHORTLINK_URL / SHORTLINK_API is set - links will not be shortened");
        }
        Ok(())
    }

    /// Deep link that launches the bot, without payload
    pub fn deep_link_base(&self) -> String {
        format!("https://{}/{}", self.link_domain, self.bot_username)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> EngineResult<T>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{} is invalid ({}): {}", key, raw, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.start_credits, 15);
        assert_eq!(config.verify_bonus, 10);
        assert_eq!(config.verify_limit, RateLimitPolicy::events(2, DAY_SECS));
        assert_eq!(config.top_up_limit, RateLimitPolicy::credits(20, DAY_SECS));
        assert_eq!(config.premium_floor, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deep_link_base() {
        let config = EngineConfig {
            bot_username: "files_bot".to_string(),
            ..Default::default()
        };
        assert_eq!(config.deep_link_base(), "https://t.me/files_bot");
    }

    #[test]
    fn test_validate_rejects_empty_username() {
        let config = EngineConfig {
            bot_username: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_env_parse_reports_key() {
        std::env::set_var("CREDITGATE_TEST_BAD_NUMBER", "abc");
        let err = env_parse::<u64>("CREDITGATE_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("CREDITGATE_TEST_BAD_NUMBER"));
        std::env::remove_var("CREDITGATE_TEST_BAD_NUMBER");
    }
}
