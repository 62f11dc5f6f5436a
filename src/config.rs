use crate::ai::{ChatError, ChatResult, ResponseMode};
use crate::rate_limit::{DEFAULT_COOLDOWN, DEFAULT_MESSAGE_LIMIT, RateLimitConfig};
use crate::storage::default_data_dir;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_API_KEY_HEADER: &str = "RHYLIIEEE-API-KEY";
const DEFAULT_IP_LOOKUP_URL: &str = "https://api.ipify.org?format=json";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq)]
pub struct ChatConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub mode: ResponseMode,
    /// Longest silence tolerated while connecting or between body chunks.
    pub idle_timeout: Duration,
    pub ip_lookup_url: String,
    pub data_dir: PathBuf,
    pub message_limit: u32,
    pub cooldown: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            mode: ResponseMode::default(),
            idle_timeout: DEFAULT_TIMEOUT,
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.to_string(),
            data_dir: default_data_dir(),
            message_limit: DEFAULT_MESSAGE_LIMIT,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl ChatConfig {
    /// Reads `STEVE_CHAT_*` variables from the process environment.
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source. Blank values count as unset
    /// and unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ChatResult<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let mode = match var("STEVE_CHAT_MODE") {
            Some(raw) => raw.parse::<ResponseMode>()?,
            None => defaults.mode,
        };
        let api_url = var("STEVE_CHAT_API_URL").unwrap_or(defaults.api_url);
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ChatError::Config(format!(
                "STEVE_CHAT_API_URL must be an http(s) URL, got '{api_url}'"
            )));
        }

        Ok(Self {
            api_url,
            api_key: var("STEVE_CHAT_API_KEY"),
            api_key_header: var("STEVE_CHAT_API_KEY_HEADER").unwrap_or(defaults.api_key_header),
            mode,
            idle_timeout: var("STEVE_CHAT_TIMEOUT_SECS")
                .and_then(|raw| raw.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            ip_lookup_url: var("STEVE_CHAT_IP_LOOKUP_URL").unwrap_or(defaults.ip_lookup_url),
            data_dir: var("STEVE_CHAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            message_limit: var("STEVE_CHAT_MESSAGE_LIMIT")
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(defaults.message_limit),
            cooldown: var("STEVE_CHAT_COOLDOWN_SECS")
                .and_then(|raw| raw.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
        })
    }

    pub fn rate_limits(&self) -> RateLimitConfig {
        RateLimitConfig::new()
            .with_message_limit(self.message_limit)
            .with_cooldown(self.cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> ChatResult<ChatConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ChatConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.api_key, None);
        assert_eq!(config.api_key_header, "RHYLIIEEE-API-KEY");
        assert_eq!(config.mode, ResponseMode::Buffered);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.rate_limits(), RateLimitConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("STEVE_CHAT_API_URL", "https://agent.example.com"),
            ("STEVE_CHAT_API_KEY", "secret"),
            ("STEVE_CHAT_MODE", "streamed"),
            ("STEVE_CHAT_TIMEOUT_SECS", "30"),
            ("STEVE_CHAT_DATA_DIR", "/tmp/steve"),
            ("STEVE_CHAT_MESSAGE_LIMIT", "3"),
            ("STEVE_CHAT_COOLDOWN_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(config.api_url, "https://agent.example.com");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.mode, ResponseMode::Streamed);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/steve"));
        assert_eq!(config.message_limit, 3);
        assert_eq!(config.cooldown, Duration::from_secs(60));
    }

    #[test]
    fn bad_numbers_fall_back_and_blank_is_unset() {
        let config = config_from(&[
            ("STEVE_CHAT_TIMEOUT_SECS", "soon"),
            ("STEVE_CHAT_MESSAGE_LIMIT", "-1"),
            ("STEVE_CHAT_API_KEY", "  "),
        ])
        .unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.message_limit, 10);
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn rejects_unknown_mode_and_bad_url() {
        assert!(matches!(
            config_from(&[("STEVE_CHAT_MODE", "carrier-pigeon")]),
            Err(ChatError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("STEVE_CHAT_API_URL", "localhost:8000")]),
            Err(ChatError::Config(_))
        ));
    }
}
