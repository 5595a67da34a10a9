//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Keep-alive settings for a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAlive {
    /// Interval between pings in milliseconds.
    pub interval_ms: u64,
    /// Time allowed for the matching pong in milliseconds.
    pub timeout_ms: u64,
}

impl KeepAlive {
    /// Ping interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Pong deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

/// Extra header sent with the websocket handshake (proxy allow-lists).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowHeader {
    pub name: String,
    pub value: String,
}

/// Where to connect and with which credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Websocket URL (or any address understood by the connector).
    pub url: String,
    /// Opaque credential, sent as a bearer token.
    pub token: Option<String>,
    /// Optional extra header.
    pub allow_header: Option<AllowHeader>,
}

impl Endpoint {
    /// Endpoint without credentials.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            allow_header: None,
        }
    }
}

/// Configuration for a reconnecting session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote URL.
    pub url: String,
    /// Opaque credential.
    pub token: Option<String>,
    /// Optional extra handshake header.
    pub allow_header: Option<AllowHeader>,
    /// Single connect attempt budget in milliseconds.
    pub connect_timeout_ms: u64,
    /// Fixed delay between reconnect attempts in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Default deadline for `call` in milliseconds.
    pub call_timeout_ms: u64,
    /// Channel keep-alive.
    pub keep_alive: KeepAlive,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/ws".into(),
            token: None,
            allow_header: None,
            connect_timeout_ms: 10_000,
            reconnect_delay_ms: 500,
            call_timeout_ms: 30_000,
            keep_alive: KeepAlive::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration for `url` with every other value defaulted.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Connect attempt budget.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay between reconnect attempts.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Default call deadline.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// The endpoint handed to the connector.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            url: self.url.clone(),
            token: self.token.clone(),
            allow_header: self.allow_header.clone(),
        }
    }

    /// Load from `TETHER_*` environment variables on top of the defaults.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup on top of the defaults.
    ///
    /// # Errors
    /// Returns error if a numeric value does not parse, or if only one half
    /// of the allow header is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TETHER_URL") {
            config.url = url;
        }
        config.token = lookup("TETHER_TOKEN").filter(|t| !t.is_empty());

        let millis = |key: &str, target: &mut u64| -> Result<(), ConfigError> {
            if let Some(raw) = lookup(key) {
                *target = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_owned(),
                    value: raw.clone(),
                })?;
            }
            Ok(())
        };
        millis("TETHER_CONNECT_TIMEOUT_MS", &mut config.connect_timeout_ms)?;
        millis("TETHER_RECONNECT_DELAY_MS", &mut config.reconnect_delay_ms)?;
        millis("TETHER_CALL_TIMEOUT_MS", &mut config.call_timeout_ms)?;
        millis("TETHER_PING_INTERVAL_MS", &mut config.keep_alive.interval_ms)?;
        millis("TETHER_PING_TIMEOUT_MS", &mut config.keep_alive.timeout_ms)?;

        config.allow_header = match (
            lookup("TETHER_ALLOW_HEADER_NAME"),
            lookup("TETHER_ALLOW_HEADER_VALUE"),
        ) {
            (Some(name), Some(value)) => Some(AllowHeader { name, value }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::Missing("TETHER_ALLOW_HEADER_VALUE".into()));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Missing("TETHER_ALLOW_HEADER_NAME".into()));
            }
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_keep_alive_contract() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.keep_alive.interval(), Duration::from_secs(30));
        assert_eq!(cfg.keep_alive.timeout(), Duration::from_secs(10));
        assert_eq!(cfg.reconnect_delay(), Duration::from_millis(500));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let cfg = SessionConfig::from_lookup(lookup(&[
            ("TETHER_URL", "ws://hub:9000/ws"),
            ("TETHER_TOKEN", "secret"),
            ("TETHER_RECONNECT_DELAY_MS", "250"),
            ("TETHER_PING_INTERVAL_MS", "1000"),
        ]))
        .unwrap();
        assert_eq!(cfg.url, "ws://hub:9000/ws");
        assert_eq!(cfg.token.as_deref(), Some("secret"));
        assert_eq!(cfg.reconnect_delay_ms, 250);
        assert_eq!(cfg.keep_alive.interval_ms, 1000);
        assert_eq!(cfg.call_timeout_ms, 30_000);
    }

    #[test]
    fn bad_number_is_rejected() {
        let err = SessionConfig::from_lookup(lookup(&[("TETHER_CALL_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "TETHER_CALL_TIMEOUT_MS".into(),
                value: "soon".into()
            }
        );
    }

    #[test]
    fn half_allow_header_is_rejected() {
        let err = SessionConfig::from_lookup(lookup(&[("TETHER_ALLOW_HEADER_NAME", "X-Allow")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("TETHER_ALLOW_HEADER_VALUE".into()));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"url":"ws://x/ws","keep_alive":{"interval_ms":5}}"#).unwrap();
        assert_eq!(cfg.url, "ws://x/ws");
        assert_eq!(cfg.keep_alive.interval_ms, 5);
        assert_eq!(cfg.keep_alive.timeout_ms, 10_000);
        assert_eq!(cfg.connect_timeout_ms, 10_000);
    }

    #[test]
    fn endpoint_carries_credentials() {
        let mut cfg = SessionConfig::new("ws://a/ws");
        cfg.token = Some("t".into());
        let endpoint = cfg.endpoint();
        assert_eq!(endpoint.url, "ws://a/ws");
        assert_eq!(endpoint.token.as_deref(), Some("t"));
    }
}
