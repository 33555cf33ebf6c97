//! Transport configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use super::KeepalivePolicy;
use crate::core::{
    ConfigError, DEFAULT_ACK_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_CONTROL_FLUSH_DELAY,
    DEFAULT_KEEPALIVE_EXPIRY,
};
use crate::wire::Format;

/// Prefix of string options addressed to a named transport.
pub const OPTION_PREFIX: &str = "transport.";

/// Option key: enable or disable the transport.
pub const OPTION_ENABLED: &str = "enabled";
/// Option key: transport priority.
pub const OPTION_PRIORITY: &str = "priority";
/// Option key: wire format.
pub const OPTION_FORMAT: &str = "format";
/// Option key: keepalive interval (`disabled`, `default` or seconds).
pub const OPTION_KEEPALIVE_INTERVAL: &str = "keepalive.interval";
/// Option key: keepalive expiry in milliseconds.
pub const OPTION_KEEPALIVE_EXPIRY: &str = "keepalive.expiry";

/// Per-transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Transport name, used in logs and option prefixes.
    pub name: String,

    /// Whether the transport may connect.
    pub enabled: bool,

    /// Ranking among an endpoint's transports.
    pub priority: i32,

    /// Wire format.
    pub format: Format,

    /// Keepalive interval policy.
    pub keepalive: KeepalivePolicy,

    /// Grace period for an unanswered keepalive; also bounds the close
    /// handshake.
    pub keepalive_expiry: Duration,

    /// Connect attempts still unresolved after this are torn down.
    pub connect_timeout: Duration,

    /// Delay before buffered control frames are flushed on (re)connect.
    pub control_flush_delay: Duration,

    /// Bytes of ack entries batched into one ACK frame.
    pub ack_buffer_size: usize,

    /// Carrier-specific options.
    pub options: BTreeMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "transport".to_string(),
            enabled: true,
            priority: 0,
            format: Format::Regular,
            keepalive: KeepalivePolicy::Default,
            keepalive_expiry: DEFAULT_KEEPALIVE_EXPIRY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            control_flush_delay: DEFAULT_CONTROL_FLUSH_DELAY,
            ack_buffer_size: DEFAULT_ACK_BUFFER_SIZE,
            options: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    /// Apply a string option.
    ///
    /// Keys may be given bare (`keepalive.interval`) or addressed to this
    /// transport (`transport.<name>.keepalive.interval`). Options addressed
    /// to another transport are ignored. Unknown keys are kept in
    /// [`options`](Self::options) for the carrier.
    pub fn configure(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let key = match key.strip_prefix(OPTION_PREFIX) {
            Some(rest) => match rest
                .strip_prefix(self.name.as_str())
                .and_then(|r| r.strip_prefix('.'))
            {
                Some(own) => own,
                None => return Ok(()),
            },
            None => key,
        };
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            OPTION_ENABLED => self.enabled = parse_bool(value).ok_or_else(invalid)?,
            OPTION_PRIORITY => self.priority = value.trim().parse().map_err(|_| invalid())?,
            OPTION_FORMAT => self.format = value.parse().map_err(|_| invalid())?,
            OPTION_KEEPALIVE_INTERVAL => {
                self.keepalive = value.parse().map_err(|_| invalid())?;
            }
            OPTION_KEEPALIVE_EXPIRY => {
                let ms: u64 = value.trim().parse().map_err(|_| invalid())?;
                self.keepalive_expiry = Duration::from_millis(ms);
            }
            other => {
                self.options.insert(other.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Carrier option lookup.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Carrier options joined as `key=value;...`.
    pub fn options_string(&self) -> String {
        self.options
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Builder for creating a [`TransportConfig`].
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Enable or disable the transport.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.config.priority = priority;
        self
    }

    /// Set the wire format.
    pub fn format(mut self, format: Format) -> Self {
        self.config.format = format;
        self
    }

    /// Set the keepalive interval policy.
    pub fn keepalive(mut self, policy: KeepalivePolicy) -> Self {
        self.config.keepalive = policy;
        self
    }

    /// Set the keepalive expiry.
    pub fn keepalive_expiry(mut self, expiry: Duration) -> Self {
        self.config.keepalive_expiry = expiry;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the control-frame flush delay.
    pub fn control_flush_delay(mut self, delay: Duration) -> Self {
        self.config.control_flush_delay = delay;
        self
    }

    /// Set the ack batch size in bytes.
    pub fn ack_buffer_size(mut self, size: usize) -> Self {
        self.config.ack_buffer_size = size;
        self
    }

    /// Set a carrier option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.options.insert(key.into(), value.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert!(config.enabled);
        assert_eq!(config.format, Format::Regular);
        assert_eq!(config.keepalive, KeepalivePolicy::Default);
        assert_eq!(config.keepalive_expiry, Duration::from_millis(5000));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.ack_buffer_size, 640);
    }

    #[test]
    fn test_builder() {
        let config = TransportConfigBuilder::new()
            .name("loopback")
            .priority(-100)
            .format(Format::SevenBit)
            .keepalive(KeepalivePolicy::Interval(30))
            .option("remote", "peer-1")
            .build();
        assert_eq!(config.name, "loopback");
        assert_eq!(config.priority, -100);
        assert_eq!(config.format, Format::SevenBit);
        assert_eq!(config.keepalive, KeepalivePolicy::Interval(30));
        assert_eq!(config.option("remote"), Some("peer-1"));
    }

    #[test]
    fn test_configure_prefixed_and_bare() {
        let mut config = TransportConfigBuilder::new().name("socket").build();
        config.configure("transport.socket.keepalive.interval", "45").unwrap();
        config.configure("keepalive.expiry", "1200").unwrap();
        config.configure("transport.socket.format", "7bit").unwrap();
        config.configure("transport.http.enabled", "false").unwrap();
        config.configure("transport.socket.host", "example.org").unwrap();

        assert_eq!(config.keepalive, KeepalivePolicy::Interval(45));
        assert_eq!(config.keepalive_expiry, Duration::from_millis(1200));
        assert_eq!(config.format, Format::SevenBit);
        assert!(config.enabled);
        assert_eq!(config.option("host"), Some("example.org"));
        assert_eq!(config.options_string(), "host=example.org");
    }

    #[test]
    fn test_configure_rejects_bad_values() {
        let mut config = TransportConfig::default();
        let err = config.configure("priority", "high").unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "priority".into(),
                value: "high".into()
            }
        );
        assert!(config.configure("enabled", "maybe").is_err());
        assert!(config.configure("keepalive.interval", "often").is_err());
        config.configure("keepalive.interval", "disabled").unwrap();
        assert_eq!(config.keepalive, KeepalivePolicy::Disabled);
    }
}
