//! Sandbox configuration and the `config_set` key space.

use std::collections::BTreeMap;
use std::time::Duration;

/// Config key for the periodic tick, in milliseconds. `0` disables it.
pub const CONFIG_TICK: &str = "tick";
/// Config key toggling protected-mode dispatch.
pub const CONFIG_PROTECTED: &str = "protected";
/// Config key for the number of HTTP worker tasks.
pub const CONFIG_HTTP_CONCURRENCY: &str = "http.concurrency";
/// Config key for the per-worker request channel capacity.
pub const CONFIG_HTTP_CHANNEL_BUFFER: &str = "http.channel_buffer";
/// Config key for the per-request HTTP timeout (duration string).
pub const CONFIG_HTTP_TIMEOUT: &str = "http.timeout";
/// Prefix routing config keys into the Kafka producer configuration map.
pub const CONFIG_KAFKA_PREFIX: &str = "kafka.";

/// Key listing shown in unknown-key errors.
pub const AVAILABLE_CONFIG_KEYS: &str =
    "tick, protected, http.concurrency, http.channel_buffer, http.timeout, kafka.*";

const DEFAULT_HTTP_CONCURRENCY: usize = 4;
const DEFAULT_HTTP_CHANNEL_BUFFER: usize = 100;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const KAFKA_DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const KAFKA_DEFAULT_MESSAGE_TIMEOUT_MS: u64 = KAFKA_DEFAULT_REQUEST_TIMEOUT_MS * 2;

/// Asynchronous HTTP client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Number of worker tasks; each owns one request channel.
    pub concurrency: usize,
    /// Capacity of each worker's request channel.
    pub channel_buffer: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_HTTP_CONCURRENCY,
            channel_buffer: DEFAULT_HTTP_CHANNEL_BUFFER,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl HttpConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first violated bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency < 1 {
            return Err("min http concurrency is 1".to_owned());
        }
        if self.channel_buffer < 1 {
            return Err("min http channel buffer is 1".to_owned());
        }
        if self.timeout.is_zero() {
            return Err("http timeout must be non-zero".to_owned());
        }
        Ok(())
    }
}

/// Sandbox configuration, populated by the script through `config_set`.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Tick period in milliseconds; `0` disables the ticker.
    pub tick_ms: u64,
    /// Whether hook dispatch runs in protected mode.
    pub protected: bool,
    /// HTTP client configuration.
    pub http: HttpConfig,
    /// Kafka producer configuration, librdkafka key names. Pre-seeded with
    /// overridable defaults.
    pub kafka: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            tick_ms: 0,
            protected: false,
            http: HttpConfig::default(),
            kafka: default_kafka_config(),
        }
    }
}

/// Producer defaults applied before the script's `kafka.*` keys:
/// acknowledged single-message producing with bounded local queueing and
/// delivery timeouts, so delivery reports arrive within a known window.
#[must_use]
pub fn default_kafka_config() -> BTreeMap<String, String> {
    let mut config = BTreeMap::new();
    config.insert(
        "request.required.acks".to_owned(),
        "1".to_owned(),
    );
    config.insert(
        "request.timeout.ms".to_owned(),
        KAFKA_DEFAULT_REQUEST_TIMEOUT_MS.to_string(),
    );
    config.insert(
        "message.timeout.ms".to_owned(),
        KAFKA_DEFAULT_MESSAGE_TIMEOUT_MS.to_string(),
    );
    config.insert(
        "queue.buffering.max.messages".to_owned(),
        "10000".to_owned(),
    );
    config.insert("socket.timeout.ms".to_owned(), "5000".to_owned());
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_http_config_is_valid() {
        HttpConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = HttpConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_channel_buffer_is_rejected() {
        let config = HttpConfig {
            channel_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = HttpConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn kafka_defaults_are_seeded() {
        let config = SandboxConfig::default();
        assert_eq!(
            config.kafka.get("message.timeout.ms").map(String::as_str),
            Some("10000")
        );
        assert_eq!(
            config.kafka.get("request.required.acks").map(String::as_str),
            Some("1")
        );
        assert_eq!(config.tick_ms, 0);
        assert!(!config.protected);
    }
}
