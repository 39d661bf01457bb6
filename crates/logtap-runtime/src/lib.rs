//! Embedded script sandbox for logtap.
//!
//! Hosts a rhai VM behind a single serialization lock, exposes the `logd`
//! builtin module to user scripts, and owns the asynchronous I/O
//! collaborators those builtins reach: the worker-pool HTTP client and the
//! Kafka producer adapter. Script-defined hooks (`on_log`, `on_tick`,
//! `on_error`, `on_http_error`, `on_kafka_report`) are dispatched through
//! the sandbox at the matching lifecycle points.

mod builtins;
pub mod config;
pub mod error;
pub mod handle;
pub mod http;
pub mod kafka;
pub mod sandbox;

pub use config::{HttpConfig, SandboxConfig};
pub use error::SandboxError;
pub use handle::RecordHandle;
pub use http::{AsyncHttpClient, HttpClientError, HttpError};
pub use kafka::{DeliveryReport, KafkaMessage, KafkaOffset, KafkaProducer};
pub use sandbox::Sandbox;
