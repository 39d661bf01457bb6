//! Kafka producer adapter.
//!
//! A thin wrapper over an rdkafka [`ThreadedProducer`]: outbound messages
//! are built by the script through opaque handles, produced asynchronously,
//! and per-message delivery reports are forwarded from the producer context
//! onto an unbounded events channel the sandbox drains into the script's
//! `on_kafka_report` hook.

use std::collections::BTreeMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientContext;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::SandboxError;

const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(20);
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// librdkafka special offsets, by name.
const OFFSET_BEGINNING: i64 = -2;
const OFFSET_END: i64 = -1;
const OFFSET_STORED: i64 = -1000;
const OFFSET_INVALID: i64 = -1001;

/// An opaque message offset handle created by the `kafka_offset` builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaOffset(pub(crate) i64);

impl KafkaOffset {
    /// Parse a named or numeric offset: `beginning`, `end`, `stored`,
    /// `invalid`, or a base-10 integer.
    ///
    /// # Errors
    ///
    /// Returns a message for anything else.
    pub fn parse(name: &str) -> Result<Self, String> {
        let raw = match name {
            "beginning" | "earliest" => OFFSET_BEGINNING,
            "end" | "latest" => OFFSET_END,
            "stored" => OFFSET_STORED,
            "invalid" => OFFSET_INVALID,
            other => other
                .parse::<i64>()
                .map_err(|_| format!("invalid offset name: '{other}'"))?,
        };
        Ok(Self(raw))
    }

    /// Raw offset value.
    #[must_use]
    pub fn raw(&self) -> i64 {
        self.0
    }
}

/// An outbound message handle built by the `kafka_message` builtin. The
/// script sees it opaquely; the report hook reads its fields back through
/// registered getters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaMessage {
    /// Message key; empty means no key on the wire.
    pub key: String,
    /// Message payload; empty means no payload on the wire.
    pub value: String,
    /// Destination topic.
    pub topic: String,
    /// Destination partition; `-1` lets the partitioner choose.
    pub partition: i32,
    /// Offset carried for report visibility (producers do not set offsets
    /// on the wire).
    pub offset: i64,
}

/// One delivery outcome from the producer's events channel.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// The message the report refers to, as observed by the broker client.
    pub message: KafkaMessage,
    /// Failure description, absent on successful delivery.
    pub error: Option<String>,
}

struct ReportContext {
    events: mpsc::UnboundedSender<DeliveryReport>,
}

impl ClientContext for ReportContext {}

impl ProducerContext for ReportContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, (): Self::DeliveryOpaque) {
        let report = match result {
            Ok(message) => DeliveryReport {
                message: observed_message(message),
                error: None,
            },
            Err((err, message)) => {
                let observed = observed_message(message);
                let error = format!(
                    "error when producing message to topic '{}' at partition {} with offset {}: {err}",
                    observed.topic, observed.partition, observed.offset
                );
                DeliveryReport {
                    message: observed,
                    error: Some(error),
                }
            }
        };
        let _ = self.events.send(report);
    }
}

fn observed_message(message: &BorrowedMessage<'_>) -> KafkaMessage {
    KafkaMessage {
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default(),
        value: message
            .payload()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default(),
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
    }
}

/// Asynchronous Kafka producer with a delivery-report events channel.
pub struct KafkaProducer {
    producer: ThreadedProducer<ReportContext>,
    flush_timeout: Duration,
}

impl KafkaProducer {
    /// Create a producer from the accumulated configuration map. Returns
    /// the receiving end of the delivery-report channel.
    ///
    /// # Errors
    ///
    /// Fails when librdkafka rejects the configuration.
    pub fn new(
        config: &BTreeMap<String, String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeliveryReport>), SandboxError> {
        let mut client_config = ClientConfig::new();
        for (key, value) in config {
            client_config.set(key, value);
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let producer = client_config
            .create_with_context(ReportContext { events })
            .map_err(|e| SandboxError::Kafka(e.to_string()))?;

        Ok((
            Self {
                producer,
                flush_timeout: flush_timeout(config),
            },
            events_rx,
        ))
    }

    /// Produce a message asynchronously. The delivery outcome arrives on
    /// the events channel. Blocks briefly and retries while the local queue
    /// is full.
    ///
    /// # Errors
    ///
    /// Fails on any producer error other than a full local queue.
    pub fn produce(&self, message: &KafkaMessage) -> Result<(), SandboxError> {
        let mut record = base_record(message);
        loop {
            match self.producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    warn!(topic = %message.topic, "producer queue full, retrying");
                    record = returned;
                    std::thread::sleep(QUEUE_FULL_BACKOFF);
                }
                Err((e, _)) => return Err(SandboxError::Kafka(e.to_string())),
            }
        }
    }

    /// Wait for outstanding deliveries, bounded by twice the configured
    /// message timeout.
    pub fn flush(&self) {
        if let Err(e) = self.producer.flush(self.flush_timeout) {
            error!(error = %e, "kafka flush failed");
        }
    }

    /// Flush and drop the producer. The events channel closes once the
    /// producer context is gone.
    pub fn close(self) {
        self.flush();
    }
}

fn base_record(message: &KafkaMessage) -> BaseRecord<'_, [u8], [u8]> {
    let mut record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(&message.topic);
    if message.partition >= 0 {
        record = record.partition(message.partition);
    }
    if !message.key.is_empty() {
        record = record.key(message.key.as_bytes());
    }
    if !message.value.is_empty() {
        record = record.payload(message.value.as_bytes());
    }
    record
}

// all message reports must have been delivered before close returns, so
// the bound follows the configured per-message delivery timeout
fn flush_timeout(config: &BTreeMap<String, String>) -> Duration {
    config
        .get("message.timeout.ms")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|ms| Duration::from_millis(ms.saturating_mul(2)))
        .map_or(DEFAULT_FLUSH_TIMEOUT, |t| t.max(DEFAULT_FLUSH_TIMEOUT))
}
