//! Broker abstraction: subject-based pub/sub with wildcard filtering,
//! per-message idempotency, and pull-style consumers.

pub mod memory;
pub mod subject;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use std::fmt;
use thiserror::Error;

/// Header key carrying the client-supplied idempotency id.
pub const DEDUP_HEADER: &str = "Nats-Msg-Id";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("timed out connecting to the broker")]
    ConnectTimeout,
    #[error("stream already exists with a different, non-normalised subject set")]
    StreamConflict,
}

pub type Headers = HashMap<String, String>;

/// One message as stored/delivered by the broker, independent of wire
/// encoding: callers are responsible for (de)serialising `payload`.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    pub published_ts: DateTime<Utc>,
}

/// Capability interface for publishing messages onto the broker.
pub trait Publisher: Send + Sync + fmt::Debug {
    /// Publishes `payload` on `subject`. Returns `Ok(false)` without error if
    /// `headers[DEDUP_HEADER]` is already present in the stream's dedup
    /// window (a no-op, not a failure).
    fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Headers,
        timestamp: DateTime<Utc>,
    ) -> Result<bool, BrokerError>;
}

/// Capability interface for a pull-style cursor over a stream.
pub trait PullConsumer: Send + Sync + fmt::Debug {
    /// Pulls up to `batch` messages, in arrival order.
    fn pull(&self, batch: usize) -> Vec<BrokerMessage>;
    /// Number of messages not yet delivered to this consumer.
    fn pending(&self) -> usize;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeliverPolicy {
    DeliverNew,
    ByStartTime(DateTime<Utc>),
}
