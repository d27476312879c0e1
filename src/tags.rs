//! Collaborative tags: timestamped operator annotations broadcast on a
//! single subject, create and update sharing one wire shape.

use crate::broker::{BrokerError, Headers, Publisher, DEDUP_HEADER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub const TAG_BROADCAST_SUBJECT: &str = "tags.broadcast";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPayload {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub label: String,
    pub status: TagStatus,
    pub updated_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Error)]
pub enum TagSendError {
    #[error("tag comment must not be empty")]
    EmptyComment,
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct TagSender<P: Publisher> {
    publisher: Arc<P>,
    sender_id: String,
}

impl<P: Publisher> TagSender<P> {
    pub fn new(publisher: Arc<P>, sender_id: impl Into<String>) -> Self {
        Self {
            publisher,
            sender_id: sender_id.into(),
        }
    }

    pub fn create_tag(
        &self,
        comment: &str,
        timestamp: Option<DateTime<Utc>>,
        extra: Option<Value>,
    ) -> Result<bool, TagSendError> {
        let trimmed = comment.trim();
        if trimmed.is_empty() {
            return Err(TagSendError::EmptyComment);
        }

        let ts = timestamp.unwrap_or_else(Utc::now);
        let tag_id = Uuid::new_v4();
        let tag = TagPayload {
            id: tag_id,
            ts,
            label: trimmed.to_string(),
            status: TagStatus::Active,
            updated_ts: ts,
            creator: Some(self.sender_id.clone()),
            notes: None,
            extra,
        };

        let mut headers = Headers::new();
        headers.insert(DEDUP_HEADER.to_string(), tag_id.to_string());
        headers.insert("X-Tag-Creator".to_string(), self.sender_id.clone());

        let body = serde_cbor::to_vec(&tag).expect("TagPayload always serialises");
        Ok(self
            .publisher
            .publish(TAG_BROADCAST_SUBJECT, bytes::Bytes::from(body), headers, ts)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryJetStream;

    #[test]
    fn rejects_empty_comment() {
        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TAGS", vec![TAG_BROADCAST_SUBJECT.to_string()]).unwrap();
        let sender = TagSender::new(js, "operator-1");
        assert!(matches!(sender.create_tag("   ", None, None), Err(TagSendError::EmptyComment)));
    }

    #[test]
    fn publishes_with_creator_header() {
        use crate::broker::DeliverPolicy;

        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("TAGS", vec![TAG_BROADCAST_SUBJECT.to_string()]).unwrap();
        let consumer = js.create_pull_consumer("TAGS", "tags.>", DeliverPolicy::DeliverNew);
        let sender = TagSender::new(js, "operator-1");

        assert!(sender.create_tag("target acquired", None, None).unwrap());
        let delivered = consumer.pull(10);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].headers.get("X-Tag-Creator").unwrap(), "operator-1");
    }
}
