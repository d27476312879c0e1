//! Store replayer: re-publishes a stored time window (or a tag-anchored
//! window) onto synthetic per-room playout subjects with the original
//! inter-arrival pacing.

use crate::broker::{BrokerError, Headers, Publisher, DEDUP_HEADER};
use crate::database::entities::messages;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const REPLAY_ORIGIN_HEADER: &str = "X-Replay-Origin";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct StoreReplayer<P: Publisher> {
    publisher: Arc<P>,
    store: Arc<Store>,
}

impl<P: Publisher> StoreReplayer<P> {
    pub fn new(publisher: Arc<P>, store: Arc<Store>) -> Self {
        Self { publisher, store }
    }

    /// Replays every stored message in `[start, end]` onto `player.<room>.playout.<tail>`.
    /// When `pace` is true, sleeps the inter-arrival delay before each publish
    /// after the first. Returns the number of messages republished.
    pub async fn replay_time_window(
        &self,
        room: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        pace: bool,
        cancel: &CancellationToken,
    ) -> Result<usize, ReplayError> {
        let records = self.store.fetch_messages_between(start, end).await?;
        self.replay_records(room, records, pace, cancel).await
    }

    /// Replays the window centred on a tag's timestamp, ± half of `window_s` seconds.
    pub async fn replay_tag(
        &self,
        room: &str,
        tag_id: &str,
        window_s: f64,
        pace: bool,
        cancel: &CancellationToken,
    ) -> Result<usize, ReplayError> {
        let records = self.store.fetch_messages_for_tag(tag_id, window_s).await?;
        self.replay_records(room, records, pace, cancel).await
    }

    async fn replay_records(
        &self,
        room: &str,
        records: Vec<messages::Model>,
        pace: bool,
        cancel: &CancellationToken,
    ) -> Result<usize, ReplayError> {
        let mut previous: Option<&messages::Model> = None;
        let mut republished = 0usize;

        for record in &records {
            if cancel.is_cancelled() {
                break;
            }

            if pace {
                let delay = delay_since(previous, record);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }

            self.publish_one(room, record)?;
            republished += 1;
            previous = Some(record);
        }

        Ok(republished)
    }

    fn publish_one(&self, room: &str, record: &messages::Model) -> Result<(), ReplayError> {
        let tail = record.subject.splitn(2, '.').nth(1).unwrap_or(record.subject.as_str());
        let subject = format!("player.{room}.playout.{tail}");

        let mut headers: Headers = serde_json::from_value(record.headers_json.clone()).unwrap_or_default();
        headers.insert(DEDUP_HEADER.to_string(), format!("{}:replay:{room}:{}", record.nats_msg_id, record.id));
        headers.insert(REPLAY_ORIGIN_HEADER.to_string(), "datastore".to_string());

        self.publisher
            .publish(&subject, bytes::Bytes::from(record.cbor.clone()), headers, Utc::now())?;
        Ok(())
    }
}

/// Delay before publishing `record`, given the previously published record
/// (or `None` for the first). Prefers `recv_epoch_ms` deltas, falls back to
/// `time_s` deltas, then to zero. Never negative.
fn delay_since(previous: Option<&messages::Model>, record: &messages::Model) -> Duration {
    let Some(previous) = previous else { return Duration::ZERO };

    let millis = match (previous.recv_epoch_ms, record.recv_epoch_ms) {
        (Some(prev), Some(curr)) => Some(curr - prev),
        _ => match (previous.time_s, record.time_s) {
            (Some(prev), Some(curr)) => Some(((curr - prev) * 1000.0) as i64),
            _ => None,
        },
    };

    match millis {
        Some(millis) if millis > 0 => Duration::from_millis(millis as u64),
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::InMemoryJetStream;
    use crate::broker::DeliverPolicy;
    use crate::database::migration::{Migrator, MigratorTrait};
    use crate::database::entities::messages::MessageKind;
    use sea_orm::Database;
    use serde_json::json;

    async fn test_store() -> Arc<Store> {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        Arc::new(Store::new(db))
    }

    #[tokio::test]
    async fn s6_pacing_and_dedup_rewrite() -> Result<(), Box<dyn std::error::Error>> {
        let store = test_store().await;
        let base = Utc::now();

        for (offset_ms, dedup) in [(0i64, "a"), (200, "b"), (400, "c")] {
            let ts = base + chrono::Duration::milliseconds(offset_ms);
            store
                .insert_message(
                    "tspi.geocentric.501",
                    MessageKind::Telemetry,
                    dedup,
                    ts,
                    json!({"recv_epoch_ms": offset_ms}),
                    json!({"Nats-Msg-Id": dedup}),
                    vec![1, 2, 3],
                )
                .await?;
        }

        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("PLAYOUT", vec!["player.>".to_string()])?;
        let consumer = js.create_pull_consumer("PLAYOUT", "player.room1.playout.>", DeliverPolicy::DeliverNew);

        let replayer = StoreReplayer::new(js, store);
        let cancel = CancellationToken::new();
        let count = replayer
            .replay_time_window("room1", base - chrono::Duration::seconds(1), base + chrono::Duration::seconds(1), true, &cancel)
            .await?;
        assert_eq!(count, 3);

        let delivered = consumer.pull(10);
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].subject, "player.room1.playout.geocentric.501");
        assert_eq!(delivered[0].headers.get(REPLAY_ORIGIN_HEADER).unwrap(), "datastore");
        assert!(delivered[0].headers.get(DEDUP_HEADER).unwrap().starts_with("a:replay:room1:"));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_mid_window() -> Result<(), Box<dyn std::error::Error>> {
        let store = test_store().await;
        let base = Utc::now();
        for (offset_ms, dedup) in [(0i64, "a"), (5_000, "b")] {
            store
                .insert_message(
                    "tspi.geocentric.501",
                    MessageKind::Telemetry,
                    dedup,
                    base + chrono::Duration::milliseconds(offset_ms),
                    json!({"recv_epoch_ms": offset_ms}),
                    json!({}),
                    vec![],
                )
                .await?;
        }

        let js = Arc::new(InMemoryJetStream::new());
        js.ensure_stream("PLAYOUT", vec!["player.>".to_string()])?;
        let replayer = StoreReplayer::new(js, store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let count = replayer
            .replay_time_window("room1", base - chrono::Duration::seconds(1), base + chrono::Duration::seconds(10), true, &cancel)
            .await?;
        assert_eq!(count, 0);
        Ok(())
    }
}
