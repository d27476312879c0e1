//! The durable store contract backing the archiver and replayer: a
//! time-indexed `messages` table plus `commands`/`tags` latest-state
//! projections, all operations idempotent.

use crate::database::entities::{
    commands, messages,
    messages::MessageKind,
    tags,
    tags::TagRowStatus,
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbErr),
    #[error("requested start instant predates the store's retention horizon")]
    HorizonExceeded,
}

pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Inserts one drained broker message. Returns `Ok(None)` without error
    /// when `nats_msg_id` already exists (idempotent skip per §7).
    pub async fn insert_message(
        &self,
        subject: &str,
        kind: MessageKind,
        nats_msg_id: &str,
        published_ts: DateTime<Utc>,
        payload_json: Value,
        headers_json: Value,
        cbor: Vec<u8>,
    ) -> Result<Option<i64>, StoreError> {
        let (recv_epoch_ms, recv_iso, message_type, sensor_id, day, time_s) = extract_telemetry_fields(&payload_json);

        let active = messages::ActiveModel {
            id: sea_orm::ActiveValue::NotSet,
            subject: Set(subject.to_string()),
            kind: Set(kind),
            nats_msg_id: Set(nats_msg_id.to_string()),
            published_ts: Set(published_ts),
            recv_epoch_ms: Set(recv_epoch_ms),
            recv_iso: Set(recv_iso),
            message_type: Set(message_type),
            sensor_id: Set(sensor_id),
            day: Set(day),
            time_s: Set(time_s),
            payload_json: Set(payload_json),
            headers_json: Set(headers_json),
            tspi_extracts_json: Set(None),
            cbor: Set(cbor),
            created_at: Set(Utc::now()),
        };

        match messages::Entity::insert(active).exec(&self.db).await {
            Ok(result) => Ok(Some(result.last_insert_id)),
            Err(DbErr::RecordNotInserted) => Ok(None),
            Err(DbErr::Exec(ref msg_err)) if msg_err.to_string().to_lowercase().contains("unique") => Ok(None),
            Err(other) => Err(other.into()),
        }
    }

    /// Upserts the latest-value row for a command. `units` is `Some` only for
    /// a `display.units` command; the caller extracts it from the typed
    /// payload rather than this method re-deriving it from `payload_json`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_command(
        &self,
        cmd_id: &str,
        name: &str,
        ts: DateTime<Utc>,
        sender: &str,
        units: Option<String>,
        payload_json: Value,
        published_ts: DateTime<Utc>,
        message_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let active = commands::ActiveModel {
            cmd_id: Set(cmd_id.to_string()),
            name: Set(name.to_string()),
            ts: Set(ts),
            sender: Set(sender.to_string()),
            units: Set(units),
            payload_json: Set(payload_json),
            published_ts: Set(published_ts),
            message_id: Set(message_id),
        };

        commands::Entity::insert(active)
            .on_conflict(
                OnConflict::column(commands::Column::CmdId)
                    .update_columns([
                        commands::Column::Name,
                        commands::Column::Ts,
                        commands::Column::Sender,
                        commands::Column::Units,
                        commands::Column::PayloadJson,
                        commands::Column::PublishedTs,
                        commands::Column::MessageId,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        Ok(())
    }

    /// Applies a tag create/update/delete event, merging onto any existing
    /// row rather than replacing it wholesale: fields omitted from the new
    /// event fall back to the existing row's values. `status_from_payload`
    /// is the tag broadcast's own `status` field ("active"/"deleted").
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_tag_event(
        &self,
        id: &str,
        ts: DateTime<Utc>,
        creator: Option<String>,
        label: Option<String>,
        notes: Option<String>,
        extra_json: Option<Value>,
        status_from_payload: Option<&str>,
        updated_ts: DateTime<Utc>,
        message_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let existing = tags::Entity::find_by_id(id.to_string()).one(&self.db).await?;

        let status = match status_from_payload {
            Some("deleted") => TagRowStatus::Deleted,
            Some(_) => TagRowStatus::Active,
            None => existing.as_ref().map(|e| e.status).unwrap_or(TagRowStatus::Active),
        };

        let label = label.or_else(|| existing.as_ref().map(|e| e.label.clone())).unwrap_or_default();
        let creator = creator.or_else(|| existing.as_ref().and_then(|e| e.creator.clone()));
        let notes = notes.or_else(|| existing.as_ref().and_then(|e| e.notes.clone()));
        let extra_json = extra_json.or_else(|| existing.as_ref().and_then(|e| e.extra_json.clone()));
        // ts is preserved from the original creation event, never overwritten by updates.
        let ts = existing.as_ref().map(|e| e.ts).unwrap_or(ts);

        let active = tags::ActiveModel {
            id: Set(id.to_string()),
            ts: Set(ts),
            creator: Set(creator),
            label: Set(label),
            category: Set(existing.as_ref().and_then(|e| e.category.clone())),
            notes: Set(notes),
            extra_json: Set(extra_json),
            status: Set(status),
            updated_ts: Set(updated_ts),
            message_id: Set(message_id),
        };

        tags::Entity::insert(active)
            .on_conflict(
                OnConflict::column(tags::Column::Id)
                    .update_columns([
                        tags::Column::Ts,
                        tags::Column::Creator,
                        tags::Column::Label,
                        tags::Column::Notes,
                        tags::Column::ExtraJson,
                        tags::Column::Status,
                        tags::Column::UpdatedTs,
                        tags::Column::MessageId,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;

        Ok(())
    }

    pub async fn fetch_messages_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<messages::Model>, StoreError> {
        if let Some(earliest) = self.earliest_published_ts().await? {
            if start < earliest {
                return Err(StoreError::HorizonExceeded);
            }
        }

        let rows = messages::Entity::find()
            .filter(messages::Column::PublishedTs.gte(start))
            .filter(messages::Column::PublishedTs.lte(end))
            .order_by_asc(messages::Column::PublishedTs)
            .order_by_asc(messages::Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows)
    }

    pub async fn fetch_messages_for_tag(&self, tag_id: &str, window_seconds: f64) -> Result<Vec<messages::Model>, StoreError> {
        let tag = tags::Entity::find_by_id(tag_id.to_string()).one(&self.db).await?;
        let Some(tag) = tag else { return Ok(Vec::new()) };

        let half_window = Duration::milliseconds((window_seconds * 500.0) as i64);
        let start = tag.ts - half_window;
        let end = tag.ts + half_window;
        self.fetch_messages_between(start, end).await
    }

    pub async fn latest_command(&self, name: &str) -> Result<Option<commands::Model>, StoreError> {
        let row = commands::Entity::find()
            .filter(commands::Column::Name.eq(name))
            .order_by_desc(commands::Column::PublishedTs)
            .one(&self.db)
            .await?;
        Ok(row)
    }

    pub async fn get_tag(&self, id: &str) -> Result<Option<tags::Model>, StoreError> {
        Ok(tags::Entity::find_by_id(id.to_string()).one(&self.db).await?)
    }

    pub async fn list_tags(&self, include_deleted: bool) -> Result<Vec<tags::Model>, StoreError> {
        let mut query = tags::Entity::find();
        if !include_deleted {
            query = query.filter(tags::Column::Status.ne(TagRowStatus::Deleted));
        }
        Ok(query.order_by_desc(tags::Column::UpdatedTs).all(&self.db).await?)
    }

    pub async fn count_messages(&self) -> Result<u64, StoreError> {
        Ok(messages::Entity::find().count(&self.db).await?)
    }

    pub async fn count_commands(&self) -> Result<u64, StoreError> {
        Ok(commands::Entity::find().count(&self.db).await?)
    }

    pub async fn count_tags(&self) -> Result<u64, StoreError> {
        Ok(tags::Entity::find().count(&self.db).await?)
    }

    async fn earliest_published_ts(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = messages::Entity::find()
            .order_by_asc(messages::Column::PublishedTs)
            .one(&self.db)
            .await?;
        Ok(row.map(|m| m.published_ts))
    }
}

/// Extracts the telemetry-shaped sub-fields out of a generic payload body,
/// returning all-`None` when the payload doesn't look like a telemetry
/// envelope (commands/tags pass through untouched).
fn extract_telemetry_fields(
    payload: &Value,
) -> (Option<i64>, Option<String>, Option<String>, Option<i32>, Option<i32>, Option<f64>) {
    let recv_epoch_ms = payload.get("recv_epoch_ms").and_then(Value::as_i64);
    let recv_iso = payload.get("recv_iso").and_then(Value::as_str).map(str::to_string);
    let message_type = payload.get("type").and_then(Value::as_str).map(str::to_string);
    let sensor_id = payload.get("sensor_id").and_then(Value::as_i64).map(|v| v as i32);
    let day = payload.get("day").and_then(Value::as_i64).map(|v| v as i32);
    let time_s = payload.get("time_s").and_then(Value::as_f64);
    (recv_epoch_ms, recv_iso, message_type, sensor_id, day, time_s)
}
