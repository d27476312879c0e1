//! SeaORM entity for the `messages` table: the time-indexed record of every
//! broker message the archiver has drained.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(None)")]
pub enum MessageKind {
    #[sea_orm(string_value = "telemetry")]
    Telemetry,
    #[sea_orm(string_value = "command")]
    Command,
    #[sea_orm(string_value = "tag")]
    Tag,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "messages")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub subject: String,
    pub kind: MessageKind,
    #[sea_orm(unique)]
    pub nats_msg_id: String,
    pub published_ts: DateTime<Utc>,
    pub recv_epoch_ms: Option<i64>,
    pub recv_iso: Option<String>,
    pub message_type: Option<String>,
    pub sensor_id: Option<i32>,
    pub day: Option<i32>,
    pub time_s: Option<f64>,
    #[sea_orm(column_type = "Json")]
    pub payload_json: serde_json::Value,
    #[sea_orm(column_type = "Json")]
    pub headers_json: serde_json::Value,
    #[sea_orm(column_type = "Json", nullable)]
    pub tspi_extracts_json: Option<serde_json::Value>,
    #[sea_orm(column_type = "Blob")]
    pub cbor: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::commands::Entity")]
    Commands,
    #[sea_orm(has_many = "super::tags::Entity")]
    Tags,
}

impl Related<super::commands::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Commands.def()
    }
}

impl Related<super::tags::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tags.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
