//! SeaORM entity for the `commands` table: latest-value projection keyed by
//! `cmd_id`, upserted by the archiver as commands are drained.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "commands")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub cmd_id: String,
    pub name: String,
    pub ts: DateTime<Utc>,
    pub sender: String,
    pub units: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub payload_json: serde_json::Value,
    pub published_ts: DateTime<Utc>,
    pub message_id: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::messages::Entity",
        from = "Column::MessageId",
        to = "super::messages::Column::Id",
        on_delete = "Cascade"
    )]
    Message,
}

impl Related<super::messages::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Message.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
