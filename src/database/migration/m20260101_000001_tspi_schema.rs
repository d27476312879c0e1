//! Idempotent schema bring-up for the store. This is the only migration in
//! the history: every statement uses `if_not_exists()`/`if_exists()` so that
//! re-running it against an already-initialised database is a no-op, which
//! is the full extent of "migrations" this system needs.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Messages::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Messages::Id).big_integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(Messages::Subject).string().not_null())
                    .col(ColumnDef::new(Messages::Kind).string().not_null())
                    .col(ColumnDef::new(Messages::NatsMsgId).string().not_null())
                    .col(ColumnDef::new(Messages::PublishedTs).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Messages::RecvEpochMs).big_integer().null())
                    .col(ColumnDef::new(Messages::RecvIso).string().null())
                    .col(ColumnDef::new(Messages::MessageType).string().null())
                    .col(ColumnDef::new(Messages::SensorId).integer().null())
                    .col(ColumnDef::new(Messages::Day).integer().null())
                    .col(ColumnDef::new(Messages::TimeS).double().null())
                    .col(ColumnDef::new(Messages::PayloadJson).json_binary().not_null())
                    .col(ColumnDef::new(Messages::HeadersJson).json_binary().not_null())
                    .col(ColumnDef::new(Messages::TspiExtractsJson).json_binary().null())
                    .col(ColumnDef::new(Messages::Cbor).blob().not_null())
                    .col(ColumnDef::new(Messages::CreatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .unique()
                    .name("idx-messages-nats-msg-id")
                    .table(Messages::Table)
                    .col(Messages::NatsMsgId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Commands::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Commands::CmdId).string().not_null().primary_key())
                    .col(ColumnDef::new(Commands::Name).string().not_null())
                    .col(ColumnDef::new(Commands::Ts).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Commands::Sender).string().not_null())
                    .col(ColumnDef::new(Commands::Units).string().null())
                    .col(ColumnDef::new(Commands::PayloadJson).json_binary().not_null())
                    .col(ColumnDef::new(Commands::PublishedTs).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Commands::MessageId).big_integer().null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(Commands::Table, Commands::MessageId)
                            .to(Messages::Table, Messages::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Tags::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Tags::Id).string().not_null().primary_key())
                    .col(ColumnDef::new(Tags::Ts).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Tags::Creator).string().null())
                    .col(ColumnDef::new(Tags::Label).string().not_null())
                    .col(ColumnDef::new(Tags::Category).string().null())
                    .col(ColumnDef::new(Tags::Notes).string().null())
                    .col(ColumnDef::new(Tags::ExtraJson).json_binary().null())
                    .col(ColumnDef::new(Tags::Status).string().not_null())
                    .col(ColumnDef::new(Tags::UpdatedTs).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Tags::MessageId).big_integer().null())
                    .foreign_key(
                        ForeignKey::create()
                            .from(Tags::Table, Tags::MessageId)
                            .to(Messages::Table, Messages::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Tags::Table).to_owned()).await?;
        manager.drop_table(Table::drop().table(Commands::Table).to_owned()).await?;
        manager.drop_table(Table::drop().table(Messages::Table).to_owned()).await
    }
}

#[derive(DeriveIden)]
enum Messages {
    Table,
    Id,
    Subject,
    Kind,
    NatsMsgId,
    PublishedTs,
    RecvEpochMs,
    RecvIso,
    MessageType,
    SensorId,
    Day,
    TimeS,
    PayloadJson,
    HeadersJson,
    TspiExtractsJson,
    Cbor,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Commands {
    Table,
    CmdId,
    Name,
    Ts,
    Sender,
    Units,
    PayloadJson,
    PublishedTs,
    MessageId,
}

#[derive(DeriveIden)]
enum Tags {
    Table,
    Id,
    Ts,
    Creator,
    Label,
    Category,
    Notes,
    ExtraJson,
    Status,
    UpdatedTs,
    MessageId,
}
