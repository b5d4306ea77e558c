use sea_orm_migration::prelude::extension::postgres::Type;
use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum WebhookEvents {
    Table,
    Id,
    ExternalEventId,
    Type,
    Payload,
    ReceivedAt,
    ProcessedAt,
    ProcessingStatus,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_type(
                Type::create()
                    .as_enum(Alias::new("webhook_processing_status"))
                    .values(vec![
                        Alias::new("pending"),
                        Alias::new("processed"),
                        Alias::new("failed"),
                        Alias::new("ignored"),
                    ])
                    .to_owned(),
            )
            .await?;

        // external_event_id 的唯一约束是去重的唯一手段
        manager
            .create_table(
                Table::create()
                    .table(WebhookEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookEvents::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::ExternalEventId)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::Type)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookEvents::Payload).text().not_null())
                    .col(
                        ColumnDef::new(WebhookEvents::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::cust("NOW()")),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WebhookEvents::ProcessingStatus)
                            .custom(Alias::new("webhook_processing_status"))
                            .not_null()
                            .default(Expr::cust("'pending'::webhook_processing_status")),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_webhook_events_status_received")
                    .table(WebhookEvents::Table)
                    .col(WebhookEvents::ProcessingStatus)
                    .col(WebhookEvents::ReceivedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .if_exists()
                    .table(WebhookEvents::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_type(
                Type::drop()
                    .name(Alias::new("webhook_processing_status"))
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}
