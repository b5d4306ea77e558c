use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
enum Subscriptions {
    Table,
    StripeCustomerId,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_subscriptions_stripe_customer_id")
                    .table(Subscriptions::Table)
                    .col(Subscriptions::StripeCustomerId)
                    .to_owned(),
            )
            .await?;

        // 对账扫描用的部分索引，免费行永远不是候选
        let stmt = sea_orm::Statement::from_string(
            manager.get_database_backend(),
            "CREATE INDEX IF NOT EXISTS idx_subscriptions_reconcile ON subscriptions(status, current_period_end) WHERE status <> 'inactive'".to_owned(),
        );
        manager.get_connection().execute(stmt).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let stmt = sea_orm::Statement::from_string(
            manager.get_database_backend(),
            "DROP INDEX IF EXISTS idx_subscriptions_reconcile".to_owned(),
        );
        manager.get_connection().execute(stmt).await?;
        manager
            .drop_index(
                Index::drop()
                    .if_exists()
                    .name("idx_subscriptions_stripe_customer_id")
                    .table(Subscriptions::Table)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}
