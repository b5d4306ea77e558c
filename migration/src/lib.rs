pub use sea_orm_migration::prelude::*;

mod m20250901_000001_create_subscriptions;
mod m20250901_000002_create_webhook_events;
mod m20250903_000001_add_reconciliation_indexes;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250901_000001_create_subscriptions::Migration),
            Box::new(m20250901_000002_create_webhook_events::Migration),
            Box::new(m20250903_000001_add_reconciliation_indexes::Migration),
        ]
    }
}
