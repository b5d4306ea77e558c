use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema, DeriveActiveEnum, EnumIter,
)]
#[sea_orm(
    rs_type = "String",
    db_type = "Enum",
    enum_name = "webhook_processing_status"
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processed")]
    Processed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "ignored")]
    Ignored,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStatus::Pending => write!(f, "pending"),
            ProcessingStatus::Processed => write!(f, "processed"),
            ProcessingStatus::Failed => write!(f, "failed"),
            ProcessingStatus::Ignored => write!(f, "ignored"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub external_event_id: String,
    #[sea_orm(column_name = "type")]
    pub event_type: String,
    /// 原始请求体，保留用于审计与重放
    #[sea_orm(column_type = "Text")]
    pub payload: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_status: ProcessingStatus,
}

impl Model {
    /// 最近一次处理尝试的时间：失败、完成或重新接管时写入 processed_at，
    /// 从未处理过时退回到 received_at
    pub fn last_attempt_at(&self) -> DateTime<Utc> {
        self.processed_at.unwrap_or(self.received_at)
    }

    /// 失败的事件，或在 `abandoned_before` 之前就被接管却没有结果的 pending 事件，
    /// 可以在重投时重新处理
    pub fn is_reclaimable(&self, abandoned_before: DateTime<Utc>) -> bool {
        match self.processing_status {
            ProcessingStatus::Failed => true,
            ProcessingStatus::Pending => self.last_attempt_at() < abandoned_before,
            ProcessingStatus::Processed | ProcessingStatus::Ignored => false,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
