use std::sync::Arc;

use chrono::Duration;

use crate::database::SubscriptionStore;
use crate::error::AppResult;
use crate::models::{CapabilitySet, Entitlement};
use crate::utils::Clock;

/// 只读：权限判断只依赖本地订阅表，从不调用 Stripe
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self {
            store,
            clock,
            grace,
        }
    }

    pub async fn entitlement(&self, user_id: i64) -> AppResult<Entitlement> {
        let row = self.store.find_by_user(user_id).await?;
        Ok(Entitlement::evaluate(
            user_id,
            row.as_ref(),
            self.clock.now(),
            self.grace,
        ))
    }

    pub async fn capabilities(&self, user_id: i64) -> AppResult<CapabilitySet> {
        let entitlement = self.entitlement(user_id).await?;
        Ok(CapabilitySet::from(&entitlement))
    }
}
