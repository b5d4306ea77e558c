use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::{PlanTier, SubscriptionStatus, subscription_entity};

/// 用户当前的访问权限
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Entitlement {
    pub user_id: i64,
    /// 生效的套餐等级，无权限时为 free
    pub tier: PlanTier,
    pub entitled: bool,
    /// 权限来自宽限期或"到期取消"窗口
    pub in_grace_or_cancellation: bool,
    pub status: SubscriptionStatus,
    /// 当前权限持续到的时间点
    pub access_until: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn evaluate(
        user_id: i64,
        row: Option<&subscription_entity::Model>,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Self {
        let Some(row) = row else {
            return Self::free(user_id, SubscriptionStatus::Inactive);
        };
        if !row.tier.is_paid() {
            return Self::free(user_id, row.status);
        }

        use SubscriptionStatus as S;
        let period_end = row.current_period_end;
        let (entitled, windowed, access_until) = if row.cancel_at_period_end {
            let open = matches!(row.status, S::Trialing | S::Active | S::Canceled)
                && period_end.is_some_and(|end| now < end);
            (open, open, period_end)
        } else {
            match row.status {
                S::Trialing | S::Active => (true, false, period_end),
                S::PastDue => {
                    let grace_end = period_end.map(|end| end + grace);
                    let open = grace_end.is_some_and(|end| now < end);
                    (open, open, grace_end)
                }
                _ => (false, false, None),
            }
        };

        if !entitled {
            return Self::free(user_id, row.status);
        }
        Self {
            user_id,
            tier: row.tier,
            entitled,
            in_grace_or_cancellation: windowed,
            status: row.status,
            access_until,
        }
    }

    fn free(user_id: i64, status: SubscriptionStatus) -> Self {
        Self {
            user_id,
            tier: PlanTier::Free,
            entitled: false,
            in_grace_or_cancellation: false,
            status,
            access_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BrowseListings,
    ContactAgents,
    SavedSearches,
    ListingAlerts,
    FeaturedListings,
    MarketAnalytics,
    AgencyDashboard,
    BulkListingImport,
}

impl Capability {
    /// 包含该能力的最低套餐
    pub fn minimum_tier(&self) -> PlanTier {
        match self {
            Capability::BrowseListings | Capability::ContactAgents => PlanTier::Free,
            Capability::SavedSearches | Capability::ListingAlerts => PlanTier::Standard,
            Capability::FeaturedListings | Capability::MarketAnalytics => PlanTier::Premium,
            Capability::AgencyDashboard | Capability::BulkListingImport => PlanTier::Agency,
        }
    }

    const ALL: [Capability; 8] = [
        Capability::BrowseListings,
        Capability::ContactAgents,
        Capability::SavedSearches,
        Capability::ListingAlerts,
        Capability::FeaturedListings,
        Capability::MarketAnalytics,
        Capability::AgencyDashboard,
        Capability::BulkListingImport,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct CapabilitySet {
    pub tier: PlanTier,
    pub capabilities: Vec<Capability>,
}

impl CapabilitySet {
    pub fn for_tier(tier: PlanTier) -> Self {
        Self {
            tier,
            capabilities: Capability::ALL
                .into_iter()
                .filter(|c| c.minimum_tier() <= tier)
                .collect(),
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl From<&Entitlement> for CapabilitySet {
    fn from(entitlement: &Entitlement) -> Self {
        CapabilitySet::for_tier(entitlement.tier)
    }
}
