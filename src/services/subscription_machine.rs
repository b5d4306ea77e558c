//! 订阅生命周期状态机
//!
//! 纯函数：输入当前状态、事件和当前时间，输出下一个状态与需要记录的副作用。
//! 加锁和持久化由调用方负责。

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::config::StripeConfig;
use crate::entities::{PlanTier, SubscriptionStatus, subscription_entity};
use crate::error::AppResult;
use crate::external::provider::{
    EventKind, InvoiceSummary, ProviderEvent, ProviderStatus, ProviderSubscriptionSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionState {
    pub fn free() -> Self {
        Self {
            tier: PlanTier::Free,
            status: SubscriptionStatus::Inactive,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    /// 是否持有已付费的周期；incomplete 从未付款，不算
    pub fn holds_paid_access(&self) -> bool {
        self.tier.is_paid()
            && matches!(
                self.status,
                SubscriptionStatus::Trialing
                    | SubscriptionStatus::Active
                    | SubscriptionStatus::PastDue
                    | SubscriptionStatus::Canceled
            )
    }

    /// 写回数据库行，id 与版本号不动
    pub fn write_to(&self, row: &mut subscription_entity::Model) {
        row.tier = self.tier;
        row.status = self.status;
        row.stripe_subscription_id = self.stripe_subscription_id.clone();
        row.stripe_customer_id = self.stripe_customer_id.clone();
        row.current_period_start = self.current_period_start;
        row.current_period_end = self.current_period_end;
        row.cancel_at_period_end = self.cancel_at_period_end;
    }

    fn from_snapshot(
        snapshot: &ProviderSubscriptionSnapshot,
        status: SubscriptionStatus,
        tier: PlanTier,
        fallback_customer: Option<&String>,
    ) -> Self {
        Self {
            tier,
            status,
            stripe_subscription_id: Some(snapshot.id.clone()),
            stripe_customer_id: snapshot
                .customer_id
                .clone()
                .or_else(|| fallback_customer.cloned()),
            current_period_start: snapshot.current_period_start,
            current_period_end: snapshot.current_period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
        }
    }
}

impl From<&subscription_entity::Model> for SubscriptionState {
    fn from(row: &subscription_entity::Model) -> Self {
        Self {
            tier: row.tier,
            status: row.status,
            stripe_subscription_id: row.stripe_subscription_id.clone(),
            stripe_customer_id: row.stripe_customer_id.clone(),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
        }
    }
}

/// 转换成本地语义的 Stripe 通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    SubscriptionCreated(ProviderSubscriptionSnapshot),
    SubscriptionUpdated(ProviderSubscriptionSnapshot),
    SubscriptionDeleted(ProviderSubscriptionSnapshot),
    PaymentSucceeded(InvoiceSummary),
    PaymentFailed(InvoiceSummary),
}

impl BillingEvent {
    /// 不关心的事件类型返回 `Ok(None)`
    pub fn from_provider(event: &ProviderEvent, stripe: &StripeConfig) -> AppResult<Option<Self>> {
        let object = &event.data.object;
        let snapshot = || -> AppResult<ProviderSubscriptionSnapshot> {
            let mut snapshot = ProviderSubscriptionSnapshot::from_object(object)?;
            snapshot.resolve_tier(stripe);
            Ok(snapshot)
        };
        let parsed = match event.kind() {
            EventKind::SubscriptionCreated => BillingEvent::SubscriptionCreated(snapshot()?),
            EventKind::SubscriptionUpdated => BillingEvent::SubscriptionUpdated(snapshot()?),
            EventKind::SubscriptionDeleted => BillingEvent::SubscriptionDeleted(snapshot()?),
            EventKind::PaymentSucceeded => {
                BillingEvent::PaymentSucceeded(InvoiceSummary::from_object(object)?)
            }
            EventKind::PaymentFailed => {
                BillingEvent::PaymentFailed(InvoiceSummary::from_object(object)?)
            }
            EventKind::Irrelevant => return Ok(None),
        };
        Ok(Some(parsed))
    }

    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::SubscriptionCreated(_) => "subscription.created",
            BillingEvent::SubscriptionUpdated(_) => "subscription.updated",
            BillingEvent::SubscriptionDeleted(_) => "subscription.deleted",
            BillingEvent::PaymentSucceeded(_) => "payment.succeeded",
            BillingEvent::PaymentFailed(_) => "payment.failed",
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            BillingEvent::SubscriptionCreated(s)
            | BillingEvent::SubscriptionUpdated(s)
            | BillingEvent::SubscriptionDeleted(s) => Some(s.id.as_str()),
            BillingEvent::PaymentSucceeded(i) | BillingEvent::PaymentFailed(i) => {
                i.subscription_id.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Started,
    Resubscribed,
    Activated,
    PeriodRefreshed,
    TierChanged { from: PlanTier, to: PlanTier },
    CancellationScheduled,
    CancellationCleared,
    GraceStarted,
    PaymentRecovered,
    AccessDeferred,
    DowngradedToFree,
}

impl std::fmt::Display for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SideEffect::Started => write!(f, "started"),
            SideEffect::Resubscribed => write!(f, "resubscribed"),
            SideEffect::Activated => write!(f, "activated"),
            SideEffect::PeriodRefreshed => write!(f, "period_refreshed"),
            SideEffect::TierChanged { from, to } => write!(f, "tier_changed({from}->{to})"),
            SideEffect::CancellationScheduled => write!(f, "cancellation_scheduled"),
            SideEffect::CancellationCleared => write!(f, "cancellation_cleared"),
            SideEffect::GraceStarted => write!(f, "grace_started"),
            SideEffect::PaymentRecovered => write!(f, "payment_recovered"),
            SideEffect::AccessDeferred => write!(f, "access_deferred"),
            SideEffect::DowngradedToFree => write!(f, "downgraded_to_free"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SubscriptionState,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    fn unchanged(current: &SubscriptionState) -> Self {
        Self {
            next: current.clone(),
            effects: Vec::new(),
        }
    }

    fn to(next: SubscriptionState, effects: Vec<SideEffect>) -> Self {
        Self { next, effects }
    }

    pub fn is_noop(&self, current: &SubscriptionState) -> bool {
        self.next == *current
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{event} is not allowed while the subscription is {status}")]
    NotAllowed {
        status: SubscriptionStatus,
        event: &'static str,
    },

    #[error("{event} refers to {incoming} but the record tracks {tracked}")]
    SubscriptionMismatch {
        event: &'static str,
        tracked: String,
        incoming: String,
    },

    #[error("subscription {id} reports {status:?}, which cannot start a subscription")]
    UnsupportedStatus { id: String, status: ProviderStatus },

    #[error("subscription {0} has no resolvable paid tier")]
    MissingTier(String),

    #[error("subscription {0} has no billing period")]
    MissingPeriod(String),
}

/// 把 webhook 事件应用到当前状态
pub fn transition(
    current: &SubscriptionState,
    event: &BillingEvent,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    use SubscriptionStatus as S;

    let not_allowed = || TransitionError::NotAllowed {
        status: current.status,
        event: event.name(),
    };

    // 携带的订阅 id 与记录不一致时一律拒绝（created 除外，它可能是新订阅）
    if !matches!(event, BillingEvent::SubscriptionCreated(_))
        && let (Some(tracked), Some(incoming)) = (
            current.stripe_subscription_id.as_deref(),
            event.subscription_id(),
        )
        && tracked != incoming
    {
        return Err(TransitionError::SubscriptionMismatch {
            event: event.name(),
            tracked: tracked.to_string(),
            incoming: incoming.to_string(),
        });
    }

    match event {
        BillingEvent::SubscriptionCreated(snapshot) => {
            if !matches!(current.status, S::Inactive | S::Canceled | S::Incomplete) {
                return Err(not_allowed());
            }
            let status = match snapshot.status {
                ProviderStatus::Trialing => S::Trialing,
                ProviderStatus::Active => S::Active,
                ProviderStatus::Incomplete => S::Incomplete,
                other => {
                    return Err(TransitionError::UnsupportedStatus {
                        id: snapshot.id.clone(),
                        status: other,
                    });
                }
            };
            let tier = snapshot
                .tier
                .ok_or_else(|| TransitionError::MissingTier(snapshot.id.clone()))?;
            if status != S::Incomplete && snapshot.current_period_end.is_none() {
                return Err(TransitionError::MissingPeriod(snapshot.id.clone()));
            }

            let mut next = SubscriptionState::from_snapshot(
                snapshot,
                status,
                tier,
                current.stripe_customer_id.as_ref(),
            );
            next.cancel_at_period_end = false;
            let effect = if current.status == S::Canceled {
                SideEffect::Resubscribed
            } else {
                SideEffect::Started
            };
            Ok(Transition::to(next, vec![effect]))
        }

        BillingEvent::SubscriptionUpdated(snapshot) => {
            if current.stripe_subscription_id.is_none() {
                return Err(not_allowed());
            }
            let next_status = match (current.status, snapshot.status) {
                (S::Trialing, ProviderStatus::Active) | (S::Incomplete, ProviderStatus::Active) => {
                    S::Active
                }
                (S::Incomplete, ProviderStatus::Trialing) => S::Trialing,
                (S::Trialing, ProviderStatus::Trialing)
                | (S::Active, ProviderStatus::Active)
                | (S::PastDue, ProviderStatus::PastDue) => current.status,
                (S::Canceled, ProviderStatus::Canceled) => return Ok(Transition::unchanged(current)),
                _ => return Err(not_allowed()),
            };

            let mut next = current.clone();
            let mut effects = Vec::new();
            next.status = next_status;
            if next_status != current.status {
                effects.push(SideEffect::Activated);
            }

            // past_due 期间周期不前移，current_period_end 是宽限期的锚点；
            // 乱序到达的旧快照也不能让周期倒退
            if next_status != S::PastDue
                && let Some(end) = snapshot.current_period_end
                && current.current_period_end.is_none_or(|current_end| end > current_end)
            {
                next.current_period_start = snapshot.current_period_start;
                next.current_period_end = Some(end);
                effects.push(SideEffect::PeriodRefreshed);
            }

            if let Some(tier) = snapshot.tier
                && tier != current.tier
            {
                next.tier = tier;
                effects.push(SideEffect::TierChanged {
                    from: current.tier,
                    to: tier,
                });
            }

            if snapshot.cancel_at_period_end != current.cancel_at_period_end {
                next.cancel_at_period_end = snapshot.cancel_at_period_end;
                effects.push(if snapshot.cancel_at_period_end {
                    SideEffect::CancellationScheduled
                } else {
                    SideEffect::CancellationCleared
                });
            }

            if next.stripe_customer_id.is_none() {
                next.stripe_customer_id = snapshot.customer_id.clone();
            }
            Ok(Transition::to(next, effects))
        }

        BillingEvent::SubscriptionDeleted(snapshot) => {
            if current.status == S::Inactive {
                return Ok(Transition::unchanged(current));
            }
            let period_end = current.current_period_end.or(snapshot.current_period_end);
            match period_end {
                // 只有已付费的周期才延后到期；未付款的订阅直接回到免费
                Some(end) if end > now && current.holds_paid_access() => {
                    let mut next = current.clone();
                    next.status = S::Canceled;
                    next.cancel_at_period_end = true;
                    next.current_period_end = Some(end);
                    if next == *current {
                        return Ok(Transition::unchanged(current));
                    }
                    Ok(Transition::to(next, vec![SideEffect::AccessDeferred]))
                }
                _ => Ok(Transition::to(
                    SubscriptionState::free(),
                    vec![SideEffect::DowngradedToFree],
                )),
            }
        }

        BillingEvent::PaymentSucceeded(invoice) => {
            if current.stripe_subscription_id.is_none() {
                return Err(not_allowed());
            }
            match current.status {
                S::Trialing => Ok(Transition::unchanged(current)),
                S::Active => {
                    let mut next = current.clone();
                    if refresh_period(&mut next, invoice) {
                        Ok(Transition::to(next, vec![SideEffect::PeriodRefreshed]))
                    } else {
                        Ok(Transition::unchanged(current))
                    }
                }
                S::PastDue | S::Incomplete => {
                    let mut next = current.clone();
                    next.status = S::Active;
                    let mut effects = vec![SideEffect::PaymentRecovered];
                    if refresh_period(&mut next, invoice) {
                        effects.push(SideEffect::PeriodRefreshed);
                    }
                    Ok(Transition::to(next, effects))
                }
                _ => Err(not_allowed()),
            }
        }

        BillingEvent::PaymentFailed(_) => match current.status {
            S::Active | S::Trialing => {
                let mut next = current.clone();
                next.status = S::PastDue;
                Ok(Transition::to(next, vec![SideEffect::GraceStarted]))
            }
            S::PastDue | S::Incomplete => Ok(Transition::unchanged(current)),
            _ => Err(not_allowed()),
        },
    }
}

/// 仅当发票周期更晚时才前移
fn refresh_period(next: &mut SubscriptionState, invoice: &InvoiceSummary) -> bool {
    match invoice.period_end {
        Some(end) if next.current_period_end.is_none_or(|current| end > current) => {
            next.current_period_start = invoice.period_start.or(next.current_period_start);
            next.current_period_end = Some(end);
            true
        }
        _ => false,
    }
}

/// 以 Stripe 的状态覆盖本地状态；已失效的访问权限一律落到免费 / inactive
pub fn reconcile(
    current: &SubscriptionState,
    snapshot: &ProviderSubscriptionSnapshot,
    now: DateTime<Utc>,
    grace: Duration,
) -> Result<Transition, TransitionError> {
    use SubscriptionStatus as S;

    let paid_tier = || {
        snapshot
            .tier
            .or(Some(current.tier).filter(PlanTier::is_paid))
            .ok_or_else(|| TransitionError::MissingTier(snapshot.id.clone()))
    };
    let customer = current.stripe_customer_id.as_ref();

    let next = match snapshot.status {
        ProviderStatus::Trialing | ProviderStatus::Active | ProviderStatus::Incomplete => {
            let status = match snapshot.status {
                ProviderStatus::Trialing => S::Trialing,
                ProviderStatus::Active => S::Active,
                _ => S::Incomplete,
            };
            SubscriptionState::from_snapshot(snapshot, status, paid_tier()?, customer)
        }
        ProviderStatus::PastDue => {
            // 已付费时间在当前（未付）周期开始时结束
            let anchor = snapshot
                .current_period_start
                .or(current.current_period_end)
                .ok_or_else(|| TransitionError::MissingPeriod(snapshot.id.clone()))?;
            if anchor + grace <= now {
                SubscriptionState::free()
            } else {
                let mut next =
                    SubscriptionState::from_snapshot(snapshot, S::PastDue, paid_tier()?, customer);
                next.current_period_start = current
                    .current_period_start
                    .filter(|start| *start < anchor);
                next.current_period_end = Some(anchor);
                next
            }
        }
        ProviderStatus::Canceled => match snapshot.current_period_end {
            Some(end) if end > now && current.holds_paid_access() => {
                let mut next =
                    SubscriptionState::from_snapshot(snapshot, S::Canceled, paid_tier()?, customer);
                next.cancel_at_period_end = true;
                next
            }
            _ => SubscriptionState::free(),
        },
        ProviderStatus::Unpaid | ProviderStatus::IncompleteExpired | ProviderStatus::Paused => {
            SubscriptionState::free()
        }
    };

    Ok(diff(current, next))
}

/// 没有 Stripe 订阅 id 的行只能按本地数据结算
pub fn finalize_locally(
    current: &SubscriptionState,
    now: DateTime<Utc>,
    grace: Duration,
) -> Transition {
    let lapsed = match current.status {
        SubscriptionStatus::Inactive => false,
        SubscriptionStatus::PastDue => current
            .current_period_end
            .is_none_or(|end| end + grace <= now),
        _ => current.current_period_end.is_none_or(|end| end <= now),
    };
    if lapsed {
        diff(current, SubscriptionState::free())
    } else {
        Transition::unchanged(current)
    }
}

fn diff(current: &SubscriptionState, next: SubscriptionState) -> Transition {
    if next == *current {
        return Transition::unchanged(current);
    }
    let mut effects = Vec::new();
    if next.tier == PlanTier::Free && current.tier != PlanTier::Free {
        effects.push(SideEffect::DowngradedToFree);
    } else if next.tier != current.tier {
        effects.push(SideEffect::TierChanged {
            from: current.tier,
            to: next.tier,
        });
    }
    if next.status != current.status && next.status == SubscriptionStatus::Active {
        effects.push(SideEffect::Activated);
    }
    if next.current_period_end != current.current_period_end && next.tier.is_paid() {
        effects.push(SideEffect::PeriodRefreshed);
    }
    if next.cancel_at_period_end && !current.cancel_at_period_end {
        effects.push(SideEffect::CancellationScheduled);
    }
    Transition::to(next, effects)
}
