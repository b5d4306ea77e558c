pub mod subscriptions;
pub mod webhook_events;

pub use subscriptions::{PlanTier, SubscriptionStatus};
pub use webhook_events::ProcessingStatus;

pub use subscriptions as subscription_entity;
pub use webhook_events as webhook_event_entity;
