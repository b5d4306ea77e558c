pub mod checkout_service;
pub mod entitlement_service;
pub mod reconciliation_service;
pub mod subscription_machine;
pub mod subscription_service;
pub mod webhook_service;

#[cfg(test)]
mod scenario_tests;

pub use checkout_service::*;
pub use entitlement_service::*;
pub use reconciliation_service::*;
pub use subscription_service::*;
pub use webhook_service::*;
