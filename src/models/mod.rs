pub mod billing;
pub mod common;
pub mod entitlement;

pub use billing::*;
pub use common::*;
pub use entitlement::*;
