pub mod gateway;
pub mod provider;
pub mod stripe;

#[cfg(test)]
pub mod fake;

pub use gateway::*;
pub use provider::*;
pub use self::stripe::StripeGateway;
