pub mod billing;
pub mod webhook;

pub use billing::billing_config;
pub use webhook::webhook_config;
