pub mod auth;
pub mod capabilities;
pub mod cors;

pub use auth::{AuthMiddleware, CurrentUser};
pub use capabilities::RequestCapabilities;
pub use cors::create_cors;
