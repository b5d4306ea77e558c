pub mod clock;
pub mod jwt;
pub mod keyed_lock;

pub use clock::*;
pub use jwt::*;
pub use keyed_lock::KeyedLocks;
