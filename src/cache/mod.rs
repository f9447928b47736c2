//! Caches - everything the engine consults before going to a collaborator
//!
//! All maps are sharded (`DashMap`); no cache has a global lock.

pub mod locks;
pub mod ttl;
pub mod quote;
pub mod reservation;
pub mod entity;

pub use locks::{KeyGuard, KeyedLocks};
pub use ttl::TtlCache;
pub use quote::QuoteCache;
pub use reservation::ReservationCache;
pub use entity::EntityCache;
