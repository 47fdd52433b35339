//! Notification storage backends.

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;
pub use traits::{DetectionCommit, InsertOutcome, NotificationStorage};
