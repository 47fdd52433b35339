//! AgriLink Core - price-alert and realtime notification pipeline.
//!
//! This crate implements the one marketplace subsystem with real
//! concurrency concerns:
//! - Periodic price-movement detection against per-pair baselines
//! - Cooldown-deduplicated notification persistence
//! - Room-partitioned, best-effort realtime broadcast
//!
//! The HTTP/CRUD surface, authentication, and the price-history ingest
//! path live elsewhere and consume this crate.

pub mod db;
pub mod detector;
pub mod error;
pub mod hub;
pub mod models;
pub mod price_store;
pub mod repository;
pub mod storage;

pub use detector::{CycleReport, DetectorConfig, PriceChangeDetector};
pub use error::{PipelineError, Result};
pub use hub::{BroadcastReport, ConnectionHandle, HubConfig, RealtimeHub};
pub use repository::{CreateOutcome, NotificationRepository, RepositoryConfig};
