//! Cache storage engine for a self-hosted GitHub Actions cache.
//!
//! - Key resolution with exact and prefix tiers over primary and restore keys
//! - Multi-part upload sessions committed atomically into cache entries
//! - Lazy merge of parts into one object on first download
//! - Retention jobs and their scheduler
//!
//! The HTTP surface is limited to a health check; API handlers build on
//! [`CacheEngine`].

pub mod engine;
pub mod error;
pub mod merge;
pub mod resolver;
pub mod retention;
pub mod routes;
pub mod scheduler;
pub mod state;
pub mod uploads;

pub use engine::CacheEngine;
pub use error::{EngineError, EngineResult, ErrorResponse};
pub use resolver::{CacheMatch, MatchKind, resolve};
pub use retention::RetentionStats;
pub use routes::create_router;
pub use scheduler::{RetentionTasks, run_housekeeping, spawn_retention};
pub use state::AppState;
