//! A decentralized anomaly-detection consensus engine: a population of
//! peer agents independently scores traffic for anomalies, broadcasts
//! signatures through a shared append-only ledger, cross-validates its
//! peers' claims, and converges on a shared blacklist once enough
//! independent votes agree.

pub mod agents;
pub mod cancellation;
pub mod config;
pub mod consensus;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod scheduler;
pub mod traffic;
pub mod types;

pub use config::{EngineOptions, LedgerOptions};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, EngineResult};
pub use events::{EventSink, NullEventSink, SharedEventSink, TracingEventSink};

use tracing::{info, instrument};

/// Initialize process-wide structured logging. Call once, from `main`.
#[instrument]
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("sentrymesh engine initialized");
}
