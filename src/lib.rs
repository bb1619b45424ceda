//! Real-time training status pipeline.
//!
//! Follows asynchronous agent-training jobs over a per-agent event stream,
//! survives network interruptions, and persists in-flight jobs so a restart
//! picks them back up.
//!
//! # Architecture
//!
//! - `stream`: SSE transport, per-agent connections with backoff, and
//!   normalization of wire frames into canonical events
//! - `bus`: canonical event types and the bounded event log
//! - `db`: SQLite-backed key/value storage and the training task store
//! - `runtime`: subscription registry, orchestrator, and `TrainingMonitor`
//! - `config`: environment-driven configuration

pub mod bus;
pub mod config;
pub mod db;
pub mod runtime;
pub mod stream;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, MonitorConfig};
pub use runtime::{TrainingListener, TrainingMonitor, TrainingOrchestrator, TrainingState};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("training start request failed: {0}")]
    StartRequest(#[source] runtime::ApiError),
    #[error("training cancel request failed: {0}")]
    CancelRequest(#[source] runtime::ApiError),
    #[error("training start was cancelled before it completed")]
    Cancelled,
    #[error("agent {0} is already training")]
    AlreadyTraining(String),
    #[error("training API client: {0}")]
    Api(#[source] runtime::ApiError),
    #[error("{0}")]
    Store(#[from] db::StoreError),
    #[error("{0}")]
    Db(#[from] db::DbError),
    #[error("{0}")]
    Transport(#[from] stream::TransportError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    DataDir(String),
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("training_stream=debug,info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
