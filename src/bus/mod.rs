//! Canonical training events and the in-memory log that fans them out.
//!
//! Events flow from the stream dispatcher → `EventLogStore`:
//! - `event_types`: canonical event taxonomy shared by every layer
//! - `EventLogStore`: bounded ring buffer, push subscription via broadcast,
//!   and a sequence cursor for consumers that sample instead of subscribe

pub mod event_log;
pub mod event_types;

pub use event_log::{EventLogEntry, EventLogStore, DEFAULT_EVENT_LOG_CAPACITY};
pub use event_types::{CanonicalEvent, EventKind, ProgressMetadata, TrainingPhase};
