//! Training status stream client.
//!
//! This module provides:
//! - `sse`: incremental Server-Sent Events decoding
//! - `transport`: the `TrainingTransport` seam and its HTTP implementation
//! - `connection`: per-agent connection slots with backoff reconnection
//! - `normalizer`: wire frames to canonical events

pub mod connection;
pub mod normalizer;
pub mod sse;
pub mod transport;


pub use connection::{
    CloseReason, ConnectionManager, ConnectionStatus, ConnectionUpdate, InboundFrame,
    ReconnectPolicy,
};
pub use normalizer::{EventNormalizer, ProtocolError, TaskLookup};
pub use sse::{SseDecoder, SseEvent};
pub use transport::{FrameStream, HttpSseTransport, TrainingTransport, TransportConfig, TransportError};
