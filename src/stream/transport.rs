//! Streaming transport for training status frames.
//!
//! `TrainingTransport` is the seam the connection manager drives. The
//! production implementation, `HttpSseTransport`, opens a bearer-authenticated
//! SSE stream per agent.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use tracing::{debug, info};

use super::sse::{SseDecoder, SseEvent};

/// Default connect timeout for the stream request.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames decoded from one open transport, in arrival order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseEvent, TransportError>> + Send>>;

// ============================================================================
// Transport Error Types
// ============================================================================

/// Connection-level failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection error.
    Connection(String),
    /// Timeout error.
    Timeout(Duration),
    /// Non-success HTTP status when opening the stream.
    Http { status: u16, message: String },
    /// The server closed the stream.
    StreamEnded,
    /// Client or header construction failed.
    Config(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connection(msg) => write!(f, "Connection error: {}", msg),
            TransportError::Timeout(duration) => write!(f, "Timeout after {:?}", duration),
            TransportError::Http { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            TransportError::StreamEnded => write!(f, "Stream ended by server"),
            TransportError::Config(msg) => write!(f, "Transport configuration error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// Create a transport error from any error type.
    pub fn connection<E: fmt::Display>(err: E) -> Self {
        TransportError::Connection(err.to_string())
    }

    /// Check if this error is retryable.
    ///
    /// Authentication and routing failures will not heal by reconnecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(_)
            | TransportError::Timeout(_)
            | TransportError::StreamEnded => true,
            TransportError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            TransportError::Config(_) => false,
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

#[async_trait]
pub trait TrainingTransport: Send + Sync {
    /// Open the status stream for one agent.
    ///
    /// `last_event_id` is the id of the last frame received on the same
    /// subscription, if any. Returns once the server accepted the stream;
    /// frames then arrive on the returned stream until it errors or ends.
    async fn connect(
        &self,
        agent_id: &str,
        token: &str,
        last_event_id: Option<&str>,
    ) -> Result<FrameStream, TransportError>;
}

// ============================================================================
// HTTP SSE Transport
// ============================================================================

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

pub struct HttpSseTransport {
    client: reqwest::Client,
    base_url: String,
    connect_timeout: Duration,
}

impl HttpSseTransport {
    pub fn new(base_url: impl Into<String>, config: TransportConfig) -> Result<Self, TransportError> {
        let base_url = base_url.into();
        info!("Creating training stream transport for URL: {}", base_url);

        // No overall request timeout: the stream is meant to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| TransportError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout: config.connect_timeout,
        })
    }

    fn stream_url(&self, agent_id: &str) -> String {
        format!(
            "{}/agents/{}/training/stream",
            self.base_url,
            urlencoding::encode(agent_id)
        )
    }
}

#[async_trait]
impl TrainingTransport for HttpSseTransport {
    async fn connect(
        &self,
        agent_id: &str,
        token: &str,
        last_event_id: Option<&str>,
    ) -> Result<FrameStream, TransportError> {
        let url = self.stream_url(agent_id);

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .bearer_auth(token);

        if let Some(last_id) = last_event_id {
            debug!(agent_id, event_id = last_id, "resuming training stream");
            request = request.header("Last-Event-ID", last_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.connect_timeout)
            } else {
                TransportError::connection(format!("Failed to connect to training stream: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        info!("Connected to training stream at {}", url);

        let mut decoder = SseDecoder::new();
        let frames = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(TransportError::connection(format!("Stream error: {}", e)))],
            })
            .flat_map(stream::iter);

        Ok(Box::pin(frames))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::connection::{ConnectionManager, ReconnectPolicy};
    use httpmock::Method::GET;
    use std::sync::Arc;
    use httpmock::MockServer;

    #[test]
    fn test_transport_error_is_retryable() {
        assert!(TransportError::Connection("test".to_string()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TransportError::StreamEnded.is_retryable());
        assert!(TransportError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Http {
            status: 401,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_stream_url_encodes_agent_id() {
        let transport =
            HttpSseTransport::new("http://localhost:9000/api/", TransportConfig::default()).unwrap();
        assert_eq!(
            transport.stream_url("team a/42"),
            "http://localhost:9000/api/agents/team%20a%2F42/training/stream"
        );
    }

    #[tokio::test]
    async fn test_connect_decodes_frames_with_bearer_token() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/agents/42/training/stream")
                .header("authorization", "Bearer secret")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(
                    "event: training_connected\nid: 1\ndata: {\"agent_id\":\"42\"}\n\n\
                     event: training_training\nid: 2\ndata: {\"status\":\"training\"}\n\n",
                );
        });

        let transport = HttpSseTransport::new(server.base_url(), TransportConfig::default()).unwrap();
        let frames: Vec<_> = transport
            .connect("42", "secret", None)
            .await
            .expect("stream should open")
            .collect()
            .await;

        mock.assert();
        assert_eq!(frames.len(), 2);
        let first = frames[0].as_ref().unwrap();
        assert_eq!(first.event_type, "training_connected");
        assert_eq!(first.id.as_deref(), Some("1"));
        assert_eq!(frames[1].as_ref().unwrap().event_type, "training_training");
    }

    #[tokio::test]
    async fn test_connect_sends_last_event_id_only_when_given() {
        let server = MockServer::start();
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/agents/7/training/stream")
                .header_missing("last-event-id");
            then.status(200).body("id: abc\nevent: training_connected\ndata: {}\n\n");
        });
        let resumed = server.mock(|when, then| {
            when.method(GET)
                .path("/agents/7/training/stream")
                .header("last-event-id", "abc");
            then.status(200).body("");
        });

        let transport = HttpSseTransport::new(server.base_url(), TransportConfig::default()).unwrap();
        let frames: Vec<_> = transport.connect("7", "t", None).await.unwrap().collect().await;
        assert_eq!(frames[0].as_ref().unwrap().id.as_deref(), Some("abc"));
        let _: Vec<_> = transport.connect("7", "t", Some("abc")).await.unwrap().collect().await;
        let _: Vec<_> = transport.connect("7", "t", None).await.unwrap().collect().await;

        fresh.assert_hits(2);
        resumed.assert();
    }

    #[tokio::test]
    async fn test_new_subscription_does_not_carry_previous_event_id() {
        let server = MockServer::start();
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/agents/7/training/stream")
                .header_missing("last-event-id");
            then.status(200).body("id: old-job-99\nevent: training_training\ndata: {}\n\n");
        });
        let resumed = server.mock(|when, then| {
            when.method(GET)
                .path("/agents/7/training/stream")
                .header_exists("last-event-id");
            then.status(200).body("");
        });

        let transport = HttpSseTransport::new(server.base_url(), TransportConfig::default()).unwrap();
        let (manager, mut frames) =
            ConnectionManager::new(Arc::new(transport), ReconnectPolicy::default());

        manager.open("7", "t");
        let first = frames.recv().await.unwrap();
        assert_eq!(first.frame.id.as_deref(), Some("old-job-99"));
        manager.close("7");

        manager.open("7", "t");
        frames.recv().await.unwrap();
        manager.close("7");

        fresh.assert_hits(2);
        resumed.assert_hits(0);
    }

    #[tokio::test]
    async fn test_connect_maps_http_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/agents/9/training/stream");
            then.status(401).body("unauthorized");
        });

        let transport = HttpSseTransport::new(server.base_url(), TransportConfig::default()).unwrap();
        let err = match transport.connect("9", "bad", None).await {
            Ok(_) => panic!("expected HTTP error"),
            Err(e) => e,
        };
        assert_eq!(
            err,
            TransportError::Http {
                status: 401,
                message: "unauthorized".to_string()
            }
        );
        assert!(!err.is_retryable());
    }
}
