//! Start and cancel requests against the training backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Response(String),
}

#[async_trait]
pub trait TrainingApi: Send + Sync {
    /// Ask the backend to train `agent_id` on `source_ids`. Returns the task id.
    async fn start_training(&self, agent_id: &str, source_ids: &[String])
        -> Result<String, ApiError>;

    async fn cancel_training(&self, agent_id: &str, task_id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    source_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(alias = "taskId")]
    task_id: String,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    task_id: &'a str,
}

pub struct HttpTrainingApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTrainingApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Request(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn agent_url(&self, agent_id: &str, suffix: &str) -> String {
        format!(
            "{}/agents/{}/{}",
            self.base_url,
            urlencoding::encode(agent_id),
            suffix
        )
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Http {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl TrainingApi for HttpTrainingApi {
    async fn start_training(
        &self,
        agent_id: &str,
        source_ids: &[String],
    ) -> Result<String, ApiError> {
        let response = self
            .client
            .post(self.agent_url(agent_id, "train"))
            .bearer_auth(&self.token)
            .json(&StartRequest { source_ids })
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let body: StartResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Response(e.to_string()))?;

        if body.task_id.trim().is_empty() {
            return Err(ApiError::Response("empty task id".to_string()));
        }
        info!(agent_id, task_id = %body.task_id, "training job accepted");
        Ok(body.task_id)
    }

    async fn cancel_training(&self, agent_id: &str, task_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.agent_url(agent_id, "train/cancel"))
            .bearer_auth(&self.token)
            .json(&CancelRequest { task_id })
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        check_status(response).await?;
        info!(agent_id, task_id, "training job cancelled");
        Ok(())
    }
}
