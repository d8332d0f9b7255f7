//! HTTP callback transport.
//!
//! Bridges the callback traits to remote webhook endpoints: task requests
//! are POSTed to `{base_url}/tasks` and decision requests to
//! `{base_url}/decisions`, with the JSON envelopes from [`crate::registry`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::registry::{
    CallbackFailure, DecisionCallback, DecisionRequest, DecisionResponse, TaskCallback,
    TaskCompletion, TaskRequest,
};

/// A callback backed by a remote HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpCallback {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCallback {
    /// Create a callback client for the given base URL.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, CallbackFailure>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(request)
            .send()
            .await
            .map_err(|e| CallbackFailure::Transport(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| CallbackFailure::Rejected(format!("malformed response body: {}", e))),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                Err(CallbackFailure::Rejected(body))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(CallbackFailure::Transport(format!(
                    "status {}: {}",
                    status, body
                )))
            }
        }
    }
}

#[async_trait]
impl TaskCallback for HttpCallback {
    async fn invoke(&self, request: TaskRequest) -> Result<TaskCompletion, CallbackFailure> {
        self.post("/tasks", &request).await
    }
}

#[async_trait]
impl DecisionCallback for HttpCallback {
    async fn decide(&self, request: DecisionRequest) -> Result<DecisionResponse, CallbackFailure> {
        self.post("/decisions", &request).await
    }
}
