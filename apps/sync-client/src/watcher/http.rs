//! HTTP status accessor: `GET {base}/operations/{id}` → `{"state": ".."}`.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SyncError;
use crate::models::operation::OperationState;

use super::StatusSource;

#[derive(Clone)]
pub struct HttpStatusSource {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: OperationState,
}

impl HttpStatusSource {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn get_state(&self, operation_id: &str) -> Result<OperationState, SyncError> {
        let url = format!("{}/operations/{}", self.base_url, operation_id);

        let resp: StatusResponse = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| SyncError::poll_fetch(operation_id, e.to_string()))?
            .json()
            .await
            .map_err(|e| SyncError::poll_fetch(operation_id, e.to_string()))?;

        Ok(resp.state)
    }
}
