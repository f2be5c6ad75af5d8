use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncBufRead;

use buildscope_types::LogsQuery;

use crate::error::ApiError;

/// Response body of the events endpoint: newline-delimited JSON when
/// following, a single JSON array otherwise.
pub type EventBody = Pin<Box<dyn AsyncBufRead + Send>>;

/// Transport for the deployment events feed
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open the events feed for a deployment.
    ///
    /// Non-2xx responses are reported as [`ApiError::Status`].
    async fn open_events(
        &self,
        deployment_id: &str,
        query: &LogsQuery,
    ) -> Result<EventBody, ApiError>;
}
