//! REST client for the deployment platform

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, header};
use tokio::sync::watch;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use buildscope_types::{Deployment, LogsQuery, ReadyState};

use crate::error::ApiError;
use crate::source::{EventBody, EventSource};

/// Default platform API endpoint
pub const DEFAULT_API_URL: &str = "https://api.vercel.com";

/// Connection settings for [`ApiClient`]
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Deployment status polling options
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Delay between status checks
    pub interval: Duration,

    /// Give up after this long
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(4 * 60),
        }
    }
}

/// HTTP client for the deployment platform
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new client.
    ///
    /// Only the connect phase is bounded: follow-mode event streams stay open
    /// for as long as the build runs.
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Open the build events feed of a deployment
    pub async fn deployment_events(
        &self,
        deployment_id: &str,
        query: &LogsQuery,
    ) -> Result<EventBody, ApiError> {
        let url = format!("{}/v3/deployments/{}/events", self.base_url, deployment_id);
        debug!(%url, ?query, "GET deployment events");

        let response = self
            .authorized(self.client.get(&url))
            .query(query)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let bytes = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(bytes)))
    }

    /// Fetch the current state of a deployment
    pub async fn get_deployment(&self, id_or_url: &str) -> Result<Deployment, ApiError> {
        let url = format!("{}/v13/deployments/{}", self.base_url, id_or_url);
        debug!(%url, "GET deployment");

        let response = self
            .authorized(self.client.get(&url))
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Poll a deployment until it becomes ready.
    ///
    /// Every observed state is published on `updates`. Terminal failure states
    /// return [`ApiError::DeploymentFailed`].
    pub async fn poll_deployment(
        &self,
        id_or_url: &str,
        options: &PollOptions,
        updates: &watch::Sender<Option<Deployment>>,
    ) -> Result<Deployment, ApiError> {
        poll_until_finished(|| self.get_deployment(id_or_url), options, updates).await
    }
}

#[async_trait]
impl EventSource for ApiClient {
    async fn open_events(
        &self,
        deployment_id: &str,
        query: &LogsQuery,
    ) -> Result<EventBody, ApiError> {
        self.deployment_events(deployment_id, query).await
    }
}

async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("HTTP GET failed: {} - {}", status, body);
    Err(ApiError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn poll_until_finished<F, Fut>(
    mut fetch: F,
    options: &PollOptions,
    updates: &watch::Sender<Option<Deployment>>,
) -> Result<Deployment, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Deployment, ApiError>>,
{
    let started = tokio::time::Instant::now();

    loop {
        let deployment = fetch().await?;
        updates.send_replace(Some(deployment.clone()));

        match &deployment.ready_state {
            ReadyState::Ready => {
                info!(id = %deployment.id, "deployment ready");
                return Ok(deployment);
            }
            state @ (ReadyState::Error | ReadyState::Canceled | ReadyState::Deleted) => {
                return Err(ApiError::DeploymentFailed(state.to_string()));
            }
            state => debug!(id = %deployment.id, %state, "deployment not finished"),
        }

        if started.elapsed() >= options.timeout {
            return Err(ApiError::Timeout(options.timeout));
        }
        tokio::time::sleep(options.interval).await;
    }
}
