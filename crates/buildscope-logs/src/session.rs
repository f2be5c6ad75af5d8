use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use buildscope_api::EventSource;
use buildscope_types::{ArcBuildLog, Deployment, ProcessedStep};

use crate::buffer::{LogStore, MAX_DISPLAYED_LOGS};
use crate::classifier::LineClassifier;
use crate::fetcher::{LogFetcher, RECONNECT_DELAY};
use crate::steps::{latest_log, latest_log_text, project_steps};

/// Session tuning
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub reconnect_delay: Duration,
    pub max_displayed_logs: usize,
    /// Keep server-provided levels instead of classifying lines
    pub trust_record_level: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            max_displayed_logs: MAX_DISPLAYED_LOGS,
            trust_record_level: false,
        }
    }
}

/// Observable state of a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    /// True until the first response of the current connection arrives
    pub loading: bool,
    /// Bumped whenever the log sequence or the observed deployment changes
    pub revision: u64,
    /// Whether a fetch task is running
    pub connected: bool,
}

/// What the UI renders: the build steps and whether logs are still loading
#[derive(Clone, Debug)]
pub struct BuildLogsView {
    pub steps: Vec<ProcessedStep>,
    pub loading: bool,
}

impl BuildLogsView {
    /// Most recent non-empty line, if any
    pub fn latest_log(&self) -> Option<&ArcBuildLog> {
        latest_log(&self.steps)
    }

    /// Text to show as the latest line, falling back to a placeholder
    pub fn latest_text(&self) -> &str {
        latest_log_text(&self.steps)
    }
}

struct ActiveFetch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Build logs of the deployment currently being observed.
///
/// Owns the log store and at most one fetch task. Observing a different
/// deployment cancels the running task and waits for it to exit before the
/// store is cleared, so a stale connection never writes into the new log.
pub struct BuildLogSession<S> {
    source: Arc<S>,
    options: SessionOptions,
    store: LogStore,
    deployment: watch::Sender<Option<Deployment>>,
    status: Arc<watch::Sender<SessionStatus>>,
    /// Id and creation time of the observed deployment
    observed: Option<(String, i64)>,
    active: Option<ActiveFetch>,
}

impl<S: EventSource> BuildLogSession<S> {
    pub fn new(source: Arc<S>, options: SessionOptions) -> Self {
        let (deployment, _) = watch::channel(None);
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            store: LogStore::new(options.max_displayed_logs),
            source,
            options,
            deployment,
            status: Arc::new(status),
            observed: None,
            active: None,
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Receive a notification on every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Latest observed deployment
    pub fn deployment(&self) -> Option<Deployment> {
        self.deployment.borrow().clone()
    }

    /// Check if a fetch task is still running
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    /// Update the observed deployment.
    ///
    /// A new id or creation time restarts the pipeline from an empty store;
    /// anything else only refreshes the deployment the fetcher and the step
    /// projection read from.
    pub async fn observe(&mut self, deployment: Option<Deployment>) {
        let identity = deployment.as_ref().map(|d| {
            let (id, created_at) = d.identity();
            (id.to_string(), created_at)
        });
        self.deployment.send_replace(deployment);

        if identity == self.observed {
            self.status.send_modify(|s| s.revision += 1);
            return;
        }

        self.stop().await;
        self.store.reset();
        self.observed = identity.clone();

        match identity {
            Some((id, _)) => self.start(id),
            None => self.status.send_modify(|s| {
                s.loading = false;
                s.revision += 1;
            }),
        }
    }

    /// Cancel the running fetch and wait for it to exit. Buffered logs stay.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            if e.is_panic() {
                warn!(error = %e, "log fetch task panicked");
            }
        }
    }

    fn start(&mut self, deployment_id: String) {
        debug!(deployment = %deployment_id, "starting build log fetch");

        let cancel = CancellationToken::new();
        let mut fetcher = LogFetcher::new(
            Arc::clone(&self.source),
            deployment_id.clone(),
            self.deployment.subscribe(),
        )
        .with_reconnect_delay(self.options.reconnect_delay);

        let classifier = LineClassifier::new(self.options.trust_record_level);
        let store = self.store.clone();
        let status = Arc::clone(&self.status);
        let token = cancel.clone();

        self.status.send_modify(|s| {
            s.loading = true;
            s.connected = true;
            s.revision += 1;
        });

        let handle = tokio::spawn(async move {
            let result = fetcher
                .run(
                    &token,
                    |record| {
                        let previous = store.last();
                        if let Some(line) = classifier.classify(record, previous.as_deref()) {
                            store.append(line);
                            status.send_modify(|s| s.revision += 1);
                        }
                    },
                    || {
                        status.send_if_modified(|s| std::mem::replace(&mut s.loading, false));
                    },
                )
                .await;

            match result {
                Ok(()) => debug!(deployment = %deployment_id, "build logs complete"),
                Err(e) if e.is_cancelled() => {}
                // keep whatever was already buffered
                Err(e) => warn!(deployment = %deployment_id, error = %e, "failed to fetch build logs"),
            }

            status.send_modify(|s| {
                s.loading = false;
                s.connected = false;
                s.revision += 1;
            });
        });

        self.active = Some(ActiveFetch { cancel, handle });
    }

    /// Current steps and loading flag
    pub fn snapshot(&self) -> BuildLogsView {
        let deployment = self.deployment.borrow().clone();
        BuildLogsView {
            steps: project_steps(&self.store.all(), deployment.as_ref()),
            loading: self.status.borrow().loading,
        }
    }
}

impl<S> Drop for BuildLogSession<S> {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}
