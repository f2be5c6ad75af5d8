use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use buildscope_api::{ApiError, EventSource};
use buildscope_types::{Deployment, LogsQuery, RawLogRecord};

use crate::reader::{ParsedLine, RecordLines, read_batch};

/// Delay before reconnecting after a live stream closes
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Failed to read log batch: {0}")]
    Read(#[from] io::Error),

    #[error("Log fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Connection state of a [`LogFetcher`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetcherState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Completed,
    Aborted,
}

/// Follows the build events feed of one deployment.
///
/// While the deployment is still running the feed is followed live and
/// reopened after every close, starting just past the last record seen. Once
/// the deployment is finished the next connection fetches the remaining
/// records as one batch and the fetcher completes.
pub struct LogFetcher<S> {
    source: Arc<S>,
    deployment_id: String,
    /// Latest known state of the deployment, decides follow vs batch
    deployment: watch::Receiver<Option<Deployment>>,
    /// Resumption cursor: last `created` seen plus one
    cursor: Option<i64>,
    reconnect_delay: Duration,
    state: FetcherState,
}

impl<S: EventSource> LogFetcher<S> {
    pub fn new(
        source: Arc<S>,
        deployment_id: impl Into<String>,
        deployment: watch::Receiver<Option<Deployment>>,
    ) -> Self {
        Self {
            source,
            deployment_id: deployment_id.into(),
            deployment,
            cursor: None,
            reconnect_delay: RECONNECT_DELAY,
            state: FetcherState::Disconnected,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn state(&self) -> FetcherState {
        self.state
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    fn set_state(&mut self, state: FetcherState) {
        trace!(deployment = %self.deployment_id, from = ?self.state, to = ?state, "fetcher state");
        self.state = state;
    }

    fn deployment_finished(&self) -> bool {
        self.deployment
            .borrow()
            .as_ref()
            .is_some_and(Deployment::is_finished)
    }

    /// Fetch until the feed is exhausted, the transport fails or `cancel` fires.
    ///
    /// Every record with a creation time is passed to `on_log` in arrival
    /// order. `on_response` runs after each successful connect.
    pub async fn run<L, R>(
        &mut self,
        cancel: &CancellationToken,
        mut on_log: L,
        mut on_response: R,
    ) -> Result<(), FetchError>
    where
        L: FnMut(RawLogRecord),
        R: FnMut(),
    {
        let result = self.run_inner(cancel, &mut on_log, &mut on_response).await;
        if result.is_err() {
            self.set_state(FetcherState::Aborted);
        }
        result
    }

    async fn run_inner<L, R>(
        &mut self,
        cancel: &CancellationToken,
        on_log: &mut L,
        on_response: &mut R,
    ) -> Result<(), FetchError>
    where
        L: FnMut(RawLogRecord),
        R: FnMut(),
    {
        loop {
            self.set_state(FetcherState::Connecting);
            let query = LogsQuery::for_deployment(self.cursor, !self.deployment_finished());
            debug!(deployment = %self.deployment_id, since = ?query.since, follow = query.is_follow(), "connecting to events feed");

            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                body = self.source.open_events(&self.deployment_id, &query) => body?,
            };
            on_response();
            self.set_state(FetcherState::Streaming);

            if !query.is_follow() {
                let records = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    records = read_batch(body) => records?,
                };
                for record in records {
                    self.accept(record, on_log);
                }
                self.set_state(FetcherState::Completed);
                return Ok(());
            }

            let mut lines = RecordLines::new(body);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    next = lines.next_line() => next,
                };

                match next {
                    Ok(Some(ParsedLine::Record(record))) => self.accept(record, on_log),
                    Ok(Some(ParsedLine::Malformed)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        warn!(deployment = %self.deployment_id, error = %e, "events stream broke");
                        break;
                    }
                }
            }

            // A stream that delivered nothing resumes from the start of time
            let since = *self.cursor.get_or_insert(0);
            self.set_state(FetcherState::Reconnecting);
            debug!(deployment = %self.deployment_id, since, "events stream closed, reconnecting");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// Hand a record to `on_log` unless it is a keepalive, advancing the cursor
    fn accept<L: FnMut(RawLogRecord)>(&mut self, record: RawLogRecord, on_log: &mut L) {
        let Some(created) = record.created else {
            trace!("ignoring keepalive");
            return;
        };
        self.cursor = Some(created.saturating_add(1));
        on_log(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSource, stream_of};
    use buildscope_types::ReadyState;

    fn line(id: &str, created: i64) -> String {
        format!(r#"{{"id":"{id}","created":{created},"type":"stdout","text":"line {id}"}}"#)
    }

    fn building() -> watch::Receiver<Option<Deployment>> {
        let (_tx, rx) = watch::channel(Some(Deployment::new("dpl", ReadyState::Building, 1)));
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_cursor_past_last_record() {
        let source = Arc::new(ScriptedSource::new());
        source.push_body(stream_of(&[line("a", 100), line("b", 105), line("c", 110)]));

        let (tx, rx) = watch::channel(Some(Deployment::new("dpl", ReadyState::Building, 1)));
        let mut fetcher = LogFetcher::new(source.clone(), "dpl", rx);
        let cancel = CancellationToken::new();

        // the first stream closes; flip the deployment to finished before the
        // reconnect so the second connection is a final batch
        let mut seen = Vec::new();
        let result = fetcher
            .run(
                &cancel,
                |record| {
                    seen.push(record.created);
                    if record.created == Some(110) {
                        tx.send_replace(Some(Deployment::new("dpl", ReadyState::Ready, 1)));
                    }
                },
                || {},
            )
            .await;
        assert!(result.is_ok());

        let queries = source.queries();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].since, None);
        assert!(queries[0].is_follow());
        assert_eq!(queries[1].since, Some(111));
        assert!(!queries[1].is_follow());
        assert_eq!(seen, vec![Some(100), Some(105), Some(110)]);
        assert_eq!(fetcher.state(), FetcherState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalives_do_not_advance_cursor() {
        let source = Arc::new(ScriptedSource::new());
        source.push_body(stream_of(&[
            line("a", 100),
            r#"{"type":"stdout","text":""}"#.to_string(),
            r#"{"id":"partial","cre"#.to_string(),
        ]));

        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let cancel = CancellationToken::new();
        let mut count = 0;

        // the script runs dry on the second connect and cancels
        let stopper = cancel.clone();
        source.on_exhausted(move || stopper.cancel());

        let result = fetcher.run(&cancel, |_| count += 1, || {}).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(count, 1);
        assert_eq!(fetcher.cursor(), Some(101));
        assert_eq!(source.queries()[1].since, Some(101));
        assert_eq!(fetcher.state(), FetcherState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_stream_reconnects_from_zero() {
        let source = Arc::new(ScriptedSource::new());
        source.push_body(stream_of(&[]));
        let stopper = CancellationToken::new();
        let cancel = stopper.clone();
        source.on_exhausted(move || stopper.cancel());

        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let _ = fetcher.run(&cancel, |_| {}, || {}).await;
        assert_eq!(source.queries()[1].since, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_before_reconnecting() {
        let source = Arc::new(ScriptedSource::new());
        source.push_body(stream_of(&[line("a", 1)]));
        let stopper = CancellationToken::new();
        let cancel = stopper.clone();
        source.on_exhausted(move || stopper.cancel());

        let started = tokio::time::Instant::now();
        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let _ = fetcher.run(&cancel, |_| {}, || {}).await;
        assert!(started.elapsed() >= RECONNECT_DELAY);
    }

    #[tokio::test]
    async fn test_finished_deployment_reads_batch() {
        let source = Arc::new(ScriptedSource::new());
        source.push_batch(&[line("a", 1), r#"{"type":"stdout","text":"ka"}"#.into(), line("b", 2)]);

        let (_tx, rx) = watch::channel(Some(Deployment::new("dpl", ReadyState::Error, 1)));
        let mut fetcher = LogFetcher::new(source.clone(), "dpl", rx);
        let mut ids = Vec::new();
        let mut responses = 0;
        fetcher
            .run(&CancellationToken::new(), |r| ids.push(r.id), || responses += 1)
            .await
            .unwrap();

        assert_eq!(ids, vec![Some("a".to_string()), Some("b".to_string())]);
        assert_eq!(responses, 1);
        assert_eq!(source.queries().len(), 1);
        assert_eq!(source.queries()[0].follow, None);
        assert_eq!(fetcher.cursor(), Some(3));
    }

    #[tokio::test]
    async fn test_transport_error_aborts() {
        let source = Arc::new(ScriptedSource::new());
        source.push_error(500, "boom");

        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let err = fetcher
            .run(&CancellationToken::new(), |_| {}, || {})
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Request failed with status 500: boom");
        assert_eq!(fetcher.state(), FetcherState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_connecting() {
        let source = Arc::new(ScriptedSource::new());
        source.push_hang();
        let cancel = CancellationToken::new();

        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let (result, _) = tokio::join!(fetcher.run(&cancel, |_| {}, || {}), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(source.queries().len(), 1);
        assert_eq!(fetcher.state(), FetcherState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_reconnect_delay() {
        let source = Arc::new(ScriptedSource::new());
        source.push_body(stream_of(&[line("a", 1)]));
        let cancel = CancellationToken::new();

        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let (result, _) = tokio::join!(fetcher.run(&cancel, |_| {}, || {}), async {
            tokio::time::sleep(RECONNECT_DELAY / 2).await;
            cancel.cancel();
        });

        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(source.queries().len(), 1);

        // no reconnect once the delay would have elapsed
        tokio::time::sleep(RECONNECT_DELAY * 2).await;
        assert_eq!(source.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_saturates() {
        let source = Arc::new(ScriptedSource::new());
        source.push_batch(&[line("a", i64::MAX)]);

        let (_tx, rx) = watch::channel(Some(Deployment::new("dpl", ReadyState::Ready, 1)));
        let mut fetcher = LogFetcher::new(source.clone(), "dpl", rx);
        fetcher
            .run(&CancellationToken::new(), |_| {}, || {})
            .await
            .unwrap();
        assert_eq!(fetcher.cursor(), Some(i64::MAX));
    }

    #[tokio::test]
    async fn test_cancel_before_connect() {
        let source = Arc::new(ScriptedSource::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut fetcher = LogFetcher::new(source.clone(), "dpl", building());
        let err = fetcher.run(&cancel, |_| {}, || {}).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
