//! In-memory events feed for unit tests

use std::collections::VecDeque;
use std::io::Cursor;

use async_trait::async_trait;
use parking_lot::Mutex;

use buildscope_api::{ApiError, EventBody, EventSource};
use buildscope_types::LogsQuery;

type Hook = Box<dyn Fn() + Send>;

enum Reply {
    Body(Vec<u8>),
    Fail(u16, String),
    /// Never resolves
    Hang,
}

/// Replays queued responses in order and records every query it receives.
///
/// Once the script runs dry the exhausted hook fires and an empty batch is
/// returned.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    responses: Mutex<VecDeque<Reply>>,
    queries: Mutex<Vec<LogsQuery>>,
    exhausted: Mutex<Option<Hook>>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_body(&self, body: Vec<u8>) {
        self.responses.lock().push_back(Reply::Body(body));
    }

    pub(crate) fn push_batch(&self, records: &[String]) {
        self.push_body(format!("[{}]", records.join(",")).into_bytes());
    }

    pub(crate) fn push_error(&self, status: u16, body: &str) {
        self.responses
            .lock()
            .push_back(Reply::Fail(status, body.to_string()));
    }

    /// Queue a connect that stays pending until the caller gives up
    pub(crate) fn push_hang(&self) {
        self.responses.lock().push_back(Reply::Hang);
    }

    pub(crate) fn on_exhausted<F: Fn() + Send + 'static>(&self, hook: F) {
        *self.exhausted.lock() = Some(Box::new(hook));
    }

    pub(crate) fn queries(&self) -> Vec<LogsQuery> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn open_events(
        &self,
        _deployment_id: &str,
        query: &LogsQuery,
    ) -> Result<EventBody, ApiError> {
        self.queries.lock().push(query.clone());

        let next = self.responses.lock().pop_front();
        match next {
            Some(Reply::Body(body)) => Ok(Box::pin(Cursor::new(body))),
            Some(Reply::Fail(status, body)) => Err(ApiError::Status { status, body }),
            Some(Reply::Hang) => std::future::pending().await,
            None => {
                if let Some(hook) = self.exhausted.lock().as_ref() {
                    hook();
                }
                Ok(Box::pin(Cursor::new(b"[]".to_vec())))
            }
        }
    }
}

/// Newline-delimited body from pre-rendered JSON lines
pub(crate) fn stream_of(lines: &[String]) -> Vec<u8> {
    lines
        .iter()
        .flat_map(|line| line.bytes().chain(std::iter::once(b'\n')))
        .collect()
}
