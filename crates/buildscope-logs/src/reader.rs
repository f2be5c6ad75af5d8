use std::io;

use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

use buildscope_types::RawLogRecord;

/// One line of a newline-delimited events feed
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedLine {
    Record(RawLogRecord),
    /// Line that is not a valid record; expected for a partial last line
    Malformed,
}

/// Reads records one line at a time from a live events feed
pub struct RecordLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> RecordLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Wait for the next non-blank line.
    ///
    /// Returns `Ok(None)` once the stream closes. A trailing line without a
    /// newline is still returned, and usually parses as `Malformed`.
    pub async fn next_line(&mut self) -> io::Result<Option<ParsedLine>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }

            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Ok(Some(parse_line(line)));
        }
    }

    /// Adapt into a stream of parsed lines
    pub fn into_stream(self) -> impl Stream<Item = io::Result<ParsedLine>> {
        futures::stream::try_unfold(self, |mut lines| async move {
            Ok::<_, io::Error>(lines.next_line().await?.map(|line| (line, lines)))
        })
    }
}

fn parse_line(line: &str) -> ParsedLine {
    match serde_json::from_str(line) {
        Ok(record) => ParsedLine::Record(record),
        Err(e) => {
            trace!(error = %e, "discarding unparsable event line");
            ParsedLine::Malformed
        }
    }
}

/// Read a finished feed: one JSON array of records.
///
/// Elements that are not valid records are dropped.
pub async fn read_batch<R: AsyncBufRead + Unpin>(mut reader: R) -> io::Result<Vec<RawLogRecord>> {
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;

    let values: Vec<Value> = serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect())
}
