//! Build log processing for buildscope
//!
//! This crate follows a deployment's build events feed, classifies each line,
//! keeps a bounded log and projects it into build steps.

mod buffer;
mod classifier;
mod fetcher;
mod reader;
mod session;
mod steps;

#[cfg(test)]
mod testing;

pub use buffer::{LevelCounts, LogStore, MAX_DISPLAYED_LOGS};
pub use classifier::{LineClassifier, classify, strip_ansi};
pub use fetcher::{FetchError, FetcherState, LogFetcher, RECONNECT_DELAY};
pub use reader::{ParsedLine, RecordLines, read_batch};
pub use session::{BuildLogSession, BuildLogsView, SessionOptions, SessionStatus};
pub use steps::{PLACEHOLDER_TEXT, latest_log, latest_log_text, project_steps};

// Re-export types used in our public API
pub use buildscope_types::{ArcBuildLog, BuildLog, LogLevel, ProcessedStep, RawLogRecord};
