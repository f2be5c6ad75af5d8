use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use buildscope_types::{ArcBuildLog, BuildLog, LogLevel};

/// Maximum number of lines kept for display
pub const MAX_DISPLAYED_LOGS: usize = 10_000;

struct Inner {
    lines: VecDeque<ArcBuildLog>,
    /// Whether the first line has been turned into the truncation notice
    truncated: bool,
}

/// Bounded, ordered store of classified build log lines.
///
/// When the bound is first reached the oldest line is overwritten with a
/// truncation notice. That happens once; afterwards the notice stays at the
/// front and the oldest line behind it makes room for each new one.
#[derive(Clone)]
pub struct LogStore {
    /// Internal storage - uses Arc<BuildLog> so snapshots are cheap
    inner: Arc<RwLock<Inner>>,

    /// Maximum line count
    capacity: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(MAX_DISPLAYED_LOGS)
    }
}

impl LogStore {
    /// Create a store holding at most `capacity` lines (at least 2, so the
    /// notice never displaces the newest line)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                lines: VecDeque::with_capacity(capacity.min(MAX_DISPLAYED_LOGS)),
                truncated: false,
            })),
            capacity,
        }
    }

    /// Append a line at the tail
    pub fn append(&self, line: BuildLog) {
        let mut inner = self.inner.write();

        if inner.truncated && inner.lines.len() >= self.capacity {
            inner.lines.remove(1);
        }
        inner.lines.push_back(Arc::new(line));

        if !inner.truncated && inner.lines.len() == self.capacity {
            if let Some(first) = inner.lines.front_mut() {
                Arc::make_mut(first).make_truncation_notice(self.capacity);
            }
            inner.truncated = true;
        }
    }

    /// The most recently appended line
    pub fn last(&self) -> Option<ArcBuildLog> {
        self.inner.read().lines.back().cloned()
    }

    /// Get all lines (Arc clones are cheap - just reference count increment)
    pub fn all(&self) -> Vec<ArcBuildLog> {
        self.inner.read().lines.iter().cloned().collect()
    }

    /// Get the last N lines
    pub fn tail(&self, n: usize) -> Vec<ArcBuildLog> {
        let inner = self.inner.read();
        let start = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().lines.is_empty()
    }

    /// Whether the truncation notice has been written
    pub fn is_truncated(&self) -> bool {
        self.inner.read().truncated
    }

    /// Get line count per level
    pub fn level_counts(&self) -> LevelCounts {
        let inner = self.inner.read();
        let mut counts = LevelCounts::default();

        for line in inner.lines.iter() {
            match line.level {
                Some(LogLevel::Warning) => counts.warning += 1,
                Some(LogLevel::Error) => counts.error += 1,
                None => counts.plain += 1,
            }
        }

        counts
    }

    /// Clear all lines
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.lines.clear();
        inner.truncated = false;
    }
}

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCounts {
    pub warning: usize,
    pub error: usize,
    pub plain: usize,
}

impl LevelCounts {
    pub fn total(&self) -> usize {
        self.warning + self.error + self.plain
    }
}
