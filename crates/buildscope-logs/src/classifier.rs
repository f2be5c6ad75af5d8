use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use buildscope_types::{BuildLog, LogLevel, RawLogRecord};

/// `ESC [ <params> <letter>` sequences
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("valid ANSI regex"));

/// Error keywords next to a boundary: `error:`, `[err `, `TypeError:`, `FetchError ` ...
static ERROR_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^| |\[|eval|internal|range|reference|syntax|type|uri|fetch)err(or)?( |:)")
        .expect("valid error keyword regex")
});

/// Substrings that mark a line as an error. All lowercase.
const ERROR_PATTERNS: &[&str] = &[
    "command not found",
    "module not found",
    "failed to compile",
    "cannot open shared object file",
    "err_pnpm_",
    "please contact vercel.com/help",
    "exit code 1",
    "elifecycle",
    "exited",
    // leading space keeps package names like `on-error:` out
    " error:",
];

/// Line starts that mark a line as an error
const ERROR_PREFIXES: &[&str] = &[" ⨯ ", "npm err!"];

const WARNING_PATTERNS: &[&str] = &["warning:", "warn:", "warn!"];

/// Indentation and pointer markers that continue the previous line
const CONTINUATION_MARKERS: &[&str] = &["  ", "   ", "    ", "\t", "> "];

/// Remove ANSI escape sequences
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Classify a record against the previous line using the default heuristics.
///
/// Returns `None` when the record must be dropped.
pub fn classify(record: RawLogRecord, previous: Option<&BuildLog>) -> Option<BuildLog> {
    LineClassifier::default().classify(record, previous)
}

/// Assigns a severity to build log lines
#[derive(Clone, Copy, Debug, Default)]
pub struct LineClassifier {
    /// Keep the level sent by the server instead of running the heuristics
    trust_record_level: bool,
}

impl LineClassifier {
    pub fn new(trust_record_level: bool) -> Self {
        Self { trust_record_level }
    }

    /// Turn a raw record into a classified line.
    ///
    /// Records without an id, and keepalives without a creation time, yield
    /// `None`.
    pub fn classify(&self, record: RawLogRecord, previous: Option<&BuildLog>) -> Option<BuildLog> {
        let id = record.id.filter(|id| !id.is_empty())?;
        let created = record.created?;

        let level = if self.trust_record_level {
            record.level
        } else {
            record
                .body
                .text()
                .and_then(|text| Self::detect_level(text, previous))
        };

        Some(BuildLog {
            id,
            created,
            date: record.date,
            deployment_id: record.deployment_id,
            serial: record.serial,
            level,
            body: record.body,
        })
    }

    /// Severity of `text` given the line before it
    pub fn detect_level(text: &str, previous: Option<&BuildLog>) -> Option<LogLevel> {
        let unified = strip_ansi(&text.to_lowercase()).into_owned();

        if Self::is_continuation(&unified, previous) {
            return previous.and_then(|p| p.level);
        }

        if Self::is_error(&unified) {
            Some(LogLevel::Error)
        } else if Self::is_warning(&unified) {
            Some(LogLevel::Warning)
        } else {
            None
        }
    }

    /// Whether `unified` is blank or an indented continuation of `previous`
    fn is_continuation(unified: &str, previous: Option<&BuildLog>) -> bool {
        if unified.is_empty() {
            return true;
        }

        let prefix = previous
            .and_then(BuildLog::text)
            .filter(|text| !text.is_empty())
            .map(|text| continuation_prefix(unified, &strip_ansi(text)))
            .unwrap_or_default();

        CONTINUATION_MARKERS.iter().any(|marker| {
            unified.starts_with(marker)
                || unified
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with(marker))
        })
    }

    fn is_error(unified: &str) -> bool {
        if unified.starts_with("warning") {
            return false;
        }
        ERROR_KEYWORD.is_match(unified)
            || ERROR_PATTERNS.iter().any(|p| unified.contains(p))
            || ERROR_PREFIXES.iter().any(|p| unified.starts_with(p))
    }

    fn is_warning(unified: &str) -> bool {
        !unified.contains("deprecationwarning")
            && WARNING_PATTERNS.iter().any(|p| unified.contains(p))
    }
}

/// Common leading run of `current` and `previous`, stopping as soon as the
/// run ends in a continuation marker.
///
/// `current` is the lowercased analysis copy while `previous` keeps its case,
/// so a capitalized header never shares a prefix with its lowercased follower.
fn continuation_prefix(current: &str, previous: &str) -> String {
    let mut prefix = String::new();
    let mut current = current.chars();

    for ch in previous.chars() {
        if CONTINUATION_MARKERS.iter().any(|m| prefix.ends_with(m)) {
            break;
        }
        if current.next() != Some(ch) {
            break;
        }
        prefix.push(ch);
    }

    prefix
}
