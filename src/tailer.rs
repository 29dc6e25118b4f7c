//! Log tailer: incremental, rate-capped, regex-filtered
//! reading of `log[]`/`logrt[]`/`eventlog[]` checks.
//!
//! The byte-level "open/read/track" work is done behind the [`LogSource`]
//! trait, a capability interface with two variants — file-backed and
//! platform-event-log-backed. `FileTailer` is a real single-file/rotating
//! reader; `EventLogTailer` is the "not available" variant that returns
//! not-supported cleanly on this (non-Windows) build, the same
//! feature-gated-capability shape used elsewhere in this crate for
//! platform-specific backends.

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use crate::buffer::{BufferEntry, PersistentReserveFull, ResultBuffer};
use crate::error::{CoreError, CoreResult};
use crate::regexp::RegexpSet;
use crate::registry::ActiveCheck;

pub const NOT_SUPPORTED: &str = "ZBX_NOTSUPPORTED";

/// One record read from a log source, at the offset/mtime it was produced.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub value: String,
    pub offset: i64,
    pub mtime: i64,
    pub timestamp: Option<i64>,
    pub severity: Option<i64>,
    pub source: Option<String>,
    pub event_id: Option<i64>,
}

/// Outcome of one `next` call against a [`LogSource`].
pub enum TailStep {
    Record(LogRecord),
    /// End of file reached; carries the offset/mtime to persist (even for
    /// empty files, so truncation is recorded per step 5).
    Eof { offset: i64, mtime: i64 },
}

/// The log-tailer capability interface (design note: "expose the log
/// tailer behind a capability interface with two variants").
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn next(&mut self, offset: i64, mtime: i64) -> CoreResult<TailStep>;
}

/// Single-file tailer backing both `log[]` (no rotation) and `logrt[]`
/// (rotation via mtime comparison) — `follow_rotation` toggles the latter.
pub struct FileTailer {
    path: PathBuf,
    follow_rotation: bool,
}

impl FileTailer {
    pub fn new(path: impl Into<PathBuf>, follow_rotation: bool) -> Self {
        FileTailer {
            path: path.into(),
            follow_rotation,
        }
    }
}

#[async_trait]
impl LogSource for FileTailer {
    async fn next(&mut self, offset: i64, mtime: i64) -> CoreResult<TailStep> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| CoreError::LogSource(format!("{}: {e}", self.path.display())))?;

        let current_len = metadata.len() as i64;
        let current_mtime = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        // Rotation/truncation: if the file shrank, or (for logrt) its mtime
        // moved backwards relative to what we last recorded, restart from 0.
        let mut offset = offset;
        if current_len < offset {
            offset = 0;
        } else if self.follow_rotation && current_mtime != mtime && current_len == 0 {
            offset = 0;
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| CoreError::LogSource(format!("{}: {e}", self.path.display())))?;
        file.seek(SeekFrom::Start(offset as u64))
            .await
            .map_err(|e| CoreError::LogSource(e.to_string()))?;

        let mut rest = Vec::new();
        file.read_to_end(&mut rest)
            .await
            .map_err(|e| CoreError::LogSource(e.to_string()))?;

        match rest.iter().position(|&b| b == b'\n') {
            None if rest.is_empty() => Ok(TailStep::Eof {
                offset,
                mtime: current_mtime,
            }),
            None => {
                // Trailing partial line with no terminator yet: treat as EOF
                // at the current offset, don't consume it.
                Ok(TailStep::Eof {
                    offset,
                    mtime: current_mtime,
                })
            }
            Some(nl) => {
                let line = String::from_utf8_lossy(&rest[..nl]).into_owned();
                let new_offset = offset + nl as i64 + 1;
                Ok(TailStep::Record(LogRecord {
                    value: line,
                    offset: new_offset,
                    mtime: current_mtime,
                    timestamp: None,
                    severity: None,
                    source: None,
                    event_id: None,
                }))
            }
        }
    }
}

/// The "not available on this platform" variant (design note).
#[derive(Debug, Default)]
pub struct EventLogTailer;

#[async_trait]
impl LogSource for EventLogTailer {
    async fn next(&mut self, offset: i64, mtime: i64) -> CoreResult<TailStep> {
        let _ = (offset, mtime);
        Err(CoreError::LogSource(
            "platform event log is not available on this build".to_string(),
        ))
    }
}

/// A parsed `log[]`/`logrt[]`/`eventlog[]` key.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedKey {
    Log {
        file: String,
        pattern: Option<String>,
        max_lines_per_second: Option<u32>,
    },
    LogRt {
        file: String,
        pattern: Option<String>,
        max_lines_per_second: Option<u32>,
    },
    EventLog {
        source: String,
        pattern: Option<String>,
        severity: Option<String>,
        source_filter: Option<String>,
        event_id: Option<String>,
        max_lines_per_second: Option<u32>,
    },
}

/// Split the bracketed parameter list of an item key. No quoting support is
/// needed for this agent's key families (none of their parameters contain
/// literal commas in practice); empty fields between commas are preserved.
fn split_params(inner: &str) -> Vec<String> {
    if inner.is_empty() {
        return Vec::new();
    }
    inner.split(',').map(|s| s.trim().to_string()).collect()
}

fn bracket_contents<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    rest.strip_suffix(']')
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_max_lines(s: &str, key: &str) -> CoreResult<Option<u32>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse::<u32>()
        .map(Some)
        .map_err(|_| CoreError::invalid_key(key, format!("maxLinesPerSecond not numeric: {s:?}")))
}

/// Parse a check key into one of the three log-tailer families, or `None`
/// if it doesn't start with any of their prefixes (a non-log key, handled
/// by the evaluator instead).
pub fn parse_key(key: &str) -> Option<CoreResult<ParsedKey>> {
    if let Some(inner) = bracket_contents(key, "log[") {
        return Some(parse_log_params(inner, key, false));
    }
    if let Some(inner) = bracket_contents(key, "logrt[") {
        return Some(parse_log_params(inner, key, true));
    }
    if let Some(inner) = bracket_contents(key, "eventlog[") {
        return Some(parse_eventlog_params(inner, key));
    }
    None
}

fn parse_log_params(inner: &str, key: &str, rotating: bool) -> CoreResult<ParsedKey> {
    let params = split_params(inner);
    if params.is_empty() || params.len() > 4 {
        return Err(CoreError::invalid_key(key, format!("expected 1-4 params, got {}", params.len())));
    }
    let file = non_empty(&params[0]).ok_or_else(|| CoreError::invalid_key(key, "file is required"))?;
    let pattern = params.get(1).and_then(|s| non_empty(s));
    let max_lines_per_second = match params.get(3) {
        Some(s) => parse_max_lines(s, key)?,
        None => None,
    };

    Ok(if rotating {
        ParsedKey::LogRt { file, pattern, max_lines_per_second }
    } else {
        ParsedKey::Log { file, pattern, max_lines_per_second }
    })
}

fn parse_eventlog_params(inner: &str, key: &str) -> CoreResult<ParsedKey> {
    let params = split_params(inner);
    if params.is_empty() || params.len() > 6 {
        return Err(CoreError::invalid_key(key, format!("expected 1-6 params, got {}", params.len())));
    }
    let source = non_empty(&params[0]).ok_or_else(|| CoreError::invalid_key(key, "source is required"))?;
    let pattern = params.get(1).and_then(|s| non_empty(s));
    let severity = params.get(2).and_then(|s| non_empty(s));
    let source_filter = params.get(3).and_then(|s| non_empty(s));
    let event_id = params.get(4).and_then(|s| non_empty(s));
    let max_lines_per_second = match params.get(5) {
        Some(s) => parse_max_lines(s, key)?,
        None => None,
    };

    Ok(ParsedKey::EventLog {
        source,
        pattern,
        severity,
        source_filter,
        event_id,
        max_lines_per_second,
    })
}

/// Does this record pass the check's filters?
fn record_matches(record: &LogRecord, parsed: &ParsedKey, regexps: &RegexpSet) -> CoreResult<bool> {
    match parsed {
        ParsedKey::Log { pattern, .. } | ParsedKey::LogRt { pattern, .. } => match pattern {
            Some(p) => regexps.matches(&record.value, p, true),
            None => Ok(true),
        },
        ParsedKey::EventLog {
            pattern,
            severity,
            source_filter,
            event_id,
            ..
        } => {
            if let Some(p) = pattern {
                if !regexps.matches(&record.value, p, true)? {
                    return Ok(false);
                }
            }
            if let Some(sev) = severity {
                let actual = record.severity.map(|s| s.to_string()).unwrap_or_default();
                if !regexps.matches(&actual, sev, false)? {
                    return Ok(false);
                }
            }
            if let Some(src) = source_filter {
                if record.source.as_deref() != Some(src.as_str()) {
                    return Ok(false);
                }
            }
            if let Some(id) = event_id {
                let actual = record.event_id.map(|s| s.to_string()).unwrap_or_default();
                if !regexps.matches(&actual, id, true)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}

/// Run one evaluation tick for a log-family check.
///
/// On success the check's `last_log_size`/`mtime` are advanced to exactly
/// what was handed to the buffer; if the buffer rejects an emit (persistent
/// reserve full) the tick aborts without advancing, so the same bytes are
/// reread next time (the durability-by-dataflow invariant).
pub async fn run_tick(
    check: &mut ActiveCheck,
    source: &mut dyn LogSource,
    regexps: &RegexpSet,
    buffer: &mut ResultBuffer,
    hostname: &str,
    now: i64,
    max_lines_per_second: u32,
) -> CoreResult<()> {
    let parsed = match parse_key(&check.key) {
        Some(Ok(p)) => p,
        Some(Err(e)) => {
            mark_not_supported(check, buffer, hostname, now);
            return Err(e);
        }
        None => {
            return Err(CoreError::Internal(format!(
                "run_tick called with non-log key {}",
                check.key
            )))
        }
    };

    let sent_cap = max_lines_per_second.saturating_mul(check.refresh.max(1) as u32);
    let processed_cap = sent_cap.saturating_mul(4);

    let mut sent: u32 = 0;
    let mut processed: u32 = 0;
    let mut offset = check.last_log_size;
    let mut mtime = check.mtime;

    loop {
        if sent >= sent_cap || processed >= processed_cap {
            break;
        }

        let step = match source.next(offset, mtime).await {
            Ok(step) => step,
            Err(e) => {
                mark_not_supported(check, buffer, hostname, now);
                return Err(e);
            }
        };

        match step {
            TailStep::Eof { offset: eof_offset, mtime: eof_mtime } => {
                check.last_log_size = eof_offset;
                check.mtime = eof_mtime;
                break;
            }
            TailStep::Record(record) => {
                processed += 1;
                if record_matches(&record, &parsed, regexps)? {
                    let entry = BufferEntry::log_line(
                        hostname,
                        check.key.clone(),
                        record.value.clone(),
                        now,
                        offset, // old offset: server reconciles against this
                        Some(mtime),
                        record.timestamp,
                    );
                    match buffer.enqueue(entry) {
                        Ok(()) => {
                            sent += 1;
                        }
                        Err(PersistentReserveFull) => {
                            // Do not advance; abort so these bytes are reread.
                            return Ok(());
                        }
                    }
                }
                offset = record.offset;
                mtime = record.mtime;
                check.last_log_size = offset;
                check.mtime = mtime;
            }
        }
    }

    Ok(())
}

fn mark_not_supported(check: &mut ActiveCheck, buffer: &mut ResultBuffer, hostname: &str, now: i64) {
    check.status = crate::registry::CheckStatus::NotSupported;
    let entry = BufferEntry::log_line(hostname, check.key.clone(), NOT_SUPPORTED, now, check.last_log_size, Some(check.mtime), None);
    // A NOTSUPPORTED sentinel is transient: there is nothing to replay if
    // it's dropped, unlike an actual log line.
    let mut entry = entry;
    entry.persistent = false;
    if buffer.enqueue(entry).is_err() {
        warn!(key = %check.key, "buffer full, dropping NOTSUPPORTED sentinel");
    }
}
