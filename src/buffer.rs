//! Result buffer: a bounded, dual-priority queue of pending outbound
//! values. Persistent entries (log/event-log lines) never lose ground to
//! transient ones (numeric samples); transient entries with the same
//! `(host, key)` coalesce in place to absorb sampling floods.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A pending outbound value.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub host: String,
    pub key: String,
    /// May be the sentinel `NOTSUPPORTED`.
    pub value: String,
    pub clock: i64,
    pub last_log_size: Option<i64>,
    pub mtime: Option<i64>,
    pub timestamp: Option<i64>,
    pub source: Option<String>,
    pub severity: Option<i64>,
    pub log_event_id: Option<i64>,
    pub persistent: bool,
}

impl BufferEntry {
    pub fn transient(host: impl Into<String>, key: impl Into<String>, value: impl Into<String>, clock: i64) -> Self {
        BufferEntry {
            host: host.into(),
            key: key.into(),
            value: value.into(),
            clock,
            last_log_size: None,
            mtime: None,
            timestamp: None,
            source: None,
            severity: None,
            log_event_id: None,
            persistent: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_line(
        host: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        clock: i64,
        last_log_size: i64,
        mtime: Option<i64>,
        timestamp: Option<i64>,
    ) -> Self {
        BufferEntry {
            host: host.into(),
            key: key.into(),
            value: value.into(),
            clock,
            last_log_size: Some(last_log_size),
            mtime,
            timestamp,
            source: None,
            severity: None,
            log_event_id: None,
            persistent: true,
        }
    }

    fn same_key(&self, other: &BufferEntry) -> bool {
        self.host == other.host && self.key == other.key
    }
}

/// Bounded dual-priority send queue.
#[derive(Debug)]
pub struct ResultBuffer {
    cap: usize,
    data: Vec<BufferEntry>,
    persistent_count: usize,
    last_sent_at: Instant,
    last_full_warning_at: Option<Instant>,
}

/// Returned by [`ResultBuffer::enqueue`] when a persistent entry is rejected
/// because the persistent reserve (`CAP/2`) is already full; the caller
/// (the log tailer) must halt ingestion and retry next tick without
/// advancing its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentReserveFull;

impl ResultBuffer {
    pub fn new(cap: usize) -> Self {
        assert!(cap >= 2, "buffer capacity must be at least 2");
        ResultBuffer {
            cap,
            data: Vec::with_capacity(cap),
            persistent_count: 0,
            last_sent_at: Instant::now(),
            last_full_warning_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn persistent_count(&self) -> usize {
        self.persistent_count
    }

    pub fn persistent_reserve_full(&self) -> bool {
        self.persistent_count >= self.cap / 2
    }

    /// Entries in FIFO send order.
    pub fn entries(&self) -> &[BufferEntry] {
        &self.data
    }

    /// Insert a value, applying eviction rules. Returns
    /// `Err(PersistentReserveFull)` if a persistent entry was rejected; the
    /// caller must stop advancing its read offset for this tick.
    pub fn enqueue(&mut self, entry: BufferEntry) -> Result<(), PersistentReserveFull> {
        if entry.persistent && self.persistent_reserve_full() {
            self.warn_full_once();
            return Err(PersistentReserveFull);
        }

        if self.data.len() < self.cap {
            if entry.persistent {
                self.persistent_count += 1;
            }
            self.data.push(entry);
            return Ok(());
        }

        let victim_idx = if !entry.persistent {
            self.data
                .iter()
                .position(|e| !e.persistent && e.same_key(&entry))
                .or_else(|| self.data.iter().position(|e| !e.persistent))
        } else {
            self.data.iter().position(|e| !e.persistent)
        };

        match victim_idx {
            Some(idx) => {
                // Shift subsequent entries down so the new entry lands at
                // the end, preserving FIFO order for everything else.
                self.data.remove(idx);
                if entry.persistent {
                    self.persistent_count += 1;
                }
                self.data.push(entry);
                Ok(())
            }
            None => {
                // Unreachable under the invariant persistent_count <= cap/2,
                // but fail closed rather than silently dropping data.
                self.warn_full_once();
                Err(PersistentReserveFull)
            }
        }
    }

    fn warn_full_once(&mut self) {
        let should_log = match self.last_full_warning_at {
            None => true,
            Some(t) => t.elapsed() >= Duration::from_secs(60),
        };
        if should_log {
            warn!(
                count = self.data.len(),
                persistent_count = self.persistent_count,
                cap = self.cap,
                "result buffer persistent reserve is full"
            );
            self.last_full_warning_at = Some(Instant::now());
        }
    }

    /// Whether `send_buffer` should transmit the whole buffer now.
    pub fn should_flush(&self, max_age: Duration) -> bool {
        if self.data.is_empty() {
            return false;
        }
        if self.persistent_reserve_full() {
            return true;
        }
        if self.data.len() >= self.cap {
            return true;
        }
        self.last_sent_at.elapsed() >= max_age
    }

    /// Clear the buffer and reset the send clock after a successful send.
    pub fn clear_after_send(&mut self) {
        debug!(sent = self.data.len(), "cleared result buffer after send");
        self.data.clear();
        self.persistent_count = 0;
        self.last_sent_at = Instant::now();
    }
}
