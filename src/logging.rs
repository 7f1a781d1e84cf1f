//! Process logging
//!
//! Everything goes through the `log` facade. [`init`] installs env_logger as the
//! console backend and tees each record into a bounded [`LogBuffer`] so the
//! status surface can show recent lines without touching files.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{Log, Metadata, Record};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Ring buffer of the most recent log lines. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: Arc<AtomicUsize>,
    lines: Arc<Mutex<VecDeque<LogLine>>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity: Arc::new(AtomicUsize::new(capacity)),
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Change the bound, evicting the oldest lines if it shrank.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.capacity.store(capacity, Ordering::Relaxed);
        let mut lines = self.lock();
        while lines.len() > capacity {
            lines.pop_front();
        }
    }

    pub fn push(&self, line: LogLine) {
        let capacity = self.capacity.load(Ordering::Relaxed);
        let mut lines = self.lock();
        while lines.len() >= capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogLine>> {
        // A panic while holding the lock leaves the deque intact; keep serving it.
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct TeeLogger {
    inner: env_logger::Logger,
    buffer: LogBuffer,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.buffer.push(LogLine {
            timestamp: Utc::now(),
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the process logger. Filter via `RUST_LOG`, default `info`.
///
/// Returns the buffer even when a logger was already installed (tests), in
/// which case it stays empty.
pub fn init(capacity: usize) -> LogBuffer {
    let buffer = LogBuffer::new(capacity);
    let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .build();
    let max_level = inner.filter();

    let logger = TeeLogger {
        inner,
        buffer: buffer.clone(),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(max_level);
    }
    buffer
}
