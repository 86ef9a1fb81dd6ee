use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use udmi_schema::{Entry, Level, category};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Device log sink. Every entry goes to tracing and to broadcast
/// subscribers; entries at or above the minimum level are also queued for
/// publication to the cloud and drained by the periodic tick.
#[derive(Clone)]
pub struct EntryLogger {
    tx: broadcast::Sender<Entry>,
    pending: Arc<Mutex<VecDeque<Entry>>>,
    max_pending: usize,
    min_level: Arc<AtomicU32>,
    clock: Clock,
}

impl EntryLogger {
    pub fn new(max_pending: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            pending: Arc::new(Mutex::new(VecDeque::with_capacity(max_pending))),
            max_pending,
            min_level: Arc::new(AtomicU32::new(Level::Info.value())),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the timestamp source, e.g. with a skewed device clock.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Entry> {
        self.tx.subscribe()
    }

    pub fn set_min_level(&self, level: Level) {
        self.min_level.store(level.value(), Ordering::Relaxed);
    }

    pub fn min_level(&self) -> Level {
        Level::from_value(self.min_level.load(Ordering::Relaxed))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Log a `device.log` entry.
    pub fn log(&self, level: Level, message: impl Display, detail: Option<String>) {
        let entry = Entry::new(category::DEVICE_LOG, level, message.to_string())
            .with_detail(detail)
            .at(self.now());
        self.record(entry);
    }

    /// Emit an already-built entry (any category).
    pub fn record(&self, entry: Entry) {
        self.local_log(&entry);
        if entry.level >= self.min_level() {
            if let Ok(mut pending) = self.pending.lock() {
                pending.push_back(entry.clone());
                while pending.len() > self.max_pending {
                    pending.pop_front();
                }
            }
        }
        let _ = self.tx.send(entry);
    }

    /// Write to tracing only, without queueing for the cloud.
    pub fn local_log(&self, entry: &Entry) {
        let detail = entry.detail.as_deref().unwrap_or("");
        match entry.level {
            Level::Trace => tracing::trace!(category = %entry.category, detail, "{}", entry.message),
            Level::Debug => tracing::debug!(category = %entry.category, detail, "{}", entry.message),
            Level::Info | Level::Notice => {
                tracing::info!(category = %entry.category, detail, "{}", entry.message)
            }
            Level::Warning => tracing::warn!(category = %entry.category, detail, "{}", entry.message),
            _ => tracing::error!(category = %entry.category, detail, "{}", entry.message),
        }
    }

    /// Take every queued entry, oldest first.
    pub fn drain(&self) -> Vec<Entry> {
        match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn trace(&self, message: impl Display) {
        self.log(Level::Trace, message, None);
    }

    pub fn debug(&self, message: impl Display) {
        self.log(Level::Debug, message, None);
    }

    pub fn info(&self, message: impl Display) {
        self.log(Level::Info, message, None);
    }

    pub fn notice(&self, message: impl Display) {
        self.log(Level::Notice, message, None);
    }

    pub fn warn(&self, message: impl Display) {
        self.log(Level::Warning, message, None);
    }

    pub fn error(&self, message: impl Display) {
        self.log(Level::Error, message, None);
    }

    /// Log an error with its source chain as the detail.
    pub fn error_with(&self, message: impl Display, err: &(dyn std::error::Error + 'static)) {
        self.log(
            Level::Error,
            format_args!("{message}: {err}"),
            Some(error_chain(err)),
        );
    }
}

/// `err;cause;cause;` rendering of an error and its sources.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut buffer = String::new();
    let mut current = Some(err);
    while let Some(e) = current {
        buffer.push_str(&e.to_string());
        buffer.push(';');
        current = e.source();
    }
    buffer
}
