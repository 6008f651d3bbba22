use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};
use zbr_api::{ApiClient, LogRecord};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Time-windowed batch of log records for one run.
///
/// Delivery is at most once: a failed batch is logged and dropped.
pub struct LogBuffer {
    api: Arc<ApiClient>,
    run_id: Option<u64>,
    records: Vec<LogRecord>,
    last_flush: Instant,
    flush_interval: Duration,
}

impl LogBuffer {
    pub fn new(api: Arc<ApiClient>, run_id: Option<u64>) -> Self {
        Self::with_interval(api, run_id, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_interval(api: Arc<ApiClient>, run_id: Option<u64>, flush_interval: Duration) -> Self {
        Self {
            api,
            run_id,
            records: Vec::new(),
            last_flush: Instant::now(),
            flush_interval,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.records.len()
    }

    pub fn add(&mut self, record: LogRecord) {
        self.add_at(record, Instant::now());
    }

    /// Flushes the pending window first when it is due, so `record` always
    /// opens or joins the current window.
    pub fn add_at(&mut self, record: LogRecord, now: Instant) {
        if now.saturating_duration_since(self.last_flush) >= self.flush_interval {
            self.flush_at(now);
        }
        self.records.push(record);
    }

    pub fn flush(&mut self) {
        self.flush_at(Instant::now());
    }

    pub fn flush_at(&mut self, now: Instant) {
        let records = std::mem::take(&mut self.records);
        self.last_flush = now;
        let Some(run_id) = self.run_id else {
            return;
        };
        if records.is_empty() {
            return;
        }
        match self.api.send_logs(run_id, &records) {
            Ok(()) => debug!(run_id, count = records.len(), "flushed log batch"),
            Err(error) => error!(
                run_id,
                count = records.len(),
                operation = error.operation(),
                "dropping log batch: {error}"
            ),
        }
    }
}
