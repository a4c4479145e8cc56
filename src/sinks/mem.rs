// =============================================================================
// Memory Sink — in-process sink for tests and failure injection
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use parking_lot::Mutex;

use crate::types::OverviewSnapshot;

use super::{OptionRow, OptionSink};

#[derive(Default)]
pub struct MemSink {
    pub rows: Mutex<Vec<(String, OptionRow)>>,
    pub overviews: Mutex<Vec<(String, OverviewSnapshot)>>,
    /// Leading writes that fail, for persist-retry tests.
    fail_writes: AtomicU32,
    /// When set, every write fails (permanent sink outage).
    fail_always: std::sync::atomic::AtomicBool,
}

impl MemSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        let sink = Self::default();
        sink.fail_writes.store(n, Ordering::Relaxed);
        sink
    }

    pub fn failing_always() -> Self {
        let sink = Self::default();
        sink.fail_always.store(true, Ordering::Relaxed);
        sink
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    fn check_failure(&self) -> Result<()> {
        if self.fail_always.load(Ordering::Relaxed) {
            anyhow::bail!("sink unavailable");
        }
        let had_failure = self
            .fail_writes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok();
        if had_failure {
            anyhow::bail!("transient sink failure");
        }
        Ok(())
    }
}

impl OptionSink for MemSink {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn write_option_rows(&self, rule: &str, rows: &[OptionRow]) -> Result<()> {
        self.check_failure()?;
        let mut stored = self.rows.lock();
        for row in rows {
            stored.push((rule.to_string(), row.clone()));
        }
        Ok(())
    }

    fn write_overview(&self, index: &str, overview: &OverviewSnapshot) -> Result<()> {
        self.check_failure()?;
        self.overviews
            .lock()
            .push((index.to_string(), overview.clone()));
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
