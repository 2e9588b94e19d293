//! Injected observer (§9): the core emits progress through `tracing` instead
//! of a global mutable counter and stdout prints. [`Stats`] accumulates the
//! numbers a caller would otherwise have to scrape from log output.

use std::time::Duration;

/// Running counters for one encode or decode call. Returned to the caller
/// so tests and callers can assert on throughput without parsing logs.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub bricks_visited: u64,
    pub blocks_encoded: u64,
    pub blocks_decoded: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub chunks_flushed: u64,
    pub files_touched: u64,
    pub elapsed: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_summary(&self, op: &str) {
        tracing::info!(
            op,
            bricks_visited = self.bricks_visited,
            blocks_encoded = self.blocks_encoded,
            blocks_decoded = self.blocks_decoded,
            bytes_written = self.bytes_written,
            bytes_read = self.bytes_read,
            chunks_flushed = self.chunks_flushed,
            files_touched = self.files_touched,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "idx2 call complete"
        );
    }
}
