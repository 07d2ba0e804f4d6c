use std::time::Instant;

/// Wall-clock stopwatch for solver-loop stage timings.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn restart(&mut self) {
        self.start = Instant::now();
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Per-stage throughput counters. Each bridge keeps one history report per
/// pass direction; a call site wraps its kernel in `begin`/`end` and folds
/// the sample into the history with `aggregate`.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub seconds: f64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flops: u64,
    pub n_calls: u64,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records one timed sample.
    pub fn end(&mut self, started: &Timer, bytes_read: u64, bytes_written: u64, flops: u64) {
        self.seconds = started.elapsed();
        self.bytes_read = bytes_read;
        self.bytes_written = bytes_written;
        self.flops = flops;
        self.n_calls = 1;
    }

    pub fn aggregate(&mut self, other: &Report) {
        self.seconds += other.seconds;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.flops += other.flops;
        self.n_calls += other.n_calls;
    }

    /// Best-effort diagnostics; never required for correctness.
    pub fn print(&self, stage: &str) {
        tracing::info!(
            stage,
            seconds = self.seconds,
            bytes_read = self.bytes_read,
            bytes_written = self.bytes_written,
            flops = self.flops,
            calls = self.n_calls,
            gflops_per_sec = if self.seconds > 0.0 {
                self.flops as f64 / self.seconds / 1e9
            } else {
                0.0
            },
            "report"
        );
    }
}
