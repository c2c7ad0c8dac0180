/// Cooperative progress reporting and cancellation for long-running bulk
/// operations.
///
/// The tree driver calls `report` between blocks of work and polls
/// `cancelled` at the same points; cancellation is never preemptive. On
/// cancellation the tree is left consistent but incomplete: boxes already
/// split stay split, boxes still flagged stay flagged for a later pass.
pub trait ProgressReporter: Send + Sync {
    /// `fraction` is in `0.0..=1.0`.
    fn report(&self, fraction: f64, message: &str) {
        let _ = (fraction, message);
    }

    fn cancelled(&self) -> bool {
        false
    }
}

/// Reporter that ignores progress and never cancels.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl ProgressReporter for NullProgress {}

/// Reporter that requests cancellation after a fixed number of progress
/// reports. Useful in tests and as a time-boxing guard.
#[derive(Debug)]
pub struct CancelAfter {
    reports: std::sync::atomic::AtomicUsize,
    limit: usize,
}

impl CancelAfter {
    pub fn new(limit: usize) -> Self {
        Self {
            reports: std::sync::atomic::AtomicUsize::new(0),
            limit,
        }
    }
}

impl ProgressReporter for CancelAfter {
    fn report(&self, _fraction: f64, _message: &str) {
        self.reports
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn cancelled(&self) -> bool {
        self.reports.load(std::sync::atomic::Ordering::Relaxed) >= self.limit
    }
}
