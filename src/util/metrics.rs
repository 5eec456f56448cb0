use std::sync::atomic::{AtomicU64, Ordering};

static PARSE_ERRORS: AtomicU64 = AtomicU64::new(0);
static TRADES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static POINTS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static FLUSH_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc_parse_errors() {
    PARSE_ERRORS.fetch_add(1, Ordering::Relaxed);
}

pub fn parse_errors_total() -> u64 {
    PARSE_ERRORS.load(Ordering::Relaxed)
}

pub fn inc_trades_received() {
    TRADES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

pub fn trades_received_total() -> u64 {
    TRADES_RECEIVED.load(Ordering::Relaxed)
}

pub fn add_points_written(n: u64) {
    if n == 0 {
        return;
    }
    POINTS_WRITTEN.fetch_add(n, Ordering::Relaxed);
}

pub fn points_written_total() -> u64 {
    POINTS_WRITTEN.load(Ordering::Relaxed)
}

pub fn inc_flush_failures() {
    FLUSH_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn flush_failures_total() -> u64 {
    FLUSH_FAILURES.load(Ordering::Relaxed)
}
