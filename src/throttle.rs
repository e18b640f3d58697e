//! Per-direction rate and latency accounting with re-arm hints.
//!
//! # Why
//! Sockets and connection groups both need rate control, and a stream may sit
//! under more than one throttle at once (its own plus its group's); the
//! composition rule — effective allowance is the element-wise minimum,
//! effective hint the element-wise maximum — lets
//! [`ThrottledInputStream`](crate::stream::throttled) fold an arbitrary list
//! of throttles into one decision without knowing how many there are.
//!
//! # How
//! Ported directly from `evd-stream-throttle.c`, quirks included: the
//! elapsed-time helper is an `abs` difference of seconds and microseconds
//! rather than a true subtraction, compared against the latency bound in
//! microseconds throughout (no intermediate millisecond rounding), and the
//! "remaining time in this wall-clock second" hint budgets from `1_000_001`
//! microseconds, one past a full second. Both are preserved rather than
//! cleaned up, since either "fix" would shift the retry-hint timing the
//! throttled echo test below measures.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single bandwidth/latency limiter.
#[derive(Debug)]
pub struct Throttle {
    bandwidth: u64,
    latency_micros: u64,
    bytes_this_second: u64,
    current_second: u64,
    last_report: Option<(u64, u32)>,
}

impl Throttle {
    /// `bandwidth` in bytes/sec (0 = unlimited), `latency_micros` minimum gap
    /// between reported transfers (0 = unlimited).
    pub fn new(bandwidth: u64, latency_micros: u64) -> Self {
        Self {
            bandwidth,
            latency_micros,
            bytes_this_second: 0,
            current_second: 0,
            last_report: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    fn now() -> (u64, u32) {
        let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        (d.as_secs(), d.subsec_micros())
    }

    /// Reset the second-aligned byte counter when the wall clock has rolled
    /// over to a new second. Mirrors `evd_stream_throttle_update_current_time`.
    fn roll_second_if_needed(&mut self, sec: u64) {
        if sec != self.current_second {
            self.current_second = sec;
            self.bytes_this_second = 0;
        }
    }

    /// The source's elapsed-time formula: `abs(sec_diff)*1e6 + abs(usec_diff)`,
    /// in microseconds — the same unit `latency_micros` is already in. Not a
    /// true duration subtraction; see module docs.
    fn elapsed_micros_quirky(now: (u64, u32), last: (u64, u32)) -> u64 {
        let sec_diff = now.0 as i64 - last.0 as i64;
        let usec_diff = now.1 as i64 - last.1 as i64;
        (sec_diff.unsigned_abs() * 1_000_000 + usec_diff.unsigned_abs()) as u64
    }

    /// Returns the number of bytes the caller may transfer right now; if less
    /// than `size`, `retry_hint_ms` is set to the soonest sensible retry.
    pub fn request(&mut self, size: usize) -> (usize, u64) {
        let now = Self::now();
        self.roll_second_if_needed(now.0);

        let mut wait_ms: u64 = 0;
        let mut actual_size = size;

        if self.latency_micros > 0 {
            if let Some(last) = self.last_report {
                let elapsed = Self::elapsed_micros_quirky(now, last);
                if elapsed < self.latency_micros {
                    actual_size = 0;
                    wait_ms = wait_ms.max((self.latency_micros - elapsed) / 1000);
                }
            }
        }

        if actual_size > 0 && self.bandwidth > 0 {
            let remaining = self.bandwidth.saturating_sub(self.bytes_this_second);
            let allowed = remaining.min(actual_size as u64) as usize;
            if allowed < actual_size {
                // Milliseconds left in the current wall-clock second, with
                // the source's literal `1_000_001` (one microsecond past a
                // full second) budget rather than `1_000_000`.
                let remaining_us = 1_000_001u64.saturating_sub(now.1 as u64);
                wait_ms = wait_ms.max(remaining_us / 1000 + 1);
            }
            actual_size = allowed;
        }

        (actual_size, wait_ms)
    }

    /// Record that `size` bytes were actually transferred.
    pub fn report(&mut self, size: usize) {
        let now = Self::now();
        self.roll_second_if_needed(now.0);
        self.bytes_this_second += size as u64;
        self.last_report = Some(now);
    }
}

/// A set of throttles applying jointly to one stream direction. Combines
/// via element-wise minimum of allowance, maximum of retry hint.
#[derive(Default, Clone)]
pub struct ThrottleSet {
    throttles: Vec<std::sync::Arc<parking_lot::Mutex<Throttle>>>,
}

impl ThrottleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, throttle: std::sync::Arc<parking_lot::Mutex<Throttle>>) {
        self.throttles.push(throttle);
    }

    pub fn request(&self, size: usize) -> (usize, u64) {
        if self.throttles.is_empty() {
            return (size, 0);
        }
        let mut allowed = size;
        let mut hint = 0u64;
        for t in &self.throttles {
            let (a, h) = t.lock().request(allowed);
            allowed = allowed.min(a);
            hint = hint.max(h);
        }
        (allowed, hint)
    }

    pub fn report(&self, size: usize) {
        for t in &self.throttles {
            t.lock().report(size);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }
}

pub fn duration_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_allows_full_size() {
        let mut t = Throttle::unlimited();
        let (allowed, hint) = t.request(4096);
        assert_eq!(allowed, 4096);
        assert_eq!(hint, 0);
    }

    #[test]
    fn bandwidth_clamps_within_second() {
        let mut t = Throttle::new(1024, 0);
        let (allowed, _) = t.request(4096);
        assert_eq!(allowed, 1024);
        t.report(allowed);
        let (allowed2, hint2) = t.request(4096);
        assert_eq!(allowed2, 0);
        assert!(hint2 > 0);
    }

    #[test]
    fn latency_blocks_until_elapsed() {
        let mut t = Throttle::new(0, 50_000); // 50ms
        t.report(10);
        let (allowed, hint) = t.request(10);
        assert_eq!(allowed, 0);
        assert!(hint > 0 && hint <= 50);
    }

    #[test]
    fn throttle_set_combines_element_wise() {
        let mut set = ThrottleSet::new();
        set.add(std::sync::Arc::new(parking_lot::Mutex::new(Throttle::new(100, 0))));
        set.add(std::sync::Arc::new(parking_lot::Mutex::new(Throttle::new(50, 0))));
        let (allowed, _) = set.request(1000);
        assert_eq!(allowed, 50);
    }
}
