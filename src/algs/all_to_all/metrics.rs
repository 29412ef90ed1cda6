//! Instrumentation of all-to-all operations.
//!
//! Three wall-clock timers with call counters: `Total` (every public
//! distributor operation), `Metadata` (count exchanges) and `Exchange`
//! (payload exchanges). Accumulators are plain values shared through
//! [`DistributorConfig`](super::DistributorConfig), so independent
//! configurations never observe each other's counts.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::config::Algorithm;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timer {
    Total = 0,
    Metadata = 1,
    Exchange = 2,
}

impl Timer {
    pub const ALL: [Timer; 3] = [Timer::Total, Timer::Metadata, Timer::Exchange];

    fn label(self) -> &'static str {
        match self {
            Timer::Total => "Total:",
            Timer::Metadata => "Metadata exchange:",
            Timer::Exchange => "Data exchange:",
        }
    }
}

/// Thread-safe call counters and accumulated wall time.
#[derive(Debug, Default)]
pub struct ExchangeMetrics {
    calls: [AtomicU64; 3],
    nanos: [AtomicU64; 3],
}

impl ExchangeMetrics {
    /// Add elapsed time to `timer` without counting a call
    /// (create/destroy are grouped with the call that follows them).
    pub fn add_time(&self, timer: Timer, elapsed: Duration) {
        let ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.nanos[timer as usize].fetch_add(ns, Ordering::Relaxed);
    }

    /// Add elapsed time to `timer` and count one call.
    pub fn add_call(&self, timer: Timer, elapsed: Duration) {
        self.add_time(timer, elapsed);
        self.calls[timer as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Time `f`, charging it as one call of `timer`.
    pub fn timed<R>(&self, timer: Timer, f: impl FnOnce() -> R) -> R {
        let t0 = Instant::now();
        let r = f();
        self.add_call(timer, t0.elapsed());
        r
    }

    pub fn calls(&self, timer: Timer) -> u64 {
        self.calls[timer as usize].load(Ordering::Relaxed)
    }

    pub fn wall_time(&self, timer: Timer) -> Duration {
        Duration::from_nanos(self.nanos[timer as usize].load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        for t in Timer::ALL {
            self.calls[t as usize].store(0, Ordering::Relaxed);
            self.nanos[t as usize].store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stat = |t: Timer| TimerStat {
            calls: self.calls(t),
            wall_seconds: self.wall_time(t).as_secs_f64(),
        };
        MetricsSnapshot {
            total: stat(Timer::Total),
            metadata: stat(Timer::Metadata),
            exchange: stat(Timer::Exchange),
        }
    }

    /// Performance table, or `None` if nothing was instrumented.
    pub fn summary(&self, algorithm: Algorithm) -> Option<String> {
        if self.calls(Timer::Total) == 0 {
            return None;
        }
        let active: Vec<Timer> = Timer::ALL
            .into_iter()
            .filter(|&t| self.calls(t) > 0)
            .collect();
        let width = active.iter().map(|t| t.label().len()).max().unwrap_or(0);

        let mut out = format!(
            "Instrumented all-to-all operations (using {}):\n\n",
            algorithm.description()
        );
        for t in active {
            let _ = writeln!(
                out,
                "  {:<width$} {:12.5} s, {} calls",
                t.label(),
                self.wall_time(t).as_secs_f64(),
                self.calls(t),
            );
        }
        Some(out)
    }

    /// Log the performance table at `info` level (typically at shutdown).
    pub fn log_summary(&self, algorithm: Algorithm) {
        if let Some(s) = self.summary(algorithm) {
            log::info!("{s}");
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerStat {
    pub calls: u64,
    pub wall_seconds: f64,
}

/// Point-in-time copy of an [`ExchangeMetrics`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total: TimerStat,
    pub metadata: TimerStat,
    pub exchange: TimerStat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_times_accumulate() {
        let m = ExchangeMetrics::default();
        m.add_call(Timer::Metadata, Duration::from_millis(2));
        m.add_time(Timer::Metadata, Duration::from_millis(3));
        assert_eq!(m.calls(Timer::Metadata), 1);
        assert_eq!(m.wall_time(Timer::Metadata), Duration::from_millis(5));
        assert_eq!(m.calls(Timer::Exchange), 0);
        m.reset();
        assert_eq!(m.calls(Timer::Metadata), 0);
    }

    #[test]
    fn summary_lists_active_timers_only() {
        let m = ExchangeMetrics::default();
        assert!(m.summary(Algorithm::Direct).is_none());
        m.timed(Timer::Total, || ());
        m.timed(Timer::Exchange, || ());
        let s = m.summary(Algorithm::Direct).unwrap();
        assert!(s.contains("Total:"));
        assert!(s.contains("Data exchange:"));
        assert!(!s.contains("Metadata exchange:"));
        assert!(s.contains("1 calls"));
    }

    #[test]
    fn snapshot_serializes() {
        let m = ExchangeMetrics::default();
        m.add_call(Timer::Total, Duration::from_secs(1));
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total.calls, 1);
        assert_eq!(back.total.wall_seconds, 1.0);
    }
}
