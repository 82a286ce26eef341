use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::logging::PROGRESS_TARGET;
use crate::model::Counters;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressSnapshot {
    pub elapsed_secs: f64,
    pub counters: Counters,
    pub processed_keys: u64,
    /// Records saved per second during this run.
    pub throughput: f64,
    pub hit_rate: f64,
    /// Units left towards the target: saved records when a target is set,
    /// otherwise unprocessed keys.
    pub remaining: u64,
    pub eta_secs: Option<f64>,
}

/// Derives rates from counter snapshots. Holds no shared state.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    started: Instant,
    baseline: Counters,
    baseline_processed: u64,
    total_keys: u64,
    target: Option<u64>,
}

impl ProgressReporter {
    pub fn new(baseline: Counters, baseline_processed: u64, total_keys: u64, target: Option<u64>) -> Self {
        Self {
            started: Instant::now(),
            baseline,
            baseline_processed,
            total_keys,
            target,
        }
    }

    pub fn snapshot(&self, counters: Counters, processed_keys: u64) -> ProgressSnapshot {
        let elapsed = self.started.elapsed().as_secs_f64();
        let per_sec = |done: u64| if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
        let throughput = per_sec(counters.saved.saturating_sub(self.baseline.saved));

        let (remaining, rate) = match self.target {
            Some(target) => (target.saturating_sub(counters.saved), throughput),
            None => (
                self.total_keys.saturating_sub(processed_keys),
                per_sec(processed_keys.saturating_sub(self.baseline_processed)),
            ),
        };
        let eta_secs = if remaining == 0 {
            Some(0.0)
        } else if rate > 0.0 {
            Some(remaining as f64 / rate)
        } else {
            None
        };

        ProgressSnapshot {
            elapsed_secs: elapsed,
            counters,
            processed_keys,
            throughput,
            hit_rate: counters.hit_rate(),
            remaining,
            eta_secs,
        }
    }

    pub fn report(&self, counters: Counters, processed_keys: u64) -> ProgressSnapshot {
        let s = self.snapshot(counters, processed_keys);
        info!(
            target: PROGRESS_TARGET,
            elapsed = %format_duration(s.elapsed_secs),
            attempted = s.counters.attempted,
            found = s.counters.found,
            saved = s.counters.saved,
            not_found = s.counters.not_found,
            errors = s.counters.errors,
            processed = s.processed_keys,
            throughput = format_args!("{:.2}/s", s.throughput),
            hit_rate = format_args!("{:.1}%", s.hit_rate * 100.0),
            remaining = s.remaining,
            eta = %s.eta_secs.map(format_duration).unwrap_or_else(|| "unknown".into()),
            "status"
        );
        s
    }
}

pub fn format_duration(secs: f64) -> String {
    let total = Duration::from_secs_f64(secs.max(0.0)).as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rates_and_eta() {
        let baseline = Counters {
            attempted: 10,
            found: 5,
            saved: 5,
            ..Counters::default()
        };
        let reporter = ProgressReporter::new(baseline, 10, 100, None);
        tokio::time::advance(Duration::from_secs(10)).await;
        let now = Counters {
            attempted: 30,
            found: 15,
            saved: 15,
            ..Counters::default()
        };
        let s = reporter.snapshot(now, 30);
        assert!((s.throughput - 1.0).abs() < 1e-6);
        assert!((s.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(s.remaining, 70);
        // 20 keys in 10s -> 2 keys/s
        assert!((s.eta_secs.unwrap() - 35.0).abs() < 1e-6);

        let targeted = ProgressReporter::new(baseline, 10, 100, Some(25));
        tokio::time::advance(Duration::from_secs(5)).await;
        let s = targeted.snapshot(now, 30);
        assert_eq!(s.remaining, 10);
        assert!((s.eta_secs.unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn idle_reporter_has_no_eta() {
        let r = ProgressReporter::new(Counters::default(), 0, 10, None);
        assert_eq!(r.snapshot(Counters::default(), 0).eta_secs, None);
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(5.4), "5s");
        assert_eq!(format_duration(125.0), "2m05s");
        assert_eq!(format_duration(3723.0), "1h02m03s");
    }
}
