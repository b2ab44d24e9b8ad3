// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Clock, Timestamp};
use async_std::{
    sync::{Arc, Mutex},
    task,
};
use futures::future::{abortable, AbortHandle};
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug_span, info, Instrument};

/// The four counters a [crate::TransactionAgent] maintains. Owned by the
/// agent and shared by reference with anything that reads them; updated
/// with atomic increments only.
#[derive(Debug, Default)]
pub struct TransactionAgentStatistics {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
}

/// A point-in-time copy of the counters, or of per-second rates derived
/// from two such copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub throttled: u64,
}

impl TransactionAgentStatistics {
    pub fn new() -> Self {
        TransactionAgentStatistics::default()
    }

    pub fn track_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

fn rate(now: u64, then: u64, elapsed_ms: u64) -> u64 {
    now.saturating_sub(then).saturating_mul(1000) / elapsed_ms.max(1)
}

impl StatisticsSnapshot {
    fn rates_since(&self, earlier: &StatisticsSnapshot, elapsed_ms: u64) -> StatisticsSnapshot {
        StatisticsSnapshot {
            started: rate(self.started, earlier.started, elapsed_ms),
            succeeded: rate(self.succeeded, earlier.succeeded, elapsed_ms),
            failed: rate(self.failed, earlier.failed, elapsed_ms),
            throttled: rate(self.throttled, earlier.throttled, elapsed_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub totals: StatisticsSnapshot,
    /// Per second, over the time since the previous report.
    pub rates: StatisticsSnapshot,
    pub elapsed_ms: u64,
}

/// Periodically turns the agent's counters into totals and rates and logs
/// them.
pub struct StatisticsReporter {
    stats: Arc<TransactionAgentStatistics>,
    clock: Arc<dyn Clock>,
    last: Mutex<(Timestamp, StatisticsSnapshot)>,
}

impl StatisticsReporter {
    pub fn new(stats: Arc<TransactionAgentStatistics>, clock: Arc<dyn Clock>) -> Self {
        let now = Timestamp::from_system_time(clock.current_time());
        let snap = stats.snapshot();
        StatisticsReporter {
            stats,
            clock,
            last: Mutex::new((now, snap)),
        }
    }

    pub async fn report(&self) -> StatisticsReport {
        let mut last = self.last.lock().await;
        let now = Timestamp::from_system_time(self.clock.current_time());
        let totals = self.stats.snapshot();
        let elapsed_ms = now.millis_since(last.0);
        let rates = totals.rates_since(&last.1, elapsed_ms);
        *last = (now, totals);
        info!(
            "transactions started={} ({}/s) succeeded={} ({}/s) failed={} ({}/s) throttled={} ({}/s)",
            totals.started,
            rates.started,
            totals.succeeded,
            rates.succeeded,
            totals.failed,
            rates.failed,
            totals.throttled,
            rates.throttled
        );
        StatisticsReport {
            totals,
            rates,
            elapsed_ms,
        }
    }

    /// Reports every `interval` until the returned handle is stopped or
    /// dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReporterHandle {
        let (fut, abort) = abortable(async move {
            loop {
                task::sleep(interval).await;
                self.report().await;
            }
        });
        task::spawn(fut.instrument(debug_span!("statistics-reporter")));
        ReporterHandle { abort }
    }
}

pub struct ReporterHandle {
    abort: AbortHandle,
}

impl ReporterHandle {
    pub fn stop(&self) {
        self.abort.abort();
    }
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

#[test]
fn test_rates_use_elapsed_wall_time() {
    task::block_on(async {
        let clock = crate::TestClock::frozen();
        let stats = Arc::new(TransactionAgentStatistics::new());
        let reporter = StatisticsReporter::new(stats.clone(), Arc::new(clock.clone()));
        for _ in 0..10 {
            stats.track_start();
        }
        stats.track_success();
        stats.track_throttled();
        clock.advance(Duration::from_millis(500));
        let report = reporter.report().await;
        assert_eq!(report.elapsed_ms, 500);
        assert_eq!(report.totals.started, 10);
        assert_eq!(report.rates.started, 20);
        assert_eq!(report.rates.succeeded, 2);
        assert_eq!(report.rates.failed, 0);

        // No time passing must not divide by zero.
        stats.track_failure();
        let report = reporter.report().await;
        assert_eq!(report.elapsed_ms, 0);
        assert_eq!(report.rates.failed, 1000);
        assert_eq!(report.rates.started, 0);
        assert_eq!(report.totals.failed, 1);
    });
}

#[test]
fn test_reporter_loop_stops() {
    task::block_on(async {
        let stats = Arc::new(TransactionAgentStatistics::new());
        let reporter = Arc::new(StatisticsReporter::new(stats, Arc::new(crate::RealClock)));
        let handle = reporter.clone().spawn(Duration::from_millis(5));
        task::sleep(Duration::from_millis(30)).await;
        handle.stop();
        drop(handle);
        // Only our reference and none from the stopped loop remain.
        task::sleep(Duration::from_millis(30)).await;
        assert_eq!(Arc::strong_count(&reporter), 1);
    });
}
