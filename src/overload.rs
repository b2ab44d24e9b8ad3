// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Clock, LoadSheddingConfig, Timestamp, TransactionAgentStatistics};
use async_std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Consulted before every transaction start.
pub trait OverloadDetector: Send + Sync + 'static {
    fn is_overloaded(&self) -> bool;
}

pub struct NeverOverloaded;

impl OverloadDetector for NeverOverloaded {
    fn is_overloaded(&self) -> bool {
        false
    }
}

const WINDOW_MILLIS: u64 = 1000;

/// Sheds load once the rate of started transactions, measured over the last
/// completed window of at least a second, exceeds the configured limit.
pub struct TransactionRateDetector {
    stats: Arc<TransactionAgentStatistics>,
    config: LoadSheddingConfig,
    clock: Arc<dyn Clock>,
    window_start: AtomicU64,
    window_count: AtomicU64,
    rate: AtomicU64,
}

impl TransactionRateDetector {
    pub fn new(
        stats: Arc<TransactionAgentStatistics>,
        config: LoadSheddingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = Timestamp::from_system_time(clock.current_time());
        let count = stats.started();
        TransactionRateDetector {
            stats,
            config,
            clock,
            window_start: AtomicU64::new(now.0),
            window_count: AtomicU64::new(count),
            rate: AtomicU64::new(0),
        }
    }

    /// Started transactions per second over the last completed window.
    pub fn current_rate(&self) -> u64 {
        let now = Timestamp::from_system_time(self.clock.current_time());
        let start = Timestamp(self.window_start.load(Ordering::Acquire));
        let elapsed = now.millis_since(start);
        if elapsed >= WINDOW_MILLIS
            && self
                .window_start
                .compare_exchange(start.0, now.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // Whoever wins the exchange closes the window.
            let count = self.stats.started();
            let prev = self.window_count.swap(count, Ordering::AcqRel);
            let rate = count.saturating_sub(prev).saturating_mul(1000) / elapsed;
            self.rate.store(rate, Ordering::Release);
        }
        self.rate.load(Ordering::Acquire)
    }
}

impl OverloadDetector for TransactionRateDetector {
    fn is_overloaded(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let rate = self.current_rate();
        let overloaded = rate > self.config.limit_per_second;
        if overloaded {
            debug!(
                "shedding load: {} starts/s over limit {}",
                rate, self.config.limit_per_second
            );
        }
        overloaded
    }
}

#[test]
fn test_rate_detector_sheds_above_limit() {
    let clock = crate::TestClock::frozen();
    let stats = Arc::new(TransactionAgentStatistics::new());
    let config = LoadSheddingConfig {
        enabled: true,
        limit_per_second: 5,
    };
    let detector = TransactionRateDetector::new(stats.clone(), config, Arc::new(clock.clone()));
    for _ in 0..8 {
        stats.track_start();
    }
    // The window has not closed yet.
    assert!(!detector.is_overloaded());
    clock.advance(std::time::Duration::from_millis(1000));
    assert!(detector.is_overloaded());
    assert_eq!(detector.current_rate(), 8);
    // A quiet second brings it back under.
    clock.advance(std::time::Duration::from_millis(1000));
    assert!(!detector.is_overloaded());
}

#[test]
fn test_disabled_detector_never_sheds() {
    let clock = crate::TestClock::frozen();
    let stats = Arc::new(TransactionAgentStatistics::new());
    let detector = TransactionRateDetector::new(
        stats.clone(),
        LoadSheddingConfig::default().with_limit_per_second(0),
        Arc::new(clock.clone()),
    );
    stats.track_start();
    clock.advance(std::time::Duration::from_secs(1));
    assert!(!detector.is_overloaded());
    assert!(!NeverOverloaded.is_overloaded());
}
