// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use async_std::sync::Arc;
use serde::{Deserialize, Serialize};
use std::{
    convert::TryFrom,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::warn;

/// Timestamps are the only ordering the protocol has. They are a count of
/// nanoseconds since the UNIX epoch, so they read like UTC instants, but they
/// are issued by a [CausalClock] and therefore:
///
///   - are totally ordered;
///   - never repeat or go backwards on one clock, even if the wall clock does;
///   - can absorb timestamps observed from other clocks, so anything issued
///     after observing `t` is greater than `t`.
///
/// The smallest representable increment is one nanosecond.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}.{:09}",
            self.0 / 1_000_000_000,
            self.0 % 1_000_000_000
        ))
    }
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// The largest timestamp a [CausalClock] will absorb from outside,
    /// around the year 2262. Everything above it is headroom for the clock's
    /// own increments.
    pub const MERGE_CEILING: Timestamp = Timestamp(u64::MAX >> 1);

    pub fn from_system_time(t: SystemTime) -> Timestamp {
        // A clock reading before the epoch is treated as the epoch; the
        // causal clock will step past it with its own counter.
        match t.duration_since(UNIX_EPOCH) {
            Err(_) => Timestamp::ZERO,
            Ok(dur) => Timestamp(u64::try_from(dur.as_nanos()).unwrap_or(u64::MAX)),
        }
    }

    pub fn next(&self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }

    pub fn saturating_add(&self, d: Duration) -> Timestamp {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(nanos))
    }

    /// Whole milliseconds from `earlier` to `self`, or zero if `earlier` is
    /// not earlier.
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0) / 1_000_000
    }
}

/// Trait to support multiple sorts of clock-source.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> SystemTime;
}

/// An implementation of [Clock] that calls [std::time::SystemTime::now].
pub struct RealClock;
impl Clock for RealClock {
    fn current_time(&self) -> SystemTime {
        std::time::SystemTime::now()
    }
}

/// An implementation of [Clock] that holds a shared [AtomicU64] representing
/// the current millisecond count since the epoch, that increments on each
/// call to `Clock::current_time`. Clones share the same counter, so a test
/// can hold one end and move the time for everything else.
#[derive(Clone)]
pub struct TestClock {
    millis: Arc<AtomicU64>,
    step: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new() -> Self {
        TestClock {
            millis: Arc::new(AtomicU64::from(0)),
            step: Arc::new(AtomicU64::from(1)),
        }
    }

    /// A clock that never moves unless [TestClock::advance] or
    /// [TestClock::set_millis] is called.
    pub fn frozen() -> Self {
        let clock = TestClock::new();
        clock.step.store(0, Ordering::SeqCst);
        clock
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) {
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        TestClock::new()
    }
}

impl Clock for TestClock {
    fn current_time(&self) -> SystemTime {
        let step = self.step.load(Ordering::SeqCst);
        SystemTime::UNIX_EPOCH + Duration::from_millis(self.millis.fetch_add(step, Ordering::SeqCst))
    }
}

/// A hybrid logical clock. Every timestamp it issues is strictly greater
/// than everything it issued before and everything it has been asked to
/// merge.
///
/// Usually this moves forward with the wall clock, but if the wall clock
/// stalls, goes backwards, or lags behind a merged timestamp, we issue the
/// previous value plus the smallest increment instead. All commit and abort
/// ordering decisions key off these values, not off raw wall-clock time.
///
/// The state is a single atomic word, so concurrent transactions on one agent
/// never serialize on a lock to get a timestamp.
pub struct CausalClock {
    clock: Box<dyn Clock>,
    prev: AtomicU64,
}

impl CausalClock {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        CausalClock {
            clock,
            prev: AtomicU64::new(0),
        }
    }

    pub fn wall_time(&self) -> Timestamp {
        Timestamp::from_system_time(self.clock.current_time())
    }

    /// Issues a timestamp greater than any previously issued or merged.
    pub fn now(&self) -> Timestamp {
        let wall = self.wall_time();
        self.advance(|prev| std::cmp::max(wall, prev.next()))
    }

    /// Folds an externally observed timestamp into local state.
    pub fn merge(&self, ts: Timestamp) {
        let ts = clamp_merged(ts);
        self.advance(|prev| std::cmp::max(ts, prev));
    }

    /// `merge(ts)` followed by `now()`, atomically. If `ts` is at or past the
    /// wall clock, the result is `ts` plus the smallest increment.
    pub fn merge_now(&self, ts: Timestamp) -> Timestamp {
        let ts = clamp_merged(ts);
        let wall = self.wall_time();
        self.advance(|prev| {
            let floor = std::cmp::max(prev, ts).next();
            std::cmp::max(wall, floor)
        })
    }

    fn advance(&self, f: impl Fn(Timestamp) -> Timestamp) -> Timestamp {
        let mut cur = self.prev.load(Ordering::SeqCst);
        loop {
            let next = f(Timestamp(cur));
            match self
                .prev
                .compare_exchange_weak(cur, next.0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }
}

// A peer sending a timestamp near the top of the range would otherwise
// leave `now()` nothing to increment into.
fn clamp_merged(ts: Timestamp) -> Timestamp {
    if ts > Timestamp::MERGE_CEILING {
        warn!("clamping merged timestamp {:?} to {:?}", ts, Timestamp::MERGE_CEILING);
        Timestamp::MERGE_CEILING
    } else {
        ts
    }
}

#[test]
fn test_now_is_strictly_increasing_on_frozen_clock() {
    let clock = CausalClock::new(Box::new(TestClock::frozen()));
    let mut prev = clock.now();
    for _ in 0..100 {
        let t = clock.now();
        assert!(t > prev);
        prev = t;
    }
}

#[test]
fn test_now_follows_wall_clock_when_it_moves_forward() {
    let test_clock = TestClock::frozen();
    test_clock.set_millis(5_000);
    let clock = CausalClock::new(Box::new(test_clock.clone()));
    assert_eq!(clock.now(), Timestamp(5_000 * 1_000_000));
    test_clock.advance(Duration::from_millis(10));
    assert_eq!(clock.now(), Timestamp(5_010 * 1_000_000));
}

#[test]
fn test_merge_from_the_future_pushes_now_past_it() {
    let clock = CausalClock::new(Box::new(TestClock::frozen()));
    let future = Timestamp(3_600 * 1_000_000_000);
    clock.merge(future);
    assert_eq!(clock.now(), future.next());
    assert_eq!(clock.merge_now(future), future.next().next());
}

#[test]
fn test_merge_now_exceeds_external_by_one_increment() {
    let test_clock = TestClock::frozen();
    test_clock.set_millis(1);
    let clock = CausalClock::new(Box::new(test_clock));
    let external = Timestamp(2_000_000_000);
    assert_eq!(clock.merge_now(external), external.next());
}

#[test]
fn test_merge_of_old_timestamp_does_not_move_clock_back() {
    let test_clock = TestClock::frozen();
    test_clock.set_millis(1_000);
    let clock = CausalClock::new(Box::new(test_clock));
    let first = clock.now();
    clock.merge(Timestamp(1));
    assert!(clock.now() > first);
    assert!(clock.merge_now(Timestamp(1)) > first);
}

#[test]
fn test_monotone_over_mixed_sequence() {
    let test_clock = TestClock::new();
    let clock = CausalClock::new(Box::new(test_clock));
    let mut high = Timestamp::ZERO;
    for i in 0..200u64 {
        if i % 3 == 0 {
            let ext = Timestamp(i * 7_919_000);
            clock.merge(ext);
            high = std::cmp::max(high, ext);
        } else if i % 5 == 0 {
            let ext = Timestamp(i * 3_000_000);
            let t = clock.merge_now(ext);
            assert!(t > high && t > ext);
            high = t;
        } else {
            let t = clock.now();
            assert!(t > high);
            high = t;
        }
    }
}

#[test]
fn test_absurd_merge_leaves_room_to_increase() {
    let clock = CausalClock::new(Box::new(TestClock::frozen()));
    clock.merge(Timestamp(u64::MAX));
    let a = clock.now();
    let b = clock.now();
    assert_eq!(a, Timestamp::MERGE_CEILING.next());
    assert!(b > a);
    let c = clock.merge_now(Timestamp(u64::MAX));
    assert!(c > b);
}
