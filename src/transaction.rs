// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A transaction attempt is named by a random 128-bit [TransactionId] and
//! carries a [Timestamp] that only moves forward as the attempt observes
//! other participants' clocks.
//!
//! Every resource touched by the attempt becomes a participant, keyed by
//! [ParticipantId], with an [AccessCounter] of the reads and writes it saw.
//! A participant with any writes is a *write participant*.

use crate::{Error, Timestamp, TransactionalStatus};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::{Add, AddAssign},
    time::Duration,
};
use uuid::Uuid;

#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(Uuid::new_v4())
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("tx:{}", self.0))
    }
}

/// Names a resource taking part in transactions. Resolved to a concrete
/// handle through a [crate::ParticipantRegistry] at call time.
#[derive(Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(name: impl Into<String>) -> Self {
        ParticipantId(name.into())
    }
}

impl std::fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("@{}", self.0))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessCounter {
    pub reads: u32,
    pub writes: u32,
}

impl AccessCounter {
    pub fn is_write(&self) -> bool {
        self.writes > 0
    }
}

impl Add for AccessCounter {
    type Output = AccessCounter;
    fn add(self, other: AccessCounter) -> AccessCounter {
        AccessCounter {
            reads: self.reads.saturating_add(other.reads),
            writes: self.writes.saturating_add(other.writes),
        }
    }
}

impl AddAssign for AccessCounter {
    fn add_assign(&mut self, other: AccessCounter) {
        *self = *self + other;
    }
}

/// The mutable context of one transaction attempt. Owned by whoever is
/// coordinating the attempt; forks travel with nested calls and are joined
/// back when those calls return.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub timestamp: Timestamp,
    pub is_read_only: bool,
    pub timeout: Duration,
    pub participants: BTreeMap<ParticipantId, AccessCounter>,
    pub tm_candidate: Option<ParticipantId>,
    /// Transactions whose uncommitted writes this one observed. They travel
    /// with the commit calls, and a participant that remembers one of them
    /// aborting refuses this one with `CascadingAbort`.
    pub dependencies: BTreeSet<TransactionId>,
    /// The first failure recorded while running the transaction body.
    pub failure: Option<TransactionalStatus>,
}

impl TransactionInfo {
    pub fn new(id: TransactionId, timestamp: Timestamp, is_read_only: bool, timeout: Duration) -> Self {
        TransactionInfo {
            id,
            timestamp,
            is_read_only,
            timeout,
            participants: BTreeMap::new(),
            tm_candidate: None,
            dependencies: BTreeSet::new(),
            failure: None,
        }
    }

    fn record_access(&mut self, participant: ParticipantId, ts: Timestamp, access: AccessCounter) {
        if ts > self.timestamp {
            self.timestamp = ts;
        }
        *self.participants.entry(participant).or_default() += access;
    }

    /// Records one read against `participant`, which reported its value as
    /// of `ts`.
    pub fn record_read(&mut self, participant: ParticipantId, ts: Timestamp) {
        self.record_access(participant, ts, AccessCounter { reads: 1, writes: 0 });
    }

    pub fn record_write(&mut self, participant: ParticipantId, ts: Timestamp) -> Result<(), Error> {
        if self.is_read_only {
            return Err(Error::ReadOnlyViolation);
        }
        self.record_access(participant, ts, AccessCounter { reads: 0, writes: 1 });
        Ok(())
    }

    pub fn set_tm_candidate(&mut self, participant: ParticipantId) {
        self.tm_candidate = Some(participant);
    }

    pub fn record_dependency(&mut self, id: TransactionId) {
        if id != self.id {
            self.dependencies.insert(id);
        }
    }

    /// Marks the attempt as doomed. The first recorded failure wins.
    pub fn record_failure(&mut self, status: TransactionalStatus) {
        if self.failure.is_none() && !status.is_ok() {
            self.failure = Some(status);
        }
    }

    /// A context for a nested call: same transaction, nothing recorded yet.
    pub fn fork(&self) -> TransactionInfo {
        TransactionInfo {
            participants: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            failure: None,
            ..self.clone()
        }
    }

    /// Folds a returned fork back in.
    pub fn join(&mut self, other: TransactionInfo) {
        debug_assert_eq!(self.id, other.id);
        if other.timestamp > self.timestamp {
            self.timestamp = other.timestamp;
        }
        for (p, access) in other.participants {
            *self.participants.entry(p).or_default() += access;
        }
        self.dependencies.extend(other.dependencies);
        if self.tm_candidate.is_none() {
            self.tm_candidate = other.tm_candidate;
        }
        if let Some(status) = other.failure {
            self.record_failure(status);
        }
    }

    /// Dependencies in id order, as sent to participants.
    pub fn dependency_list(&self) -> Vec<TransactionId> {
        self.dependencies.iter().copied().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Write participants in id order.
    pub fn write_participants(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|(_, a)| a.is_write())
            .map(|(p, _)| p.clone())
            .collect()
    }
}

#[test]
fn test_access_counter_addition() {
    let a = AccessCounter { reads: 1, writes: 0 };
    let b = AccessCounter { reads: 2, writes: 3 };
    assert_eq!(a + b, AccessCounter { reads: 3, writes: 3 });
    let mut c = AccessCounter::default();
    c += a;
    c += a;
    assert_eq!(c, AccessCounter { reads: 2, writes: 0 });
    assert!(!c.is_write());
    assert!(b.is_write());
}

#[test]
fn test_record_accesses_and_partition() {
    let mut info = TransactionInfo::new(TransactionId::new(), Timestamp(10), false, Duration::from_secs(1));
    let p1 = ParticipantId::new("p1");
    let p2 = ParticipantId::new("p2");
    let p3 = ParticipantId::new("p3");
    info.record_read(p1.clone(), Timestamp(5));
    info.record_write(p1.clone(), Timestamp(12)).unwrap();
    info.record_write(p2.clone(), Timestamp(11)).unwrap();
    info.record_read(p3.clone(), Timestamp(3));
    assert_eq!(info.timestamp, Timestamp(12));
    assert_eq!(info.participants[&p1], AccessCounter { reads: 1, writes: 1 });
    assert_eq!(info.participant_count(), 3);
    assert_eq!(info.write_participants(), vec![p1, p2]);
}

#[test]
fn test_read_only_rejects_writes() {
    let mut info = TransactionInfo::new(TransactionId::new(), Timestamp(1), true, Duration::from_secs(1));
    assert_eq!(
        info.record_write(ParticipantId::new("p"), Timestamp(2)),
        Err(Error::ReadOnlyViolation)
    );
    assert!(info.participants.is_empty());
}

#[test]
fn test_fork_and_join() {
    let mut info = TransactionInfo::new(TransactionId::new(), Timestamp(1), false, Duration::from_secs(1));
    let p = ParticipantId::new("p");
    info.record_read(p.clone(), Timestamp(1));
    let mut child = info.fork();
    assert!(child.participants.is_empty());
    child.record_write(p.clone(), Timestamp(9)).unwrap();
    child.record_dependency(TransactionId::new());
    child.record_failure(TransactionalStatus::BrokenLock);
    child.record_failure(TransactionalStatus::StorageConflict);
    info.join(child);
    assert_eq!(info.participants[&p], AccessCounter { reads: 1, writes: 1 });
    assert_eq!(info.timestamp, Timestamp(9));
    assert_eq!(info.dependencies.len(), 1);
    assert_eq!(info.failure, Some(TransactionalStatus::BrokenLock));
}
