// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{AccessCounter, SyncBoxFuture, TransactionId, TransactionalStatus};
use async_std::sync::{Arc, Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tracing::{debug, trace};

/// What a resource's lock knows about one transaction's hold on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRecord {
    pub transaction: TransactionId,
    pub access: AccessCounter,
}

/// The per-resource lock a [crate::ParticipantQueue] validates against. The
/// lock decides how concurrent transactions on one resource are ordered:
/// readers may share, writers are serialized by the lock's own policy.
pub trait ResourceLock: Send + Sync + 'static {
    /// Checks that `id` still holds the lock with the access the transaction
    /// recorded for this resource.
    fn validate_lock(
        &self,
        id: TransactionId,
        access: AccessCounter,
    ) -> SyncBoxFuture<(TransactionalStatus, LockRecord)>;

    /// Drops whatever `id` holds. Must tolerate ids it has never seen.
    fn release(&self, id: TransactionId) -> SyncBoxFuture<()>;

    /// Wakes anything waiting on the lock.
    fn notify(&self);
}

#[derive(Default)]
struct LockState {
    held: HashMap<TransactionId, AccessCounter>,
    broken: HashSet<TransactionId>,
}

impl LockState {
    fn compatible(&self, id: TransactionId, access: AccessCounter) -> bool {
        self.held
            .iter()
            .filter(|(holder, _)| **holder != id)
            .all(|(_, held)| !held.is_write() && !access.is_write())
    }
}

/// An in-memory reader/writer lock. Transactions acquire it while running
/// with [InMemoryLock::enter], or lazily at validation time. A writer
/// excludes every other holder; readers share.
///
/// Validation fails with `LockValidationFailed` if the hold recorded here
/// disagrees with the transaction's own access count or cannot be acquired,
/// and with `BrokenLock` if the hold was taken away by [InMemoryLock::break_lock].
#[derive(Clone, Default)]
pub struct InMemoryLock {
    state: Arc<(Mutex<LockState>, Condvar)>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        InMemoryLock::default()
    }

    /// Records `access` for `id`, waiting up to `wait` for conflicting
    /// holders to leave. Returns `LockValidationFailed` if they don't.
    pub async fn enter(&self, id: TransactionId, access: AccessCounter, wait: Duration) -> TransactionalStatus {
        let (lock, cvar) = &*self.state;
        let guard = lock.lock().await;
        if guard.broken.contains(&id) {
            return TransactionalStatus::BrokenLock;
        }
        let (mut guard, timeout) = cvar
            .wait_timeout_until(guard, wait, |st| st.compatible(id, access))
            .await;
        if timeout.timed_out() && !guard.compatible(id, access) {
            debug!("{:?} gave up waiting for lock", id);
            return TransactionalStatus::LockValidationFailed;
        }
        *guard.held.entry(id).or_default() += access;
        TransactionalStatus::Ok
    }

    /// Takes `id`'s hold away; its next validation fails with `BrokenLock`.
    pub async fn break_lock(&self, id: TransactionId) {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().await;
        if guard.held.remove(&id).is_some() {
            guard.broken.insert(id);
        }
        cvar.notify_all();
    }

    pub async fn holders(&self) -> usize {
        self.state.0.lock().await.held.len()
    }

    async fn validate(&self, id: TransactionId, access: AccessCounter) -> (TransactionalStatus, LockRecord) {
        let mut guard = self.state.0.lock().await;
        let record = LockRecord {
            transaction: id,
            access,
        };
        if guard.broken.contains(&id) {
            return (TransactionalStatus::BrokenLock, record);
        }
        let held = guard.held.get(&id).copied();
        let status = match held {
            Some(held) if held == access => TransactionalStatus::Ok,
            Some(held) => {
                debug!("{:?} recorded {:?} but lock saw {:?}", id, access, held);
                TransactionalStatus::LockValidationFailed
            }
            None if guard.compatible(id, access) => {
                guard.held.insert(id, access);
                TransactionalStatus::Ok
            }
            None => TransactionalStatus::LockValidationFailed,
        };
        trace!("validated {:?}: {:?}", id, status);
        (status, record)
    }
}

impl ResourceLock for InMemoryLock {
    fn validate_lock(
        &self,
        id: TransactionId,
        access: AccessCounter,
    ) -> SyncBoxFuture<(TransactionalStatus, LockRecord)> {
        let this = self.clone();
        Box::pin(async move { this.validate(id, access).await })
    }

    fn release(&self, id: TransactionId) -> SyncBoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            let mut guard = this.state.0.lock().await;
            guard.held.remove(&id);
            guard.broken.remove(&id);
        })
    }

    fn notify(&self) {
        self.state.1.notify_all();
    }
}

#[test]
fn test_writers_exclude_each_other() {
    async_std::task::block_on(async {
        let lock = InMemoryLock::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        let (a, b) = (TransactionId::new(), TransactionId::new());
        assert_eq!(lock.validate_lock(a, w).await.0, TransactionalStatus::Ok);
        assert_eq!(
            lock.validate_lock(b, w).await.0,
            TransactionalStatus::LockValidationFailed
        );
        lock.release(a).await;
        assert_eq!(lock.validate_lock(b, w).await.0, TransactionalStatus::Ok);
    });
}

#[test]
fn test_readers_share_but_block_writer() {
    async_std::task::block_on(async {
        let lock = InMemoryLock::new();
        let r = AccessCounter { reads: 1, writes: 0 };
        let w = AccessCounter { reads: 0, writes: 1 };
        let (a, b, c) = (TransactionId::new(), TransactionId::new(), TransactionId::new());
        assert_eq!(lock.enter(a, r, Duration::from_millis(1)).await, TransactionalStatus::Ok);
        assert_eq!(lock.enter(b, r, Duration::from_millis(1)).await, TransactionalStatus::Ok);
        assert_eq!(
            lock.enter(c, w, Duration::from_millis(5)).await,
            TransactionalStatus::LockValidationFailed
        );
        assert_eq!(lock.holders().await, 2);
    });
}

#[test]
fn test_mismatched_access_and_broken_lock() {
    async_std::task::block_on(async {
        let lock = InMemoryLock::new();
        let r = AccessCounter { reads: 1, writes: 0 };
        let rw = AccessCounter { reads: 1, writes: 1 };
        let (a, b) = (TransactionId::new(), TransactionId::new());
        lock.enter(a, r, Duration::from_millis(1)).await;
        assert_eq!(
            lock.validate_lock(a, rw).await.0,
            TransactionalStatus::LockValidationFailed
        );
        lock.enter(b, r, Duration::from_millis(1)).await;
        lock.break_lock(b).await;
        assert_eq!(lock.validate_lock(b, r).await.0, TransactionalStatus::BrokenLock);
    });
}

#[test]
fn test_waiting_writer_is_woken_by_release() {
    async_std::task::block_on(async {
        let lock = InMemoryLock::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        let (a, b) = (TransactionId::new(), TransactionId::new());
        lock.enter(a, w, Duration::from_millis(1)).await;
        let releaser = lock.clone();
        async_std::task::spawn(async move {
            async_std::task::sleep(Duration::from_millis(20)).await;
            releaser.release(a).await;
            releaser.notify();
        });
        assert_eq!(lock.enter(b, w, Duration::from_secs(5)).await, TransactionalStatus::Ok);
    });
}
