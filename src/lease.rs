// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Time-bounded exclusive ownership of named resources.
//!
//! A lease is held by whoever has its current token. Renewal rotates the
//! token, so a holder that misses a renewal window cannot keep acting on a
//! stale one: the next renewal answers `InvalidToken`.

use crate::{Clock, Error, SyncBoxFuture, Timestamp};
use async_std::sync::{Arc, Mutex};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub resource_key: String,
    pub duration: Duration,
}

impl LeaseRequest {
    pub fn new(resource_key: impl Into<String>, duration: Duration) -> Self {
        LeaseRequest {
            resource_key: resource_key.into(),
            duration,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcquiredLease {
    pub resource_key: String,
    pub token: String,
    pub duration: Duration,
    pub start_time: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    /// The token presented is not the lease's current token; the caller
    /// no longer owns it.
    InvalidToken,
    /// Someone else holds the lease.
    LeaseNotAvailable,
    /// Try again.
    TransientFailure,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireResult {
    pub code: ResponseCode,
    /// Present iff `code` is `Ok`.
    pub lease: Option<AcquiredLease>,
}

impl AcquireResult {
    pub fn ok(lease: AcquiredLease) -> Self {
        AcquireResult {
            code: ResponseCode::Ok,
            lease: Some(lease),
        }
    }

    pub fn failed(code: ResponseCode) -> Self {
        AcquireResult { code, lease: None }
    }
}

/// An `Err` from these calls means the provider could not be reached; the
/// caller treats it like `TransientFailure`.
pub trait LeaseProvider: Send + Sync + 'static {
    fn acquire(&self, request: LeaseRequest) -> SyncBoxFuture<Result<AcquireResult, Error>>;
    fn renew(&self, lease: AcquiredLease) -> SyncBoxFuture<Result<AcquireResult, Error>>;
    fn release(&self, lease: AcquiredLease) -> SyncBoxFuture<Result<(), Error>>;
}

#[derive(Debug)]
struct HeldLease {
    token: String,
    expires: Timestamp,
}

/// A single-process lease table. Expiry is judged against the supplied
/// [Clock], so tests can run leases out by moving a [crate::TestClock].
#[derive(Clone)]
pub struct InMemoryLeaseProvider {
    clock: Arc<dyn Clock>,
    leases: Arc<Mutex<HashMap<String, HeldLease>>>,
    failing_renewals: Arc<AtomicUsize>,
    unreachable_renewals: Arc<AtomicUsize>,
}

impl InMemoryLeaseProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryLeaseProvider {
            clock,
            leases: Arc::new(Mutex::new(HashMap::new())),
            failing_renewals: Arc::new(AtomicUsize::new(0)),
            unreachable_renewals: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(self.clock.current_time())
    }

    /// Takes the lease away from its holder, as if another node had been
    /// granted it after a partition.
    pub async fn revoke(&self, resource_key: &str) {
        debug!("revoking lease {}", resource_key);
        self.leases.lock().await.remove(resource_key);
    }

    /// The next `n` renewals answer `TransientFailure`.
    pub fn fail_next_renewals(&self, n: usize) {
        self.failing_renewals.store(n, Ordering::SeqCst);
    }

    /// The next `n` renewals fail to reach the table at all.
    pub fn disconnect_next_renewals(&self, n: usize) {
        self.unreachable_renewals.store(n, Ordering::SeqCst);
    }

    fn take_renewal_failure(&self) -> bool {
        take_one(&self.failing_renewals)
    }

    async fn acquire_(&self, request: LeaseRequest) -> AcquireResult {
        let now = self.now();
        let mut leases = self.leases.lock().await;
        if let Some(held) = leases.get(&request.resource_key) {
            if held.expires > now {
                trace!("lease {} is held until {:?}", request.resource_key, held.expires);
                return AcquireResult::failed(ResponseCode::LeaseNotAvailable);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(
            request.resource_key.clone(),
            HeldLease {
                token: token.clone(),
                expires: now.saturating_add(request.duration),
            },
        );
        AcquireResult::ok(AcquiredLease {
            resource_key: request.resource_key,
            token,
            duration: request.duration,
            start_time: now,
        })
    }

    async fn renew_(&self, lease: AcquiredLease) -> AcquireResult {
        if self.take_renewal_failure() {
            return AcquireResult::failed(ResponseCode::TransientFailure);
        }
        let now = self.now();
        let mut leases = self.leases.lock().await;
        let held = match leases.get_mut(&lease.resource_key) {
            None => return AcquireResult::failed(ResponseCode::LeaseNotAvailable),
            Some(held) => held,
        };
        if held.token != lease.token {
            return AcquireResult::failed(ResponseCode::InvalidToken);
        }
        if held.expires <= now {
            leases.remove(&lease.resource_key);
            return AcquireResult::failed(ResponseCode::InvalidToken);
        }
        let token = Uuid::new_v4().to_string();
        held.token = token.clone();
        held.expires = now.saturating_add(lease.duration);
        AcquireResult::ok(AcquiredLease {
            token,
            start_time: now,
            ..lease
        })
    }

    async fn release_(&self, lease: AcquiredLease) {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.resource_key).map(|h| &h.token) == Some(&lease.token) {
            leases.remove(&lease.resource_key);
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LeaseProvider for InMemoryLeaseProvider {
    fn acquire(&self, request: LeaseRequest) -> SyncBoxFuture<Result<AcquireResult, Error>> {
        let this = self.clone();
        Box::pin(async move { Ok(this.acquire_(request).await) })
    }

    fn renew(&self, lease: AcquiredLease) -> SyncBoxFuture<Result<AcquireResult, Error>> {
        let this = self.clone();
        Box::pin(async move {
            if take_one(&this.unreachable_renewals) {
                return Err(Error::Lease(format!(
                    "lease table unreachable renewing {}",
                    lease.resource_key
                )));
            }
            Ok(this.renew_(lease).await)
        })
    }

    fn release(&self, lease: AcquiredLease) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        Box::pin(async move {
            this.release_(lease).await;
            Ok(())
        })
    }
}

#[test]
fn test_lease_exclusive_until_expiry() {
    async_std::task::block_on(async {
        let clock = crate::TestClock::frozen();
        let provider = InMemoryLeaseProvider::new(Arc::new(clock.clone()));
        let req = LeaseRequest::new("k", Duration::from_secs(10));
        let first = provider.acquire(req.clone()).await.unwrap();
        assert_eq!(first.code, ResponseCode::Ok);
        assert_eq!(
            provider.acquire(req.clone()).await.unwrap().code,
            ResponseCode::LeaseNotAvailable
        );
        clock.advance(Duration::from_secs(11));
        let second = provider.acquire(req).await.unwrap();
        assert_eq!(second.code, ResponseCode::Ok);
        // The first holder's token is dead.
        let stale = first.lease.unwrap();
        assert_eq!(
            provider.renew(stale).await.unwrap().code,
            ResponseCode::InvalidToken
        );
    });
}

#[test]
fn test_renew_rotates_token() {
    async_std::task::block_on(async {
        let clock = crate::TestClock::frozen();
        let provider = InMemoryLeaseProvider::new(Arc::new(clock.clone()));
        let lease = provider
            .acquire(LeaseRequest::new("k", Duration::from_secs(10)))
            .await
            .unwrap()
            .lease
            .unwrap();
        clock.advance(Duration::from_secs(5));
        let renewed = provider.renew(lease.clone()).await.unwrap().lease.unwrap();
        assert_ne!(renewed.token, lease.token);
        assert_eq!(
            provider.renew(lease).await.unwrap().code,
            ResponseCode::InvalidToken
        );
        provider.fail_next_renewals(1);
        assert_eq!(
            provider.renew(renewed.clone()).await.unwrap().code,
            ResponseCode::TransientFailure
        );
        provider.disconnect_next_renewals(1);
        match provider.renew(renewed.clone()).await {
            Err(Error::Lease(_)) => (),
            other => panic!("expected a lease error, got {:?}", other),
        }
        assert_eq!(provider.renew(renewed).await.unwrap().code, ResponseCode::Ok);
    });
}

#[test]
fn test_revoke_and_release() {
    async_std::task::block_on(async {
        let provider = InMemoryLeaseProvider::new(Arc::new(crate::TestClock::frozen()));
        let req = LeaseRequest::new("k", Duration::from_secs(10));
        let lease = provider.acquire(req.clone()).await.unwrap().lease.unwrap();
        provider.revoke("k").await;
        assert_eq!(
            provider.renew(lease).await.unwrap().code,
            ResponseCode::LeaseNotAvailable
        );
        let lease = provider.acquire(req.clone()).await.unwrap().lease.unwrap();
        provider.release(lease).await.unwrap();
        assert_eq!(provider.acquire(req).await.unwrap().code, ResponseCode::Ok);
    });
}
