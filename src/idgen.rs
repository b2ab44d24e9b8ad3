// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Unique, monotonically increasing 64-bit ids for managers that need a
//! durable log order.
//!
//! Ids are handed out from contiguous buckets that durable storage allocates
//! to one requestor at a time. A generator only allocates while it holds a
//! named lease, and stops serving the moment it can no longer prove that it
//! still does. Two generators therefore never serve overlapping ids, even
//! when one of them loses its lease half-way through a bucket and another
//! takes over.
//!
//! While one bucket is being consumed the next is already being fetched, so
//! the common case of crossing a bucket boundary does not wait on storage.
//!
//! If refilling fails, the error goes to the caller that triggered the
//! refill and a fresh allocation is started for the next caller. Ids left in
//! a bucket that was being consumed when the generator was invalidated are
//! never served by anyone.

use crate::{
    AcquireResult, AcquiredLease, Error, IdGeneratorConfig, LeaseProvider, LeaseRequest,
    ResponseCode, SyncBoxFuture,
};
use async_std::{
    sync::{Arc, Mutex},
    task::{self, JoinHandle},
};
use futures::future::{abortable, AbortHandle};
use std::{
    ops::Range,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use tracing::{debug, debug_span, info, warn, Instrument};

/// Durable source of id ranges. A requestor must never be handed a range
/// overlapping one handed to a different requestor.
pub trait IdAllocationStorage: Send + Sync + 'static {
    fn allocate_sequential_ids(
        &self,
        requestor: String,
        batch_size: u64,
    ) -> SyncBoxFuture<Result<Range<u64>, Error>>;
}

#[derive(Default)]
struct StorageState {
    next: u64,
    owner: Option<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryIdStorage {
    state: Arc<Mutex<StorageState>>,
    failing: Arc<AtomicUsize>,
}

impl InMemoryIdStorage {
    pub fn new() -> Self {
        InMemoryIdStorage::default()
    }

    /// The next `n` allocations fail.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    async fn allocate(&self, requestor: String, batch_size: u64) -> Result<Range<u64>, Error> {
        if self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Storage("allocation failed".to_string()));
        }
        let mut st = self.state.lock().await;
        if st.owner.as_ref() != Some(&requestor) {
            debug!("id allocation moves from {:?} to {}", st.owner, requestor);
            st.owner = Some(requestor);
        }
        let start = st.next;
        st.next = start.saturating_add(batch_size);
        Ok(start..st.next)
    }
}

impl IdAllocationStorage for InMemoryIdStorage {
    fn allocate_sequential_ids(
        &self,
        requestor: String,
        batch_size: u64,
    ) -> SyncBoxFuture<Result<Range<u64>, Error>> {
        let this = self.clone();
        Box::pin(async move { this.allocate(requestor, batch_size).await })
    }
}

struct Buckets {
    current: Range<u64>,
    prefetch: Option<JoinHandle<Result<Range<u64>, Error>>>,
}

struct Shared {
    instance_id: String,
    config: IdGeneratorConfig,
    leases: Arc<dyn LeaseProvider>,
    storage: Arc<dyn IdAllocationStorage>,
    lease: Mutex<Option<AcquiredLease>>,
    valid: AtomicBool,
    buckets: Mutex<Buckets>,
}

impl Shared {
    fn check_valid(&self) -> Result<(), Error> {
        if self.valid.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::GeneratorUnavailable)
        }
    }

    fn spawn_allocation(&self) -> JoinHandle<Result<Range<u64>, Error>> {
        let storage = self.storage.clone();
        let requestor = self.instance_id.clone();
        let batch_size = self.config.batch_size;
        task::spawn(async move { storage.allocate_sequential_ids(requestor, batch_size).await })
    }

    /// Swaps in the prefetched bucket and starts fetching the one after.
    async fn refill(&self, buckets: &mut Buckets) -> Result<(), Error> {
        let pending = match buckets.prefetch.take() {
            Some(pending) => pending,
            None => self.spawn_allocation(),
        };
        let result = pending.await;
        self.check_valid()?;
        buckets.prefetch = Some(self.spawn_allocation());
        match result {
            Ok(range) => {
                debug!("new id bucket {:?}", range);
                buckets.current = range;
                Ok(())
            }
            Err(e) => {
                warn!("id bucket refill failed, retrying in background: {}", e);
                Err(e)
            }
        }
    }

    async fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            warn!("transaction id generator {} invalidated", self.instance_id);
        }
        // A caller holding the buckets is waiting on a refill, and checks
        // validity again as soon as it lands.
        let pending = match self.buckets.try_lock() {
            Some(mut buckets) => {
                buckets.current = 0..0;
                buckets.prefetch.take()
            }
            None => None,
        };
        if let Some(pending) = pending {
            pending.cancel().await;
        }
    }

    /// One renewal round. Returns false once ownership is lost.
    async fn renew(&self) -> bool {
        let mut failures = 0;
        loop {
            let lease = match self.lease.lock().await.clone() {
                Some(lease) => lease,
                None => return false,
            };
            match self.leases.renew(lease).await {
                Ok(AcquireResult {
                    code: ResponseCode::Ok,
                    lease: Some(renewed),
                }) => {
                    *self.lease.lock().await = Some(renewed);
                    return true;
                }
                Ok(AcquireResult {
                    code: code @ ResponseCode::InvalidToken,
                    ..
                })
                | Ok(AcquireResult {
                    code: code @ ResponseCode::LeaseNotAvailable,
                    ..
                }) => {
                    warn!("lost lease {}: {:?}", self.config.lease_key, code);
                    return false;
                }
                other => {
                    failures += 1;
                    debug!("transient lease renewal failure {}: {:?}", failures, other);
                    if failures > self.config.max_renew_retries {
                        warn!(
                            "giving up lease {} after {} renewal failures",
                            self.config.lease_key, failures
                        );
                        return false;
                    }
                }
            }
        }
    }

    async fn renewal_loop(self: Arc<Self>) {
        let period = self.config.lease_duration / 2;
        loop {
            task::sleep(period).await;
            if !self.renew().await {
                self.invalidate().await;
                break;
            }
        }
    }
}

/// Serves ids while it holds the generator lease. Create with
/// [TransactionIdGenerator::start]; stop with
/// [TransactionIdGenerator::dispose].
pub struct TransactionIdGenerator {
    shared: Arc<Shared>,
    renewal: AbortHandle,
}

impl TransactionIdGenerator {
    /// Acquires the lease, allocates the first bucket, begins prefetching
    /// the second and starts the renewal loop.
    pub async fn start(
        instance_id: impl Into<String>,
        config: IdGeneratorConfig,
        leases: Arc<dyn LeaseProvider>,
        storage: Arc<dyn IdAllocationStorage>,
    ) -> Result<Self, Error> {
        let instance_id = instance_id.into();
        let request = LeaseRequest::new(config.lease_key.clone(), config.lease_duration);
        let lease = match leases.acquire(request).await {
            Ok(AcquireResult {
                code: ResponseCode::Ok,
                lease: Some(lease),
            }) => lease,
            Ok(res) => {
                warn!("cannot acquire lease {}: {:?}", config.lease_key, res.code);
                return Err(Error::GeneratorUnavailable);
            }
            Err(e) => {
                warn!("cannot acquire lease {}: {}", config.lease_key, e);
                return Err(Error::GeneratorUnavailable);
            }
        };
        let first = match storage
            .allocate_sequential_ids(instance_id.clone(), config.batch_size)
            .await
        {
            Ok(range) => range,
            Err(e) => {
                if let Err(e) = leases.release(lease).await {
                    warn!("releasing lease after failed start: {}", e);
                }
                return Err(e);
            }
        };
        info!("transaction id generator {} starting at {}", instance_id, first.start);
        let shared = Arc::new(Shared {
            instance_id,
            config,
            leases,
            storage,
            lease: Mutex::new(Some(lease)),
            valid: AtomicBool::new(true),
            buckets: Mutex::new(Buckets {
                current: first,
                prefetch: None,
            }),
        });
        shared.buckets.lock().await.prefetch = Some(shared.spawn_allocation());

        let span = debug_span!("id-lease-renewal", instance = %shared.instance_id);
        let (renewal_loop, renewal) = abortable(shared.clone().renewal_loop());
        task::spawn(renewal_loop.instrument(span));
        Ok(TransactionIdGenerator { shared, renewal })
    }

    pub fn is_valid(&self) -> bool {
        self.shared.valid.load(Ordering::Acquire)
    }

    pub async fn next_id(&self) -> Result<u64, Error> {
        let mut buckets = self.shared.buckets.lock().await;
        loop {
            self.shared.check_valid()?;
            if let Some(id) = buckets.current.next() {
                return Ok(id);
            }
            self.shared.refill(&mut buckets).await?;
        }
    }

    /// `n` consecutive ids from this generator. If a refill fails part-way
    /// the ids already taken are lost.
    pub async fn next_ids(&self, n: usize) -> Result<Vec<u64>, Error> {
        let mut ids = Vec::with_capacity(n);
        let mut buckets = self.shared.buckets.lock().await;
        while ids.len() < n {
            self.shared.check_valid()?;
            match buckets.current.next() {
                Some(id) => ids.push(id),
                None => self.shared.refill(&mut buckets).await?,
            }
        }
        Ok(ids)
    }

    /// Stops renewing, releases the lease and stops serving.
    pub async fn dispose(&self) {
        self.renewal.abort();
        self.shared.invalidate().await;
        let lease = self.shared.lease.lock().await.take();
        if let Some(lease) = lease {
            if let Err(e) = self.shared.leases.release(lease).await {
                warn!("releasing lease {}: {}", self.shared.config.lease_key, e);
            }
        }
    }
}

impl Drop for TransactionIdGenerator {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
