// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The resource-side half of the commit protocol.
//!
//! A [ParticipantQueue] sits in front of one resource and keeps a record per
//! transaction id that has reached the prepare stage there. The record's
//! [CommitRole] says what this resource is doing for that transaction:
//!
//!   - `NotYetDetermined`: seen, not yet validated. A TM's record also sits
//!     here while votes arrive ahead of its own `prepare_and_commit`.
//!
//!   - `RemoteCommit`: prepared on behalf of some other TM. Waits for
//!     `confirm` or `cancel`; if neither comes, pings the TM.
//!
//!   - `LocalCommit`: this resource is the TM. Collects `prepared` votes from
//!     every other participant, then commits (and confirms) or aborts (and
//!     cancels), resolving the caller's pending promise either way.
//!
//!   - `ReadOnly`: a one-round read-only commit in flight.
//!
//! Transitions are only taken from the prior roles listed for each call;
//! anything else is an internal error, logged loudly and returned as
//! [Error::UnexpectedRole], never silently overwritten.
//!
//! Once a transaction resolves at this queue its outcome is remembered for a
//! while, and any later message for the same id is answered from that memory
//! rather than re-deciding. The same memory dooms dependents: a transaction
//! that names an aborted one among its dependencies is refused here with
//! `CascadingAbort` before it touches the lock.
//!
//! Nothing waits forever. A TM record parked by early votes is aborted with
//! `PrepareTimeout` if its own `prepare_and_commit` does not follow within
//! the prepare timeout, and the prepared writers pinging it then hear
//! `cancel`.

use crate::{
    AccessCounter, CausalClock, Error, Participant, ParticipantId, ParticipantRegistry,
    QueueConfig, ResourceLock, SyncBoxFuture, Timestamp, TransactionId, TransactionalStatus,
};
use async_std::{
    future,
    sync::{Arc, Mutex},
    task,
};
use futures::channel::oneshot;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, debug_span, error, trace, Instrument};

#[derive(Debug)]
pub enum CommitRole {
    NotYetDetermined,
    RemoteCommit {
        manager: ParticipantId,
        /// Set once a `prepared` vote has gone upstream; after that the
        /// TM can only learn about a local problem through its own timeout.
        prepared_sent: bool,
    },
    LocalCommit {
        write_participants: Vec<ParticipantId>,
        /// Number of `prepared` votes needed before deciding.
        waiting_for: usize,
        promise: Option<oneshot::Sender<TransactionalStatus>>,
    },
    ReadOnly,
}

impl CommitRole {
    pub fn name(&self) -> &'static str {
        match self {
            CommitRole::NotYetDetermined => "NotYetDetermined",
            CommitRole::RemoteCommit { .. } => "RemoteCommit",
            CommitRole::LocalCommit { .. } => "LocalCommit",
            CommitRole::ReadOnly => "ReadOnly",
        }
    }
}

#[derive(Debug)]
struct ParticipantRecord {
    access: AccessCounter,
    timestamp: Timestamp,
    role: CommitRole,
    votes: BTreeMap<ParticipantId, TransactionalStatus>,
}

impl ParticipantRecord {
    fn new(access: AccessCounter, timestamp: Timestamp, role: CommitRole) -> Self {
        ParticipantRecord {
            access,
            timestamp,
            role,
            votes: BTreeMap::new(),
        }
    }
}

struct QueueState {
    records: HashMap<TransactionId, ParticipantRecord>,
    resolved: HashMap<TransactionId, TransactionalStatus>,
    resolved_order: VecDeque<TransactionId>,
    history: usize,
}

impl QueueState {
    fn new(history: usize) -> Self {
        QueueState {
            records: HashMap::new(),
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            history,
        }
    }

    fn outcome(&self, id: &TransactionId) -> Option<TransactionalStatus> {
        self.resolved.get(id).cloned()
    }

    fn remember(&mut self, id: TransactionId, status: TransactionalStatus) {
        if self.resolved.insert(id, status).is_none() {
            self.resolved_order.push_back(id);
        }
        while self.resolved_order.len() > self.history {
            match self.resolved_order.pop_front() {
                Some(old) => {
                    self.resolved.remove(&old);
                }
                None => break,
            }
        }
    }

    fn role(&self, id: &TransactionId) -> Option<&CommitRole> {
        self.records.get(id).map(|r| &r.role)
    }

    /// The first of `dependencies` remembered here as aborted.
    fn aborted_dependency(&self, dependencies: &[TransactionId]) -> Option<TransactionId> {
        dependencies
            .iter()
            .find(|d| self.outcome(d).map_or(false, |s| !s.is_ok()))
            .copied()
    }
}

/// Everything that has to happen after a record resolves, carried out once
/// the queue state is unlocked.
struct Resolution {
    id: TransactionId,
    status: TransactionalStatus,
    timestamp: Timestamp,
    prepared_to: Option<ParticipantId>,
    confirm: Vec<ParticipantId>,
    cancel: Vec<ParticipantId>,
    promise: Option<oneshot::Sender<TransactionalStatus>>,
}

impl Resolution {
    fn new(id: TransactionId, status: TransactionalStatus, timestamp: Timestamp) -> Self {
        Resolution {
            id,
            status,
            timestamp,
            prepared_to: None,
            confirm: Vec::new(),
            cancel: Vec::new(),
            promise: None,
        }
    }
}

/// Per-resource commit/abort state machine. Cheap to clone; clones share
/// state. Register it in a [ParticipantRegistry] under its own id to make
/// the resource reachable.
pub struct ParticipantQueue<R: ResourceLock> {
    self_id: ParticipantId,
    lock: Arc<R>,
    clock: Arc<CausalClock>,
    registry: ParticipantRegistry,
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
}

impl<R: ResourceLock> Clone for ParticipantQueue<R> {
    fn clone(&self) -> Self {
        ParticipantQueue {
            self_id: self.self_id.clone(),
            lock: self.lock.clone(),
            clock: self.clock.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        }
    }
}

impl<R: ResourceLock> ParticipantQueue<R> {
    pub fn new(
        self_id: ParticipantId,
        lock: Arc<R>,
        clock: Arc<CausalClock>,
        registry: ParticipantRegistry,
        config: QueueConfig,
    ) -> Self {
        let history = config.resolved_history;
        ParticipantQueue {
            self_id,
            lock,
            clock,
            registry,
            config,
            state: Arc::new(Mutex::new(QueueState::new(history))),
        }
    }

    pub fn self_id(&self) -> &ParticipantId {
        &self.self_id
    }

    /// Name of the role `id` currently holds here, if it has a live record.
    pub async fn role_of(&self, id: &TransactionId) -> Option<&'static str> {
        self.state.lock().await.role(id).map(|r| r.name())
    }

    /// The remembered outcome of `id`, if it resolved here.
    pub async fn outcome_of(&self, id: &TransactionId) -> Option<TransactionalStatus> {
        self.state.lock().await.outcome(id)
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.records.len()
    }

    fn unexpected(&self, id: TransactionId, expected: &'static str, role: &CommitRole) -> Error {
        error!(
            "transaction {:?} at {:?} is in role {}, expected {}",
            id,
            self.self_id,
            role.name(),
            expected
        );
        Error::UnexpectedRole {
            transaction: id,
            expected,
            found: role.name(),
        }
    }

    async fn release(&self, id: TransactionId) {
        self.lock.release(id).await;
        self.lock.notify();
    }

    async fn validate(
        &self,
        id: TransactionId,
        access: AccessCounter,
        doomed_by: Option<TransactionId>,
    ) -> TransactionalStatus {
        match doomed_by {
            Some(dependency) => {
                debug!("{:?} depends on aborted {:?}", id, dependency);
                TransactionalStatus::CascadingAbort
            }
            None => self.lock.validate_lock(id, access).await.0,
        }
    }

    fn send_prepared(
        &self,
        manager: ParticipantId,
        id: TransactionId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) {
        let me = self.self_id.clone();
        self.registry
            .send_one_way(manager, "prepared", move |tm| tm.prepared(id, timestamp, me, status));
    }

    /// Aborts a record with `status`, notifying whoever its role says must
    /// hear about it.
    fn abort_record(
        &self,
        st: &mut QueueState,
        id: TransactionId,
        status: TransactionalStatus,
    ) -> Resolution {
        debug!("aborting {:?} at {:?} with {:?}", id, self.self_id, status);
        let record = st.records.remove(&id);
        st.remember(id, status);
        let timestamp = record.as_ref().map(|r| r.timestamp).unwrap_or_default();
        let mut res = Resolution::new(id, status, timestamp);
        if let Some(record) = record {
            trace!("dropping {:?} held with {:?}", id, record.access);
            match record.role {
                CommitRole::NotYetDetermined | CommitRole::ReadOnly => (),
                CommitRole::RemoteCommit {
                    manager,
                    prepared_sent,
                } => {
                    if !prepared_sent {
                        res.prepared_to = Some(manager);
                    }
                }
                CommitRole::LocalCommit {
                    write_participants,
                    promise,
                    ..
                } => {
                    res.cancel = self.others(write_participants);
                    res.promise = promise;
                }
            }
        }
        res
    }

    /// Resolves a record with `status` without telling any peer; the
    /// transaction was already decided elsewhere.
    fn discharge_record(
        &self,
        st: &mut QueueState,
        id: TransactionId,
        status: TransactionalStatus,
    ) -> Resolution {
        let record = st.records.remove(&id);
        st.remember(id, status);
        let timestamp = record.as_ref().map(|r| r.timestamp).unwrap_or_default();
        let mut res = Resolution::new(id, status, timestamp);
        if let Some(CommitRole::LocalCommit { promise, .. }) = record.map(|r| r.role) {
            res.promise = promise;
        }
        res
    }

    fn commit_record(&self, st: &mut QueueState, id: TransactionId) -> Resolution {
        debug!("committing {:?} at {:?}", id, self.self_id);
        self.discharge_record(st, id, TransactionalStatus::Ok)
    }

    /// If this queue is TM for `id` and has heard enough votes, decides.
    fn try_decide(&self, st: &mut QueueState, id: TransactionId) -> Option<Resolution> {
        let (writers, waiting_for, refusal, agreed) = match st.records.get(&id) {
            Some(ParticipantRecord {
                role:
                    CommitRole::LocalCommit {
                        write_participants,
                        waiting_for,
                        ..
                    },
                votes,
                ..
            }) => (
                write_participants.clone(),
                *waiting_for,
                votes.values().find(|s| !s.is_ok()).cloned(),
                votes.values().filter(|s| s.is_ok()).count(),
            ),
            _ => return None,
        };
        if let Some(status) = refusal {
            return Some(self.abort_record(st, id, status));
        }
        if agreed < waiting_for {
            trace!("{:?} has {}/{} votes", id, agreed, waiting_for);
            return None;
        }
        let mut res = self.commit_record(st, id);
        res.confirm = self.others(writers);
        Some(res)
    }

    fn others(&self, participants: Vec<ParticipantId>) -> Vec<ParticipantId> {
        participants
            .into_iter()
            .filter(|p| *p != self.self_id)
            .collect()
    }

    async fn apply(&self, res: Resolution) {
        self.release(res.id).await;
        let (id, timestamp, status) = (res.id, res.timestamp, res.status);
        if let Some(manager) = res.prepared_to {
            self.send_prepared(manager, id, timestamp, status);
        }
        for p in res.confirm {
            self.registry
                .send_one_way(p, "confirm", move |h| h.confirm(id, timestamp));
        }
        for p in res.cancel {
            self.registry
                .send_one_way(p, "cancel", move |h| h.cancel(id, timestamp, status));
        }
        if let Some(promise) = res.promise {
            let _ = promise.send(status);
        }
    }

    fn spawn_ping_timer(&self, id: TransactionId, timestamp: Timestamp, manager: ParticipantId) {
        let this = self.clone();
        let span = debug_span!("ping-timer", participant=?self.self_id, ?id);
        task::spawn(
            async move {
                loop {
                    task::sleep(this.config.ping_after).await;
                    let waiting = matches!(
                        this.state.lock().await.role(&id),
                        Some(CommitRole::RemoteCommit { .. })
                    );
                    if !waiting {
                        break;
                    }
                    debug!("no confirm or cancel yet, pinging {:?}", manager);
                    let me = this.self_id.clone();
                    this.registry
                        .send_one_way(manager.clone(), "ping", move |tm| tm.ping(id, timestamp, me));
                }
            }
            .instrument(span),
        );
    }

    fn spawn_vote_deadline(&self, id: TransactionId) {
        let this = self.clone();
        let span = debug_span!("vote-deadline", participant=?self.self_id, ?id);
        task::spawn(
            async move {
                task::sleep(this.config.prepare_timeout).await;
                let res = {
                    let mut st = this.state.lock().await;
                    let abandoned = matches!(st.role(&id), Some(CommitRole::NotYetDetermined));
                    if abandoned {
                        debug!("votes for {:?} were never followed by prepare_and_commit", id);
                        Some(this.abort_record(&mut st, id, TransactionalStatus::PrepareTimeout))
                    } else {
                        None
                    }
                };
                if let Some(res) = res {
                    this.apply(res).await;
                }
            }
            .instrument(span),
        );
    }

    async fn prepare_(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        manager: ParticipantId,
        dependencies: Vec<TransactionId>,
    ) -> Result<(), Error> {
        let doomed_by = {
            let mut st = self.state.lock().await;
            if let Some(status) = st.outcome(&id) {
                debug!("prepare for already-resolved {:?}: {:?}", id, status);
                if !status.is_ok() {
                    self.send_prepared(manager, id, timestamp, status);
                }
                return Ok(());
            }
            match st.role(&id) {
                None | Some(CommitRole::NotYetDetermined) => (),
                Some(role) => return Err(self.unexpected(id, "NotYetDetermined", role)),
            }
            st.records.insert(
                id,
                ParticipantRecord::new(access, timestamp, CommitRole::NotYetDetermined),
            );
            st.aborted_dependency(&dependencies)
        };

        let status = self.validate(id, access, doomed_by).await;

        let mut st = self.state.lock().await;
        if !st.records.contains_key(&id) {
            // Resolved while we validated.
            drop(st);
            self.release(id).await;
            return Ok(());
        }
        if let Some(record) = st.records.get_mut(&id) {
            record.role = CommitRole::RemoteCommit {
                manager: manager.clone(),
                prepared_sent: false,
            };
        }
        if !status.is_ok() {
            let res = self.abort_record(&mut st, id, status);
            drop(st);
            self.apply(res).await;
            return Ok(());
        }
        self.clock.merge(timestamp);

        if !access.is_write() {
            // A reader has nothing to confirm; its vote is its last word.
            st.records.remove(&id);
            drop(st);
            self.release(id).await;
            self.send_prepared(manager, id, timestamp, TransactionalStatus::Ok);
            return Ok(());
        }

        record_prepared_sent(&mut st, id);
        drop(st);
        self.send_prepared(manager.clone(), id, timestamp, TransactionalStatus::Ok);
        self.spawn_ping_timer(id, timestamp, manager);
        Ok(())
    }

    async fn prepare_and_commit_(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        write_participants: Vec<ParticipantId>,
        total_participants: usize,
        dependencies: Vec<TransactionId>,
    ) -> Result<TransactionalStatus, Error> {
        let doomed_by = {
            let mut st = self.state.lock().await;
            if let Some(status) = st.outcome(&id) {
                return Ok(status);
            }
            // Votes may have arrived first and parked a record here.
            let record = st.records.entry(id).or_insert_with(|| {
                ParticipantRecord::new(access, timestamp, CommitRole::NotYetDetermined)
            });
            match &record.role {
                CommitRole::NotYetDetermined => {
                    record.access = access;
                    record.timestamp = timestamp;
                }
                role => return Err(self.unexpected(id, "NotYetDetermined", role)),
            }
            st.aborted_dependency(&dependencies)
        };

        let status = self.validate(id, access, doomed_by).await;
        let (promise, mut outcome) = oneshot::channel();

        let res = {
            let mut st = self.state.lock().await;
            if !st.records.contains_key(&id) {
                let status = st.outcome(&id).unwrap_or(TransactionalStatus::PresumedAbort);
                drop(st);
                self.release(id).await;
                return Ok(status);
            }
            if let Some(record) = st.records.get_mut(&id) {
                record.role = CommitRole::LocalCommit {
                    write_participants,
                    waiting_for: total_participants.saturating_sub(1),
                    promise: Some(promise),
                };
            }
            if !status.is_ok() {
                Some(self.abort_record(&mut st, id, status))
            } else {
                self.clock.merge(timestamp);
                self.try_decide(&mut st, id)
            }
        };
        if let Some(res) = res {
            self.apply(res).await;
        }

        let status = match future::timeout(self.config.prepare_timeout, &mut outcome).await {
            Ok(Ok(status)) => status,
            Ok(Err(oneshot::Canceled)) => TransactionalStatus::PresumedAbort,
            Err(_) => {
                debug!("timed out waiting for prepared votes on {:?}", id);
                let res = {
                    let mut st = self.state.lock().await;
                    if st.records.contains_key(&id) {
                        Some(self.abort_record(&mut st, id, TransactionalStatus::PrepareTimeout))
                    } else {
                        None
                    }
                };
                if let Some(res) = res {
                    self.apply(res).await;
                }
                outcome.await.unwrap_or(TransactionalStatus::PresumedAbort)
            }
        };
        Ok(status)
    }

    async fn commit_read_only_(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        dependencies: Vec<TransactionId>,
    ) -> Result<TransactionalStatus, Error> {
        let doomed_by = {
            let mut st = self.state.lock().await;
            if let Some(status) = st.outcome(&id) {
                return Ok(status);
            }
            if let Some(role) = st.role(&id) {
                return Err(self.unexpected(id, "none", role));
            }
            st.records.insert(
                id,
                ParticipantRecord::new(access, timestamp, CommitRole::ReadOnly),
            );
            st.aborted_dependency(&dependencies)
        };

        let status = self.validate(id, access, doomed_by).await;

        let mut st = self.state.lock().await;
        if !st.records.contains_key(&id) {
            let status = st.outcome(&id).unwrap_or(TransactionalStatus::PresumedAbort);
            drop(st);
            self.release(id).await;
            return Ok(status);
        }
        let res = if status.is_ok() {
            self.clock.merge(timestamp);
            self.commit_record(&mut st, id)
        } else {
            self.abort_record(&mut st, id, status)
        };
        drop(st);
        self.apply(res).await;
        Ok(status)
    }

    async fn confirm_(&self, id: TransactionId, timestamp: Timestamp) -> Result<(), Error> {
        let res = {
            let mut st = self.state.lock().await;
            if st.outcome(&id).is_some() {
                trace!("duplicate confirm for {:?}", id);
                return Ok(());
            }
            match st.role(&id) {
                None => {
                    // Nothing held here. A queue that persists prepared
                    // state would look for the durable record to release.
                    trace!("confirm for unknown {:?}", id);
                    return Ok(());
                }
                Some(CommitRole::RemoteCommit { .. }) => (),
                Some(role) => return Err(self.unexpected(id, "RemoteCommit", role)),
            }
            self.commit_record(&mut st, id)
        };
        self.clock.merge(timestamp);
        self.apply(res).await;
        Ok(())
    }

    async fn abort_(&self, id: TransactionId) -> Result<(), Error> {
        let res = {
            let mut st = self.state.lock().await;
            if st.outcome(&id).is_some() {
                return Ok(());
            }
            self.abort_record(&mut st, id, TransactionalStatus::PresumedAbort)
        };
        self.apply(res).await;
        Ok(())
    }

    async fn cancel_(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) -> Result<(), Error> {
        let res = {
            let mut st = self.state.lock().await;
            if st.outcome(&id).is_some() {
                return Ok(());
            }
            // Only a TM has peers left to tell.
            let is_tm = matches!(st.role(&id), Some(CommitRole::LocalCommit { .. }));
            if is_tm {
                self.abort_record(&mut st, id, status)
            } else {
                self.discharge_record(&mut st, id, status)
            }
        };
        self.clock.merge(timestamp);
        self.apply(res).await;
        Ok(())
    }

    async fn prepared_(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        participant: ParticipantId,
        status: TransactionalStatus,
    ) -> Result<(), Error> {
        self.clock.merge(timestamp);
        let (parked, res) = {
            let mut st = self.state.lock().await;
            if st.outcome(&id).is_some() {
                trace!("late vote from {:?} on {:?}", participant, id);
                return Ok(());
            }
            let parked = !st.records.contains_key(&id);
            let record = st.records.entry(id).or_insert_with(|| {
                ParticipantRecord::new(
                    AccessCounter::default(),
                    timestamp,
                    CommitRole::NotYetDetermined,
                )
            });
            match &record.role {
                CommitRole::NotYetDetermined | CommitRole::LocalCommit { .. } => (),
                role => return Err(self.unexpected(id, "LocalCommit", role)),
            }
            record.votes.insert(participant, status);
            (parked, self.try_decide(&mut st, id))
        };
        if parked {
            self.spawn_vote_deadline(id);
        }
        if let Some(res) = res {
            self.apply(res).await;
        }
        Ok(())
    }

    async fn ping_(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        participant: ParticipantId,
    ) -> Result<(), Error> {
        self.clock.merge(timestamp);
        let st = self.state.lock().await;
        match st.outcome(&id) {
            Some(TransactionalStatus::Ok) => {
                self.registry
                    .send_one_way(participant, "confirm", move |h| h.confirm(id, timestamp));
            }
            Some(status) => {
                self.registry.send_one_way(participant, "cancel", move |h| {
                    h.cancel(id, timestamp, status)
                });
            }
            None => match st.role(&id) {
                None => {
                    // Forgotten or never seen. A queue with a durable log
                    // would consult it here before answering.
                    debug!("ping from {:?} for unknown {:?}", participant, id);
                }
                Some(CommitRole::LocalCommit { .. }) | Some(CommitRole::NotYetDetermined) => {
                    trace!("ping from {:?} while still deciding {:?}", participant, id);
                }
                Some(role) => return Err(self.unexpected(id, "LocalCommit", role)),
            },
        }
        Ok(())
    }
}

fn record_prepared_sent(st: &mut QueueState, id: TransactionId) {
    if let Some(ParticipantRecord {
        role: CommitRole::RemoteCommit { prepared_sent, .. },
        ..
    }) = st.records.get_mut(&id)
    {
        *prepared_sent = true;
    }
}

impl<R: ResourceLock> Participant for ParticipantQueue<R> {
    fn prepare(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        manager: ParticipantId,
        dependencies: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let span = debug_span!("prepare", participant=?self.self_id, ?id);
        Box::pin(async move {
            this.prepare_(id, access, timestamp, manager, dependencies)
                .instrument(span)
                .await
        })
    }

    fn prepare_and_commit(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        write_participants: Vec<ParticipantId>,
        total_participants: usize,
        dependencies: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>> {
        let this = self.clone();
        let span = debug_span!("prepare_and_commit", participant=?self.self_id, ?id);
        Box::pin(async move {
            this.prepare_and_commit_(
                id,
                access,
                timestamp,
                write_participants,
                total_participants,
                dependencies,
            )
            .instrument(span)
            .await
        })
    }

    fn commit_read_only(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        dependencies: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>> {
        let this = self.clone();
        let span = debug_span!("commit_read_only", participant=?self.self_id, ?id);
        Box::pin(async move {
            this.commit_read_only_(id, access, timestamp, dependencies)
                .instrument(span)
                .await
        })
    }

    fn confirm(&self, id: TransactionId, timestamp: Timestamp) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let span = debug_span!("confirm", participant=?self.self_id, ?id);
        Box::pin(async move { this.confirm_(id, timestamp).instrument(span).await })
    }

    fn abort(&self, id: TransactionId) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let span = debug_span!("abort", participant=?self.self_id, ?id);
        Box::pin(async move { this.abort_(id).instrument(span).await })
    }

    fn cancel(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let span = debug_span!("cancel", participant=?self.self_id, ?id);
        Box::pin(async move { this.cancel_(id, timestamp, status).instrument(span).await })
    }

    fn prepared(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        participant: ParticipantId,
        status: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let span = debug_span!("prepared", participant=?self.self_id, ?id);
        Box::pin(async move {
            this.prepared_(id, timestamp, participant, status)
                .instrument(span)
                .await
        })
    }

    fn ping(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        participant: ParticipantId,
    ) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        let span = debug_span!("ping", participant=?self.self_id, ?id);
        Box::pin(async move { this.ping_(id, timestamp, participant).instrument(span).await })
    }
}

#[cfg(test)]
fn test_queue(name: &str, history: usize) -> ParticipantQueue<crate::InMemoryLock> {
    ParticipantQueue::new(
        ParticipantId::new(name),
        Arc::new(crate::InMemoryLock::new()),
        Arc::new(CausalClock::new(Box::new(crate::TestClock::new()))),
        ParticipantRegistry::new(),
        QueueConfig::default()
            .with_prepare_timeout(std::time::Duration::from_millis(200))
            .with_resolved_history(history),
    )
}

#[test]
fn test_sole_writer_commits_alone() {
    task::block_on(async {
        let q = test_queue("a", 16);
        let id = TransactionId::new();
        let w = AccessCounter { reads: 1, writes: 1 };
        let status = q
            .prepare_and_commit(id, w, Timestamp(5), vec![q.self_id().clone()], 1, vec![])
            .await;
        assert_eq!(status, Ok(TransactionalStatus::Ok));
        assert_eq!(q.outcome_of(&id).await, Some(TransactionalStatus::Ok));
        assert_eq!(q.pending().await, 0);
        // Asking again answers from memory.
        let again = q
            .prepare_and_commit(id, w, Timestamp(5), vec![q.self_id().clone()], 1, vec![])
            .await;
        assert_eq!(again, Ok(TransactionalStatus::Ok));
    });
}

#[test]
fn test_early_refusal_aborts_tm() {
    task::block_on(async {
        let q = test_queue("a", 16);
        let other = ParticipantId::new("b");
        let id = TransactionId::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        q.prepared(id, Timestamp(3), other.clone(), TransactionalStatus::BrokenLock)
            .await
            .unwrap();
        assert_eq!(q.role_of(&id).await, Some("NotYetDetermined"));
        let status = q
            .prepare_and_commit(id, w, Timestamp(4), vec![q.self_id().clone(), other], 2, vec![])
            .await;
        assert_eq!(status, Ok(TransactionalStatus::BrokenLock));
        assert_eq!(q.role_of(&id).await, None);
    });
}

#[test]
fn test_missing_votes_time_out() {
    task::block_on(async {
        let q = test_queue("a", 16);
        let id = TransactionId::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        let status = q
            .prepare_and_commit(
                id,
                w,
                Timestamp(4),
                vec![q.self_id().clone(), ParticipantId::new("b")],
                2,
                vec![],
            )
            .await;
        assert_eq!(status, Ok(TransactionalStatus::PrepareTimeout));
        // A vote arriving after the decision changes nothing.
        q.prepared(id, Timestamp(9), ParticipantId::new("b"), TransactionalStatus::Ok)
            .await
            .unwrap();
        assert_eq!(q.outcome_of(&id).await, Some(TransactionalStatus::PrepareTimeout));
    });
}

#[test]
fn test_read_only_commit_on_live_record_is_rejected() {
    task::block_on(async {
        let q = test_queue("a", 16);
        let id = TransactionId::new();
        q.prepared(id, Timestamp(1), ParticipantId::new("b"), TransactionalStatus::Ok)
            .await
            .unwrap();
        let r = AccessCounter { reads: 1, writes: 0 };
        match q.commit_read_only(id, r, Timestamp(2), vec![]).await {
            Err(Error::UnexpectedRole { found, .. }) => assert_eq!(found, "NotYetDetermined"),
            other => panic!("unexpected result {:?}", other),
        }
    });
}

#[test]
fn test_resolved_history_is_bounded() {
    task::block_on(async {
        let q = test_queue("a", 2);
        let r = AccessCounter { reads: 1, writes: 0 };
        let ids = vec![TransactionId::new(), TransactionId::new(), TransactionId::new()];
        for id in ids.iter() {
            assert_eq!(
                q.commit_read_only(*id, r, Timestamp(1), vec![]).await,
                Ok(TransactionalStatus::Ok)
            );
        }
        assert_eq!(q.outcome_of(&ids[0]).await, None);
        assert_eq!(q.outcome_of(&ids[2]).await, Some(TransactionalStatus::Ok));
    });
}

#[test]
fn test_confirm_releases_remote_writer() {
    task::block_on(async {
        let q = test_queue("b", 16);
        let id = TransactionId::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        // The TM is not registered; the prepared vote is dropped with a warning.
        q.prepare(id, w, Timestamp(2), ParticipantId::new("a"), vec![])
            .await
            .unwrap();
        assert_eq!(q.role_of(&id).await, Some("RemoteCommit"));
        q.confirm(id, Timestamp(3)).await.unwrap();
        assert_eq!(q.role_of(&id).await, None);
        assert_eq!(q.outcome_of(&id).await, Some(TransactionalStatus::Ok));
        assert_eq!(q.lock.holders().await, 0);
    });
}

#[test]
fn test_aborted_dependency_dooms_dependent() {
    task::block_on(async {
        let q = test_queue("a", 16);
        let r = AccessCounter { reads: 1, writes: 0 };
        let aborted = TransactionId::new();
        q.abort(aborted).await.unwrap();
        let committed = TransactionId::new();
        assert_eq!(
            q.commit_read_only(committed, r, Timestamp(1), vec![]).await,
            Ok(TransactionalStatus::Ok)
        );

        let dependent = TransactionId::new();
        assert_eq!(
            q.commit_read_only(dependent, r, Timestamp(2), vec![committed, aborted])
                .await,
            Ok(TransactionalStatus::CascadingAbort)
        );
        assert_eq!(
            q.outcome_of(&dependent).await,
            Some(TransactionalStatus::CascadingAbort)
        );

        // A committed dependency is no obstacle.
        let fine = TransactionId::new();
        assert_eq!(
            q.commit_read_only(fine, r, Timestamp(3), vec![committed]).await,
            Ok(TransactionalStatus::Ok)
        );
        assert_eq!(q.lock.holders().await, 0);
    });
}

#[test]
fn test_parked_votes_expire_without_prepare_and_commit() {
    task::block_on(async {
        let q = test_queue("a", 16);
        let id = TransactionId::new();
        q.prepared(id, Timestamp(1), ParticipantId::new("b"), TransactionalStatus::Ok)
            .await
            .unwrap();
        assert_eq!(q.role_of(&id).await, Some("NotYetDetermined"));
        task::sleep(std::time::Duration::from_millis(350)).await;
        assert_eq!(q.role_of(&id).await, None);
        assert_eq!(q.outcome_of(&id).await, Some(TransactionalStatus::PrepareTimeout));
        assert_eq!(q.pending().await, 0);
        // The TM call arriving late gets the same answer.
        let w = AccessCounter { reads: 0, writes: 1 };
        assert_eq!(
            q.prepare_and_commit(id, w, Timestamp(2), vec![q.self_id().clone()], 2, vec![])
                .await,
            Ok(TransactionalStatus::PrepareTimeout)
        );
    });
}
