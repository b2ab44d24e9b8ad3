// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The remote surface every transactional resource exposes, and the registry
//! that maps a [ParticipantId] to a handle implementing it.
//!
//! Calls on a [Participant] come in two flavours. Calls that return a
//! [TransactionalStatus] are awaited by the caller. The rest are *one-way*:
//! the caller submits them with [send_one_way] and moves on, and a failure
//! reported by the underlying transport is logged and dropped. The protocol
//! never blocks commit latency on best-effort cleanup; a participant that
//! misses a one-way message discovers the outcome through its own timeout.

use crate::{
    AccessCounter, Error, ParticipantId, SyncBoxFuture, Timestamp, TransactionId,
    TransactionalStatus,
};
use async_std::{
    sync::{Arc, RwLock},
    task,
};
use futures::Future;
use std::collections::HashMap;
use tracing::{trace, warn, Instrument, Span};

/// A transactional resource as seen by coordinators and by other resources.
///
/// An `Err` from any of these means the call did not get through (or the
/// callee hit an internal error); protocol outcomes come back as `Ok(status)`.
pub trait Participant: Send + Sync + 'static {
    /// Phase one at a non-TM participant. One-way; the answer travels back
    /// to `manager` as a `prepared` call.
    ///
    /// `dependencies` are the transactions whose uncommitted writes this
    /// one observed. A participant that knows any of them aborted refuses
    /// with `CascadingAbort`; the same holds for the two calls below.
    fn prepare(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        manager: ParticipantId,
        dependencies: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<(), Error>>;

    /// Sent to the participant chosen as TM. Resolves once the TM has
    /// decided the transaction.
    fn prepare_and_commit(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        write_participants: Vec<ParticipantId>,
        total_participants: usize,
        dependencies: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>>;

    /// Single-round commit for transactions with no write participants.
    fn commit_read_only(
        &self,
        id: TransactionId,
        access: AccessCounter,
        timestamp: Timestamp,
        dependencies: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>>;

    /// Sent by the TM to a prepared write participant once committed.
    fn confirm(&self, id: TransactionId, timestamp: Timestamp) -> SyncBoxFuture<Result<(), Error>>;

    /// Caller-initiated abort before any prepare decision.
    fn abort(&self, id: TransactionId) -> SyncBoxFuture<Result<(), Error>>;

    /// The transaction aborted with `status`; unwind without replying.
    fn cancel(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>>;

    /// A participant's answer to `prepare`, delivered to the TM.
    fn prepared(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        participant: ParticipantId,
        status: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>>;

    /// Liveness check from a prepared participant to its TM.
    fn ping(
        &self,
        id: TransactionId,
        timestamp: Timestamp,
        participant: ParticipantId,
    ) -> SyncBoxFuture<Result<(), Error>>;
}

/// Explicit lookup table from resource id to participant handle. Cloning
/// the registry clones a handle to the same table.
#[derive(Clone, Default)]
pub struct ParticipantRegistry {
    handles: Arc<RwLock<HashMap<ParticipantId, Arc<dyn Participant>>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        ParticipantRegistry::default()
    }

    pub async fn register(&self, id: ParticipantId, handle: Arc<dyn Participant>) {
        trace!("registering participant {:?}", id);
        self.handles.write().await.insert(id, handle);
    }

    pub async fn unregister(&self, id: &ParticipantId) -> Option<Arc<dyn Participant>> {
        self.handles.write().await.remove(id)
    }

    pub async fn resolve(&self, id: &ParticipantId) -> Result<Arc<dyn Participant>, Error> {
        match self.handles.read().await.get(id) {
            None => Err(Error::UnknownParticipant(id.clone())),
            Some(handle) => Ok(handle.clone()),
        }
    }

    /// Resolves `target` and submits the call built by `call` as a one-way
    /// message. Lookup failures are logged the same way as transport
    /// failures; nothing is returned to the sender.
    pub(crate) fn send_one_way<F>(&self, target: ParticipantId, what: &'static str, call: F)
    where
        F: FnOnce(Arc<dyn Participant>) -> SyncBoxFuture<Result<(), Error>> + Send + 'static,
    {
        let registry = self.clone();
        send_one_way(what, target.clone(), async move {
            let handle = registry.resolve(&target).await?;
            call(handle).await
        });
    }
}

/// Submits `fut` without awaiting it. An error it eventually reports is
/// logged at `warn` and never propagated.
pub(crate) fn send_one_way<F>(what: &'static str, target: ParticipantId, fut: F)
where
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    let span = Span::current();
    task::spawn(
        async move {
            if let Err(e) = fut.await {
                warn!("one-way {} to {:?} failed: {}", what, target, e);
            }
        }
        .instrument(span),
    );
}

#[test]
fn test_resolve_unknown_participant() {
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let id = ParticipantId::new("nobody");
        match registry.resolve(&id).await {
            Err(e) => assert_eq!(e, Error::UnknownParticipant(id)),
            Ok(_) => panic!("resolved an unregistered participant"),
        }
    });
}
