// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The coordinator side of the protocol.
//!
//! A [TransactionAgent] starts transactions and resolves them. Resolution
//! picks one of three paths:
//!
//!   - Explicit abort: every participant is told to abort, and the caller
//!     gets `Ok` back, since rolling back was what it asked for.
//!
//!   - Read-only commit, when no participant saw a write: each participant
//!     validates and releases in a single round of `commit_read_only`.
//!
//!   - Two-phase commit, otherwise: one write participant is made TM and
//!     receives `prepare_and_commit`; everyone else receives a one-way
//!     `prepare` naming the TM and reports to it directly. The agent waits
//!     only for the TM.
//!
//! The agent never retries. A timeout waiting on participants is reported
//! as a status, and cleanup messages sent after a decision are one-way and
//! best-effort: a participant that misses one finds out the outcome through
//! its own ping or timeout.

use crate::{
    AccessCounter, AgentConfig, CausalClock, Clock, Error, NeverOverloaded, OverloadDetector,
    OverloadReason, ParticipantId, ParticipantRegistry, SyncBoxFuture, Timestamp,
    TransactionAgentStatistics, TransactionId, TransactionInfo, TransactionRateDetector,
    TransactionalStatus,
};
use async_std::{future, sync::Arc};
use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use std::time::Duration;
use tracing::{debug, debug_span, instrument, trace, warn, Instrument};

#[derive(Clone)]
pub struct TransactionAgent {
    clock: Arc<CausalClock>,
    registry: ParticipantRegistry,
    overload: Arc<dyn OverloadDetector>,
    stats: Arc<TransactionAgentStatistics>,
    config: AgentConfig,
}

impl TransactionAgent {
    pub fn new(
        clock: Arc<CausalClock>,
        registry: ParticipantRegistry,
        overload: Arc<dyn OverloadDetector>,
        stats: Arc<TransactionAgentStatistics>,
        config: AgentConfig,
    ) -> Self {
        TransactionAgent {
            clock,
            registry,
            overload,
            stats,
            config,
        }
    }

    /// Builds an agent whose load shedding follows `config.load_shedding`,
    /// measuring start rates against `wall`.
    pub fn from_config(
        clock: Arc<CausalClock>,
        wall: Arc<dyn Clock>,
        registry: ParticipantRegistry,
        config: AgentConfig,
    ) -> Self {
        let stats = Arc::new(TransactionAgentStatistics::new());
        let overload: Arc<dyn OverloadDetector> = if config.load_shedding.enabled {
            Arc::new(TransactionRateDetector::new(
                stats.clone(),
                config.load_shedding.clone(),
                wall,
            ))
        } else {
            Arc::new(NeverOverloaded)
        };
        TransactionAgent::new(clock, registry, overload, stats, config)
    }

    pub fn statistics(&self) -> Arc<TransactionAgentStatistics> {
        self.stats.clone()
    }

    pub fn clock(&self) -> Arc<CausalClock> {
        self.clock.clone()
    }

    /// Begins a transaction attempt. Refuses, with no other effect than
    /// counting the refusal, while the overload detector reports
    /// saturation. `timeout` travels with the transaction for the call
    /// fabric to enforce.
    #[instrument(skip(self))]
    pub fn start_transaction(
        &self,
        read_only: bool,
        timeout: Duration,
    ) -> Result<TransactionInfo, Error> {
        if self.overload.is_overloaded() {
            self.stats.track_throttled();
            debug!("refusing to start transaction: overloaded");
            return Err(Error::StartTransactionFailed(OverloadReason::Overload));
        }
        let info = TransactionInfo::new(TransactionId::new(), self.clock.now(), read_only, timeout);
        self.stats.track_start();
        trace!("started {:?} at {:?}", info.id, info.timestamp);
        Ok(info)
    }

    /// Commits `info`, or aborts it if `abort` is set. `Ok(status)` is the
    /// protocol outcome; `Err` means the attempt failed underneath the
    /// protocol and the outcome at the participants is unknown.
    pub fn resolve_transaction(
        &self,
        info: TransactionInfo,
        abort: bool,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>> {
        let this = self.clone();
        let span = debug_span!("resolve", id=?info.id, abort);
        Box::pin(async move { this.resolve_transaction_(info, abort).instrument(span).await })
    }

    async fn resolve_transaction_(
        &self,
        info: TransactionInfo,
        abort: bool,
    ) -> Result<TransactionalStatus, Error> {
        if abort {
            self.abort_all(&info).await;
            self.stats.track_failure();
            return Ok(TransactionalStatus::Ok);
        }
        if let Some(status) = info.failure {
            debug!("transaction already failed with {:?}", status);
            self.abort_all(&info).await;
            self.stats.track_failure();
            return Ok(status);
        }
        match self.commit(&info).await {
            Ok(status) => {
                if status.is_ok() {
                    self.stats.track_success();
                } else {
                    self.stats.track_failure();
                }
                debug!("resolved with {:?}", status);
                Ok(status)
            }
            Err(e) => {
                warn!("commit failed: {}", e);
                self.stats.track_failure();
                Err(e)
            }
        }
    }

    /// Tells every participant to abort and waits for all of them. Failures
    /// are logged and otherwise ignored.
    async fn abort_all(&self, info: &TransactionInfo) {
        let id = info.id;
        let calls = info.participants.keys().map(|p| {
            let registry = self.registry.clone();
            let p = p.clone();
            async move {
                let handle = registry.resolve(&p).await?;
                handle.abort(id).await
            }
        });
        let results = join_all(calls).await;
        for (p, res) in info.participants.keys().zip(results) {
            if let Err(e) = res {
                warn!("abort to {:?} failed: {}", p, e);
            }
        }
    }

    fn abort_all_one_way(&self, info: &TransactionInfo) {
        let id = info.id;
        for p in info.participants.keys() {
            self.registry
                .send_one_way(p.clone(), "abort", move |h| h.abort(id));
        }
    }

    async fn commit(&self, info: &TransactionInfo) -> Result<TransactionalStatus, Error> {
        if info.participants.is_empty() {
            return Ok(TransactionalStatus::Ok);
        }
        let timestamp = self.clock.merge_now(info.timestamp);
        let writers = info.write_participants();
        if writers.is_empty() {
            self.commit_read_only(info, timestamp).await
        } else {
            self.commit_two_phase(info, timestamp, writers).await
        }
    }

    async fn commit_read_only(
        &self,
        info: &TransactionInfo,
        timestamp: Timestamp,
    ) -> Result<TransactionalStatus, Error> {
        let id = info.id;
        let dependencies = info.dependency_list();
        let calls: FuturesUnordered<_> = info
            .participants
            .iter()
            .map(|(p, access)| {
                let registry = self.registry.clone();
                let (p, access, dependencies) = (p.clone(), *access, dependencies.clone());
                async move {
                    let handle = registry.resolve(&p).await?;
                    handle
                        .commit_read_only(id, access, timestamp, dependencies)
                        .await
                }
            })
            .collect();
        let all = calls.collect::<Vec<_>>();
        let outcome = match future::timeout(self.config.response_timeout, all).await {
            Err(_) => Ok(TransactionalStatus::ParticipantResponseTimeout),
            Ok(results) => {
                // The first thing that isn't a plain Ok decides.
                let mut outcome = Ok(TransactionalStatus::Ok);
                for res in results {
                    if outcome == Ok(TransactionalStatus::Ok) {
                        outcome = res;
                    }
                }
                outcome
            }
        };
        match &outcome {
            Ok(TransactionalStatus::Ok) => (),
            other => {
                debug!("read-only commit failed with {:?}, aborting participants", other);
                self.abort_all_one_way(info);
            }
        }
        outcome
    }

    fn choose_tm(&self, info: &TransactionInfo, writers: &[ParticipantId]) -> Option<ParticipantId> {
        match &info.tm_candidate {
            Some(candidate) if writers.contains(candidate) => Some(candidate.clone()),
            _ => writers.first().cloned(),
        }
    }

    #[instrument(skip(self, info))]
    async fn commit_two_phase(
        &self,
        info: &TransactionInfo,
        timestamp: Timestamp,
        writers: Vec<ParticipantId>,
    ) -> Result<TransactionalStatus, Error> {
        let id = info.id;
        let tm = match self.choose_tm(info, &writers) {
            Some(tm) => tm,
            None => return Ok(TransactionalStatus::Ok),
        };
        debug!("{:?} is TM for {} participants", tm, info.participant_count());
        let dependencies = info.dependency_list();

        for (p, access) in info.participants.iter().filter(|(p, _)| **p != tm) {
            let (access, manager, dependencies) = (*access, tm.clone(), dependencies.clone());
            self.registry.send_one_way(p.clone(), "prepare", move |h| {
                h.prepare(id, access, timestamp, manager, dependencies)
            });
        }

        let access: AccessCounter = info.participants.get(&tm).copied().unwrap_or_default();
        let registry = self.registry.clone();
        let (manager, write_participants) = (tm.clone(), writers.clone());
        let total = info.participant_count();
        let call = async move {
            let handle = registry.resolve(&manager).await?;
            handle
                .prepare_and_commit(id, access, timestamp, write_participants, total, dependencies)
                .await
        };
        let status = match future::timeout(self.config.response_timeout, call).await {
            Err(_) => {
                warn!("no decision from TM {:?}", tm);
                return Ok(TransactionalStatus::TMResponseTimeout);
            }
            Ok(res) => res?,
        };

        if status.is_definitely_aborted() {
            for p in writers.into_iter().filter(|p| *p != tm) {
                self.registry
                    .send_one_way(p, "cancel", move |h| h.cancel(id, timestamp, status));
            }
        }
        Ok(status)
    }
}

#[test]
fn test_empty_transaction_commits() {
    async_std::task::block_on(async {
        let agent = TransactionAgent::from_config(
            Arc::new(CausalClock::new(Box::new(crate::TestClock::new()))),
            Arc::new(crate::TestClock::new()),
            ParticipantRegistry::new(),
            AgentConfig::default(),
        );
        let info = agent.start_transaction(false, Duration::from_secs(1)).unwrap();
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::Ok));
        let snap = agent.statistics().snapshot();
        assert_eq!((snap.started, snap.succeeded, snap.failed), (1, 1, 0));
    });
}

#[test]
fn test_unreachable_tm_is_an_error() {
    async_std::task::block_on(async {
        let agent = TransactionAgent::from_config(
            Arc::new(CausalClock::new(Box::new(crate::TestClock::new()))),
            Arc::new(crate::TestClock::new()),
            ParticipantRegistry::new(),
            AgentConfig::default(),
        );
        let mut info = agent.start_transaction(false, Duration::from_secs(1)).unwrap();
        let p = ParticipantId::new("gone");
        info.record_write(p.clone(), Timestamp(1)).unwrap();
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Err(Error::UnknownParticipant(p)));
        assert_eq!(agent.statistics().snapshot().failed, 1);
    });
}
