// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use synallagma::{
    AccessCounter, AgentConfig, CausalClock, Error, IdGeneratorConfig, InMemoryIdStorage,
    InMemoryLeaseProvider, InMemoryLock, OverloadDetector, OverloadReason, Participant,
    ParticipantId, ParticipantQueue, ParticipantRegistry, QueueConfig, ResourceLock, SyncBoxFuture,
    TestClock, Timestamp, TransactionAgent, TransactionAgentStatistics, TransactionId,
    TransactionIdGenerator, TransactionalStatus,
};

use async_std::{
    sync::{Arc, Mutex},
    task,
};
use std::{collections::BTreeSet, time::Duration};
use tracing::info;

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

// A participant that answers every awaited call with a fixed status,
// optionally after a delay, and remembers what it was asked.
#[derive(Clone)]
struct Scripted {
    id: ParticipantId,
    calls: Arc<Mutex<Vec<&'static str>>>,
    answer: TransactionalStatus,
    delay: Duration,
}

impl Scripted {
    fn new(name: &str) -> Self {
        Scripted {
            id: ParticipantId::new(name),
            calls: Arc::new(Mutex::new(Vec::new())),
            answer: TransactionalStatus::Ok,
            delay: Duration::from_millis(0),
        }
    }

    fn answering(mut self, answer: TransactionalStatus) -> Self {
        self.answer = answer;
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn count(&self, what: &str) -> usize {
        self.calls.lock().await.iter().filter(|c| **c == what).count()
    }

    async fn register(&self, registry: &ParticipantRegistry) {
        registry.register(self.id.clone(), Arc::new(self.clone())).await;
    }

    fn answer(&self, what: &'static str) -> SyncBoxFuture<Result<TransactionalStatus, Error>> {
        let this = self.clone();
        Box::pin(async move {
            this.calls.lock().await.push(what);
            task::sleep(this.delay).await;
            Ok(this.answer)
        })
    }

    fn note(&self, what: &'static str) -> SyncBoxFuture<Result<(), Error>> {
        let this = self.clone();
        Box::pin(async move {
            this.calls.lock().await.push(what);
            Ok(())
        })
    }
}

impl Participant for Scripted {
    fn prepare(
        &self,
        _: TransactionId,
        _: AccessCounter,
        _: Timestamp,
        _: ParticipantId,
        _: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<(), Error>> {
        self.note("prepare")
    }
    fn prepare_and_commit(
        &self,
        _: TransactionId,
        _: AccessCounter,
        _: Timestamp,
        _: Vec<ParticipantId>,
        _: usize,
        _: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>> {
        self.answer("prepare_and_commit")
    }
    fn commit_read_only(
        &self,
        _: TransactionId,
        _: AccessCounter,
        _: Timestamp,
        _: Vec<TransactionId>,
    ) -> SyncBoxFuture<Result<TransactionalStatus, Error>> {
        self.answer("commit_read_only")
    }
    fn confirm(&self, _: TransactionId, _: Timestamp) -> SyncBoxFuture<Result<(), Error>> {
        self.note("confirm")
    }
    fn abort(&self, _: TransactionId) -> SyncBoxFuture<Result<(), Error>> {
        self.note("abort")
    }
    fn cancel(
        &self,
        _: TransactionId,
        _: Timestamp,
        _: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>> {
        self.note("cancel")
    }
    fn prepared(
        &self,
        _: TransactionId,
        _: Timestamp,
        _: ParticipantId,
        _: TransactionalStatus,
    ) -> SyncBoxFuture<Result<(), Error>> {
        self.note("prepared")
    }
    fn ping(
        &self,
        _: TransactionId,
        _: Timestamp,
        _: ParticipantId,
    ) -> SyncBoxFuture<Result<(), Error>> {
        self.note("ping")
    }
}

struct AlwaysOverloaded;
impl OverloadDetector for AlwaysOverloaded {
    fn is_overloaded(&self) -> bool {
        true
    }
}

fn mk_clock() -> Arc<CausalClock> {
    Arc::new(CausalClock::new(Box::new(TestClock::new())))
}

fn mk_agent(registry: &ParticipantRegistry, config: AgentConfig) -> TransactionAgent {
    TransactionAgent::from_config(
        mk_clock(),
        Arc::new(TestClock::new()),
        registry.clone(),
        config,
    )
}

async fn mk_queue(
    name: &str,
    registry: &ParticipantRegistry,
    config: QueueConfig,
) -> (ParticipantQueue<InMemoryLock>, Arc<InMemoryLock>) {
    let lock = Arc::new(InMemoryLock::new());
    let queue = ParticipantQueue::new(
        ParticipantId::new(name),
        lock.clone(),
        mk_clock(),
        registry.clone(),
        config,
    );
    registry
        .register(queue.self_id().clone(), Arc::new(queue.clone()))
        .await;
    (queue, lock)
}

// Lets one-way messages land.
async fn settle() {
    task::sleep(Duration::from_millis(50)).await;
}

pub fn read_only_fast_path_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let readers = vec![Scripted::new("r1"), Scripted::new("r2"), Scripted::new("r3")];
        for r in readers.iter() {
            r.register(&registry).await;
        }
        let agent = mk_agent(&registry, AgentConfig::default());
        let mut info = agent.start_transaction(true, Duration::from_secs(5)).unwrap();
        for r in readers.iter() {
            info.record_read(r.id.clone(), Timestamp(1));
        }
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::Ok));
        settle().await;
        for r in readers.iter() {
            assert_eq!(r.count("commit_read_only").await, 1);
            assert_eq!(r.count("prepare").await, 0);
            assert_eq!(r.count("prepare_and_commit").await, 0);
            assert_eq!(r.count("abort").await, 0);
        }
        assert_eq!(agent.statistics().snapshot().succeeded, 1);
    });
}

pub fn read_only_refusal_and_timeout_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let fine = Scripted::new("fine");
        let broken = Scripted::new("broken").answering(TransactionalStatus::BrokenLock);
        let slow = Scripted::new("slow").delayed(Duration::from_millis(500));
        for p in [&fine, &broken, &slow].iter() {
            p.register(&registry).await;
        }
        let config = AgentConfig::default().with_response_timeout(Duration::from_millis(100));
        let agent = mk_agent(&registry, config);

        let mut info = agent.start_transaction(true, Duration::from_secs(5)).unwrap();
        info.record_read(fine.id.clone(), Timestamp(1));
        info.record_read(broken.id.clone(), Timestamp(1));
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::BrokenLock));

        let mut info = agent.start_transaction(true, Duration::from_secs(5)).unwrap();
        info.record_read(fine.id.clone(), Timestamp(1));
        info.record_read(slow.id.clone(), Timestamp(1));
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::ParticipantResponseTimeout));

        settle().await;
        assert_eq!(fine.count("abort").await, 2);
        assert_eq!(broken.count("abort").await, 1);
        assert_eq!(slow.count("abort").await, 1);
        assert_eq!(agent.statistics().snapshot().failed, 2);
    });
}

pub fn overload_shedding_test() {
    setup_tracing_subscriber();
    let clock = TestClock::frozen();
    clock.set_millis(1_000);
    let causal = Arc::new(CausalClock::new(Box::new(clock)));
    let stats = Arc::new(TransactionAgentStatistics::new());
    let agent = TransactionAgent::new(
        causal.clone(),
        ParticipantRegistry::new(),
        Arc::new(AlwaysOverloaded),
        stats.clone(),
        AgentConfig::default(),
    );
    let before = causal.now();
    match agent.start_transaction(false, Duration::from_secs(1)) {
        Err(e) => assert_eq!(e, Error::StartTransactionFailed(OverloadReason::Overload)),
        Ok(info) => panic!("started {:?} while overloaded", info.id),
    }
    // Nothing was drawn from the clock in between.
    assert_eq!(causal.now(), before.next());
    let snap = stats.snapshot();
    assert_eq!(snap.throttled, 1);
    assert_eq!(snap.started, 0);
}

pub fn explicit_abort_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let a = Scripted::new("a");
        let b = Scripted::new("b");
        a.register(&registry).await;
        b.register(&registry).await;
        let agent = mk_agent(&registry, AgentConfig::default());
        let mut info = agent.start_transaction(false, Duration::from_secs(1)).unwrap();
        info.record_write(a.id.clone(), Timestamp(1)).unwrap();
        info.record_read(b.id.clone(), Timestamp(1));
        // An unreachable participant does not change the answer.
        info.record_read(ParticipantId::new("gone"), Timestamp(1));
        let status = agent.resolve_transaction(info, true).await;
        assert_eq!(status, Ok(TransactionalStatus::Ok));
        assert_eq!(a.count("abort").await, 1);
        assert_eq!(b.count("abort").await, 1);
        assert_eq!(a.count("prepare_and_commit").await, 0);
        let snap = agent.statistics().snapshot();
        assert_eq!((snap.succeeded, snap.failed), (0, 1));
    });
}

pub fn cascading_cancel_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let w1 = Scripted::new("w1").answering(TransactionalStatus::CascadingAbort);
        let w2 = Scripted::new("w2");
        let w3 = Scripted::new("w3");
        let r = Scripted::new("r");
        for p in [&w1, &w2, &w3, &r].iter() {
            p.register(&registry).await;
        }
        let agent = mk_agent(&registry, AgentConfig::default());
        let mut info = agent.start_transaction(false, Duration::from_secs(1)).unwrap();
        for w in [&w1, &w2, &w3].iter() {
            info.record_write(w.id.clone(), Timestamp(1)).unwrap();
        }
        info.record_read(r.id.clone(), Timestamp(1));
        info.set_tm_candidate(w1.id.clone());
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::CascadingAbort));
        settle().await;
        assert_eq!(w1.count("prepare_and_commit").await, 1);
        assert_eq!(w1.count("cancel").await, 0);
        assert_eq!(w2.count("cancel").await, 1);
        assert_eq!(w3.count("cancel").await, 1);
        assert_eq!(r.count("cancel").await, 0);
        // Everyone but the TM was told to prepare, readers included.
        assert_eq!(w1.count("prepare").await, 0);
        assert_eq!(w2.count("prepare").await, 1);
        assert_eq!(r.count("prepare").await, 1);
    });
}

pub fn tm_timeout_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let tm = Scripted::new("a").delayed(Duration::from_millis(500));
        let other = Scripted::new("b");
        tm.register(&registry).await;
        other.register(&registry).await;
        let config = AgentConfig::default().with_response_timeout(Duration::from_millis(100));
        let agent = mk_agent(&registry, config);
        let mut info = agent.start_transaction(false, Duration::from_secs(1)).unwrap();
        info.record_write(tm.id.clone(), Timestamp(1)).unwrap();
        info.record_write(other.id.clone(), Timestamp(1)).unwrap();
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::TMResponseTimeout));
        settle().await;
        assert_eq!(other.count("prepare").await, 1);
        assert_eq!(other.count("cancel").await, 0);
        assert_eq!(other.count("abort").await, 0);
    });
}

pub fn end_to_end_commit_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let (p1, lock1) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let (p2, lock2) = mk_queue("p2", &registry, QueueConfig::default()).await;
        let agent = mk_agent(&registry, AgentConfig::default());

        let mut info = agent.start_transaction(false, Duration::from_secs(5)).unwrap();
        let id = info.id;
        let ts = info.timestamp;
        info.record_read(p1.self_id().clone(), ts);
        info.record_write(p1.self_id().clone(), ts).unwrap();
        info.record_write(p2.self_id().clone(), ts).unwrap();
        info.set_tm_candidate(p1.self_id().clone());

        let before = agent.statistics().snapshot().succeeded;
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::Ok));
        assert_eq!(agent.statistics().snapshot().succeeded, before + 1);

        settle().await;
        assert_eq!(p1.outcome_of(&id).await, Some(TransactionalStatus::Ok));
        assert_eq!(p2.outcome_of(&id).await, Some(TransactionalStatus::Ok));
        assert_eq!(p1.pending().await, 0);
        assert_eq!(p2.pending().await, 0);
        assert_eq!(lock1.holders().await, 0);
        assert_eq!(lock2.holders().await, 0);
        info!("committed {:?}", id);
    });
}

pub fn lock_conflict_is_final_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let (p1, lock1) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let agent = mk_agent(&registry, AgentConfig::default());
        let w = AccessCounter { reads: 0, writes: 1 };

        // Someone else is writing p1.
        let blocker = TransactionId::new();
        assert_eq!(
            lock1.enter(blocker, w, Duration::from_millis(1)).await,
            TransactionalStatus::Ok
        );

        let mut info = agent.start_transaction(false, Duration::from_secs(5)).unwrap();
        let id = info.id;
        info.record_write(p1.self_id().clone(), info.timestamp).unwrap();
        let status = agent.resolve_transaction(info, false).await;
        assert_eq!(status, Ok(TransactionalStatus::LockValidationFailed));

        // Once decided, nothing later changes the outcome here.
        lock1.release(blocker).await;
        let again = p1
            .prepare_and_commit(id, w, Timestamp(9), vec![p1.self_id().clone()], 1, vec![])
            .await;
        assert_eq!(again, Ok(TransactionalStatus::LockValidationFailed));
        p1.confirm(id, Timestamp(10)).await.unwrap();
        assert_eq!(
            p1.outcome_of(&id).await,
            Some(TransactionalStatus::LockValidationFailed)
        );
    });
}

pub fn at_most_one_decision_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let (p1, lock1) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let agent = mk_agent(&registry, AgentConfig::default());
        let mut info = agent.start_transaction(false, Duration::from_secs(5)).unwrap();
        let id = info.id;
        let ts = info.timestamp;
        info.record_write(p1.self_id().clone(), ts).unwrap();
        let access = info.participants[p1.self_id()];
        assert_eq!(
            agent.resolve_transaction(info, false).await,
            Ok(TransactionalStatus::Ok)
        );

        p1.cancel(id, ts, TransactionalStatus::BrokenLock).await.unwrap();
        p1.abort(id).await.unwrap();
        p1.prepared(id, ts, ParticipantId::new("x"), TransactionalStatus::StorageConflict)
            .await
            .unwrap();
        assert_eq!(
            p1.commit_read_only(id, access, ts, vec![]).await,
            Ok(TransactionalStatus::Ok)
        );
        assert_eq!(p1.outcome_of(&id).await, Some(TransactionalStatus::Ok));
        assert_eq!(lock1.holders().await, 0);
    });
}

pub fn ping_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let tm = Scripted::new("tm");
        tm.register(&registry).await;
        let config = QueueConfig::default().with_ping_after(Duration::from_millis(20));
        let (p2, lock2) = mk_queue("p2", &registry, config).await;

        // A prepared writer that hears nothing pings its TM.
        let id = TransactionId::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        p2.prepare(id, w, Timestamp(5), tm.id.clone(), vec![])
            .await
            .unwrap();
        task::sleep(Duration::from_millis(80)).await;
        assert_eq!(tm.count("prepared").await, 1);
        assert!(tm.count("ping").await >= 1);
        assert_eq!(p2.role_of(&id).await, Some("RemoteCommit"));
        p2.cancel(id, Timestamp(6), TransactionalStatus::PrepareTimeout)
            .await
            .unwrap();
        assert_eq!(p2.role_of(&id).await, None);
        assert_eq!(lock2.holders().await, 0);

        // A TM that has decided answers a ping with the decision.
        let (p1, _) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let committed = TransactionId::new();
        assert_eq!(
            p1.prepare_and_commit(committed, w, Timestamp(7), vec![p1.self_id().clone()], 1, vec![])
                .await,
            Ok(TransactionalStatus::Ok)
        );
        p1.ping(committed, Timestamp(8), tm.id.clone()).await.unwrap();
        let aborted = TransactionId::new();
        p1.abort(aborted).await.unwrap();
        p1.ping(aborted, Timestamp(8), tm.id.clone()).await.unwrap();
        settle().await;
        assert_eq!(tm.count("confirm").await, 1);
        assert_eq!(tm.count("cancel").await, 1);
    });
}

pub fn id_churn_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let provider = InMemoryLeaseProvider::new(Arc::new(TestClock::frozen()));
        let leases = Arc::new(provider.clone());
        let storage = Arc::new(InMemoryIdStorage::new());
        let config = IdGeneratorConfig::default()
            .with_batch_size(10)
            .with_lease_duration(Duration::from_millis(40));

        let a = TransactionIdGenerator::start("a", config.clone(), leases.clone(), storage.clone())
            .await
            .unwrap();
        let mut served_a = a.next_ids(15).await.unwrap();

        // A loses its lease mid-bucket; B takes over.
        provider.revoke(&config.lease_key).await;
        let b = TransactionIdGenerator::start("b", config.clone(), leases, storage)
            .await
            .unwrap();
        let mut served_b = b.next_ids(5).await.unwrap();

        // Until A notices, it may keep serving what it already owns.
        for _ in 0..3 {
            if let Ok(id) = a.next_id().await {
                served_a.push(id);
            }
        }
        task::sleep(Duration::from_millis(60)).await;
        assert!(!a.is_valid());
        assert_eq!(a.next_id().await, Err(Error::GeneratorUnavailable));
        served_b.extend(b.next_ids(25).await.unwrap());
        assert!(b.is_valid());

        let mut all = BTreeSet::new();
        for id in served_a.iter().chain(served_b.iter()) {
            assert!(all.insert(*id), "id {} served twice", id);
        }
        let max_a = served_a.iter().max().copied().unwrap_or(0);
        let min_b = served_b.iter().min().copied().unwrap_or(0);
        assert!(max_a < min_b);
        b.dispose().await;
    });
}

pub fn abandoned_tm_unwinds_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let config = QueueConfig::default()
            .with_ping_after(Duration::from_millis(20))
            .with_prepare_timeout(Duration::from_millis(50));
        let (tm, _) = mk_queue("tm", &registry, config.clone()).await;
        let (p2, lock2) = mk_queue("p2", &registry, config).await;

        // p2 prepares and votes, but the TM's own prepare_and_commit is lost.
        let id = TransactionId::new();
        let w = AccessCounter { reads: 0, writes: 1 };
        p2.prepare(id, w, Timestamp(5), tm.self_id().clone(), vec![])
            .await
            .unwrap();
        assert_eq!(p2.role_of(&id).await, Some("RemoteCommit"));
        task::sleep(Duration::from_millis(300)).await;

        assert_eq!(tm.outcome_of(&id).await, Some(TransactionalStatus::PrepareTimeout));
        assert_eq!(tm.pending().await, 0);
        assert_eq!(p2.role_of(&id).await, None);
        assert_eq!(p2.outcome_of(&id).await, Some(TransactionalStatus::PrepareTimeout));
        assert_eq!(lock2.holders().await, 0);
        let next = TransactionId::new();
        assert_eq!(
            lock2.enter(next, w, Duration::from_millis(1)).await,
            TransactionalStatus::Ok
        );
    });
}

pub fn cascading_abort_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let (p1, lock1) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let (p2, lock2) = mk_queue("p2", &registry, QueueConfig::default()).await;
        let agent = mk_agent(&registry, AgentConfig::default());
        let w = AccessCounter { reads: 0, writes: 1 };

        // The first transaction loses a write conflict at p1.
        let blocker = TransactionId::new();
        assert_eq!(
            lock1.enter(blocker, w, Duration::from_millis(1)).await,
            TransactionalStatus::Ok
        );
        let mut first = agent.start_transaction(false, Duration::from_secs(5)).unwrap();
        let first_id = first.id;
        first.record_write(p1.self_id().clone(), first.timestamp).unwrap();
        assert_eq!(
            agent.resolve_transaction(first, false).await,
            Ok(TransactionalStatus::LockValidationFailed)
        );
        lock1.release(blocker).await;

        // A transaction that read its writes is doomed, even though only p1
        // knows and p2 is TM.
        let mut second = agent.start_transaction(false, Duration::from_secs(5)).unwrap();
        let second_id = second.id;
        let ts = second.timestamp;
        second.record_write(p1.self_id().clone(), ts).unwrap();
        second.record_write(p2.self_id().clone(), ts).unwrap();
        second.set_tm_candidate(p2.self_id().clone());
        second.record_dependency(first_id);
        assert_eq!(
            agent.resolve_transaction(second, false).await,
            Ok(TransactionalStatus::CascadingAbort)
        );
        settle().await;
        assert_eq!(
            p1.outcome_of(&second_id).await,
            Some(TransactionalStatus::CascadingAbort)
        );
        assert_eq!(
            p2.outcome_of(&second_id).await,
            Some(TransactionalStatus::CascadingAbort)
        );
        assert_eq!(lock1.holders().await, 0);
        assert_eq!(lock2.holders().await, 0);

        // Read-only dependents are refused the same way.
        let mut third = agent.start_transaction(true, Duration::from_secs(5)).unwrap();
        third.record_read(p1.self_id().clone(), third.timestamp);
        third.record_dependency(first_id);
        assert_eq!(
            agent.resolve_transaction(third, false).await,
            Ok(TransactionalStatus::CascadingAbort)
        );
        let snap = agent.statistics().snapshot();
        assert_eq!((snap.succeeded, snap.failed), (0, 3));
    });
}

pub fn remote_refusal_aborts_tm_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let (p1, lock1) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let (p2, lock2) = mk_queue("p2", &registry, QueueConfig::default()).await;
        let agent = mk_agent(&registry, AgentConfig::default());
        let w = AccessCounter { reads: 0, writes: 1 };

        // p2 is held by someone else, so its vote is a refusal.
        let blocker = TransactionId::new();
        assert_eq!(
            lock2.enter(blocker, w, Duration::from_millis(1)).await,
            TransactionalStatus::Ok
        );
        let mut info = agent.start_transaction(false, Duration::from_secs(5)).unwrap();
        let id = info.id;
        info.record_write(p1.self_id().clone(), info.timestamp).unwrap();
        info.record_write(p2.self_id().clone(), info.timestamp).unwrap();
        info.set_tm_candidate(p1.self_id().clone());
        assert_eq!(
            agent.resolve_transaction(info, false).await,
            Ok(TransactionalStatus::LockValidationFailed)
        );
        assert_eq!(
            p1.outcome_of(&id).await,
            Some(TransactionalStatus::LockValidationFailed)
        );
        assert_eq!(
            p2.outcome_of(&id).await,
            Some(TransactionalStatus::LockValidationFailed)
        );
        assert_eq!(lock1.holders().await, 0);
        // Only the blocker is left at p2.
        assert_eq!(lock2.holders().await, 1);
    });
}

pub fn tm_cancels_prepared_writers_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let registry = ParticipantRegistry::new();
        let (p1, lock1) = mk_queue("p1", &registry, QueueConfig::default()).await;
        let (p2, lock2) = mk_queue("p2", &registry, QueueConfig::default()).await;
        let (p3, lock3) = mk_queue("p3", &registry, QueueConfig::default()).await;
        let w = AccessCounter { reads: 0, writes: 1 };
        let blocker = TransactionId::new();
        assert_eq!(
            lock3.enter(blocker, w, Duration::from_millis(1)).await,
            TransactionalStatus::Ok
        );

        // No agent here: whatever reaches p2 comes from the TM queue.
        let id = TransactionId::new();
        let tm = p1.self_id().clone();
        let writers = vec![tm.clone(), p2.self_id().clone(), p3.self_id().clone()];
        p2.prepare(id, w, Timestamp(5), tm.clone(), vec![])
            .await
            .unwrap();
        assert_eq!(p2.role_of(&id).await, Some("RemoteCommit"));
        assert_eq!(lock2.holders().await, 1);
        p3.prepare(id, w, Timestamp(5), tm, vec![]).await.unwrap();
        let status = p1
            .prepare_and_commit(id, w, Timestamp(6), writers, 3, vec![])
            .await;
        assert_eq!(status, Ok(TransactionalStatus::LockValidationFailed));

        settle().await;
        assert_eq!(p2.role_of(&id).await, None);
        assert_eq!(
            p2.outcome_of(&id).await,
            Some(TransactionalStatus::LockValidationFailed)
        );
        assert_eq!(lock1.holders().await, 0);
        assert_eq!(lock2.holders().await, 0);
        assert_eq!(lock3.holders().await, 1);
    });
}

pub fn dispose_releases_lease_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let leases = Arc::new(InMemoryLeaseProvider::new(Arc::new(TestClock::frozen())));
        let storage = Arc::new(InMemoryIdStorage::new());
        let config = IdGeneratorConfig::default().with_batch_size(10);

        let a = TransactionIdGenerator::start("a", config.clone(), leases.clone(), storage.clone())
            .await
            .unwrap();
        let served_a = a.next_ids(3).await.unwrap();
        match TransactionIdGenerator::start("b", config.clone(), leases.clone(), storage.clone())
            .await
        {
            Err(e) => assert_eq!(e, Error::GeneratorUnavailable),
            Ok(_) => panic!("second generator started while the lease was held"),
        }

        // The lease is far from expiring; only dispose can free it.
        a.dispose().await;
        assert_eq!(a.next_id().await, Err(Error::GeneratorUnavailable));
        let b = TransactionIdGenerator::start("b", config, leases, storage)
            .await
            .unwrap();
        let first_b = b.next_id().await.unwrap();
        assert!(served_a.iter().all(|id| *id < first_b));
        b.dispose().await;
    });
}
