// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate is the transaction coordination core of a virtual-actor
//! runtime. It lets any number of independently-hosted stateful objects
//! ("resources") take part in one all-or-nothing transaction, with no central
//! data store and no global locks. Ordering comes from causal timestamps
//! rather than synchronized wall clocks.
//!
//! ## Summary
//!
//!   - A caller asks a [TransactionAgent] to start a transaction and gets a
//!     [TransactionInfo] carrying a [TransactionId] and a [Timestamp] drawn
//!     from the agent's [CausalClock].
//!
//!   - Business logic touches resources, each recording reads and writes
//!     into the [TransactionInfo] as an [AccessCounter] per [ParticipantId].
//!
//!   - On resolution the agent partitions participants into writers and
//!     readers. With no writers it runs a one-round read-only commit. With
//!     writers it picks one writer as Transaction Manager (TM) and runs a
//!     two-phase commit through it.
//!
//!   - Each resource runs a [ParticipantQueue], a per-transaction state
//!     machine that validates locks, merges timestamps, talks to the TM and
//!     unwinds on abort, cancel or timeout.
//!
//!   - Separately, a [TransactionIdGenerator] hands out unique monotonic
//!     64-bit ids from batches allocated under a renewable lease, for
//!     in-cluster managers that need a durable log order.
//!
//! ## Collaborators
//!
//! Message delivery, storage and activation are not in this crate. They are
//! reached through narrow traits: [Participant] (remote surface of a
//! resource), [ResourceLock], [OverloadDetector], [LeaseProvider] and
//! [IdAllocationStorage]. In-memory implementations of each are provided for
//! single-process hosts and tests.
//!
//! ## Name
//!
//! Greek συνάλλαγμα, "a contract, a mutual transaction".

use futures::Future;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, pin::Pin};
use thiserror::Error;

/// Failures that are not protocol outcomes. A transaction that aborts for a
/// protocol reason resolves to `Ok(status)` carrying a [TransactionalStatus];
/// an `Error` means something underneath the protocol broke.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Start transaction failed: {0:?}")]
    StartTransactionFailed(OverloadReason),
    #[error("Transaction id generator is unavailable")]
    GeneratorUnavailable,
    #[error("Unknown participant {0:?}")]
    UnknownParticipant(ParticipantId),
    #[error("Write recorded against a read-only transaction")]
    ReadOnlyViolation,
    #[error("Transaction {transaction:?} is in role {found}, expected {expected}")]
    UnexpectedRole {
        transaction: TransactionId,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Storage failure: {0}")]
    Storage(String),
    #[error("Lease failure: {0}")]
    Lease(String),
}

/// Why a transaction could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverloadReason {
    Overload,
}

mod agent;
mod clock;
mod config;
mod idgen;
mod lease;
mod lock;
mod overload;
mod participant;
mod queue;
mod stats;
mod status;
mod transaction;

// As in the rest of the crate's async surface, nontrivial async calls are
// boxed: it costs an allocation per call but lets participant handles live
// behind `dyn` and keeps compile times down. The standard BoxFuture is not
// Sync, which we need for storing these inside shared handles.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use agent::TransactionAgent;
pub use clock::{CausalClock, Clock, RealClock, TestClock, Timestamp};
pub use config::{AgentConfig, IdGeneratorConfig, LoadSheddingConfig, QueueConfig};
pub use idgen::{IdAllocationStorage, InMemoryIdStorage, TransactionIdGenerator};
pub use lease::{
    AcquireResult, AcquiredLease, InMemoryLeaseProvider, LeaseProvider, LeaseRequest,
    ResponseCode,
};
pub use lock::{InMemoryLock, LockRecord, ResourceLock};
pub use overload::{NeverOverloaded, OverloadDetector, TransactionRateDetector};
pub use participant::{Participant, ParticipantRegistry};
pub use queue::{CommitRole, ParticipantQueue};
pub use stats::{
    ReporterHandle, StatisticsReport, StatisticsReporter, StatisticsSnapshot,
    TransactionAgentStatistics,
};
pub use status::TransactionalStatus;
pub use transaction::{AccessCounter, ParticipantId, TransactionId, TransactionInfo};
