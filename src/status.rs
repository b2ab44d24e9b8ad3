// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};

/// The outcome of a transaction, or of one participant's view of it.
///
/// Once any party observes something other than `Ok`, the transaction never
/// subsequently commits. Most non-`Ok` values are *definite* aborts; a few
/// (see [TransactionalStatus::is_definitely_aborted]) only say that this
/// party could not learn the outcome, and are treated as aborts by policy.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionalStatus {
    Ok,
    /// The TM did not hear from every participant in time.
    PrepareTimeout,
    /// A transaction this one depended on aborted.
    CascadingAbort,
    /// This transaction's lock was broken by a conflicting transaction.
    BrokenLock,
    /// Lock or version validation against the recorded access failed.
    LockValidationFailed,
    /// A participant did not answer the coordinator in time.
    ParticipantResponseTimeout,
    /// The TM did not answer the coordinator in time; outcome unknown.
    TMResponseTimeout,
    StorageConflict,
    /// The record is gone and nobody can prove it committed.
    PresumedAbort,
    /// The commit decision was reached but could not be made durable.
    CommitFailure,
    UnknownException,
}

impl TransactionalStatus {
    pub fn is_ok(&self) -> bool {
        *self == TransactionalStatus::Ok
    }

    /// True if this status is a guarantee that the transaction did not and
    /// will not commit anywhere. A TM timeout is ambiguous: the TM may have
    /// committed after the coordinator stopped waiting.
    pub fn is_definitely_aborted(&self) -> bool {
        match self {
            TransactionalStatus::Ok
            | TransactionalStatus::TMResponseTimeout
            | TransactionalStatus::CommitFailure
            | TransactionalStatus::UnknownException => false,
            TransactionalStatus::PrepareTimeout
            | TransactionalStatus::CascadingAbort
            | TransactionalStatus::BrokenLock
            | TransactionalStatus::LockValidationFailed
            | TransactionalStatus::ParticipantResponseTimeout
            | TransactionalStatus::StorageConflict
            | TransactionalStatus::PresumedAbort => true,
        }
    }
}

impl Default for TransactionalStatus {
    fn default() -> Self {
        TransactionalStatus::Ok
    }
}

#[test]
fn test_ambiguous_statuses_are_not_definite_aborts() {
    assert!(!TransactionalStatus::Ok.is_definitely_aborted());
    assert!(!TransactionalStatus::TMResponseTimeout.is_definitely_aborted());
    assert!(!TransactionalStatus::CommitFailure.is_definitely_aborted());
    assert!(TransactionalStatus::LockValidationFailed.is_definitely_aborted());
    assert!(TransactionalStatus::CascadingAbort.is_definitely_aborted());
    assert!(TransactionalStatus::ParticipantResponseTimeout.is_definitely_aborted());
}
