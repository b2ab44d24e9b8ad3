// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Tunables for the coordinator, the participant queue and the id generator.
//! Hosts build these in code or deserialize them from their own config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [crate::TransactionAgent].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// How long the coordinator waits for participant or TM responses
    /// before resolving with a timeout status.
    pub response_timeout: Duration,
    pub load_shedding: LoadSheddingConfig,
}

impl AgentConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_load_shedding(mut self, load_shedding: LoadSheddingConfig) -> Self {
        self.load_shedding = load_shedding;
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            response_timeout: Duration::from_secs(10),
            load_shedding: LoadSheddingConfig::default(),
        }
    }
}

/// Rate-based load shedding for [crate::TransactionRateDetector].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSheddingConfig {
    pub enabled: bool,
    /// Transactions started per second above which new starts are refused.
    pub limit_per_second: u64,
}

impl LoadSheddingConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_limit_per_second(mut self, limit: u64) -> Self {
        self.limit_per_second = limit;
        self
    }
}

impl Default for LoadSheddingConfig {
    fn default() -> Self {
        LoadSheddingConfig {
            enabled: false,
            limit_per_second: 700,
        }
    }
}

/// Configuration for a [crate::ParticipantQueue].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a TM waits for `Prepared` from the other participants.
    pub prepare_timeout: Duration,
    /// How long a prepared remote participant waits for `Confirm` or
    /// `Cancel` before pinging its TM.
    pub ping_after: Duration,
    /// How many resolved outcomes are remembered to answer late calls.
    pub resolved_history: usize,
}

impl QueueConfig {
    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    pub fn with_ping_after(mut self, after: Duration) -> Self {
        self.ping_after = after;
        self
    }

    pub fn with_resolved_history(mut self, entries: usize) -> Self {
        self.resolved_history = entries;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            prepare_timeout: Duration::from_secs(20),
            ping_after: Duration::from_secs(5),
            resolved_history: 1024,
        }
    }
}

/// Configuration for a [crate::TransactionIdGenerator].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdGeneratorConfig {
    /// Name of the lease that guards id allocation. Every generator that
    /// must not overlap with another has to use the same key.
    pub lease_key: String,
    pub lease_duration: Duration,
    pub batch_size: u64,
    /// Consecutive transient renewal failures tolerated before the
    /// generator gives up its claim.
    pub max_renew_retries: usize,
}

impl IdGeneratorConfig {
    pub fn with_lease_key(mut self, key: impl Into<String>) -> Self {
        self.lease_key = key.into();
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_renew_retries(mut self, retries: usize) -> Self {
        self.max_renew_retries = retries;
        self
    }
}

impl Default for IdGeneratorConfig {
    fn default() -> Self {
        IdGeneratorConfig {
            lease_key: "transaction-id-generator".to_string(),
            lease_duration: Duration::from_secs(30),
            batch_size: 1000,
            max_renew_retries: 3,
        }
    }
}
