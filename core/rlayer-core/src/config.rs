//! Per-subsystem configuration structs.
//!
//! Kept small and colocated with the subsystem they configure rather than
//! one global options blob.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// KV transaction envelope limits: 5s wall clock, 10MB writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionLimits {
    pub max_duration: Duration,
    pub max_bytes: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(5),
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Retry/backoff policy shared by background batch loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (zero-based) retry attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max_backoff)
    }
}

/// `OnlineIndexer` batch envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexerConfig {
    pub records_per_batch: usize,
    pub bytes_per_batch: usize,
    pub throttle_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            records_per_batch: 100,
            bytes_per_batch: 1024 * 1024,
            throttle_delay: Duration::from_millis(0),
            retry: RetryPolicy::default(),
        }
    }
}

impl IndexerConfig {
    /// Halve the batch budget, used after a `TransactionTooLarge` batch.
    pub fn narrowed(&self) -> Self {
        Self {
            records_per_batch: (self.records_per_batch / 2).max(1),
            bytes_per_batch: (self.bytes_per_batch / 2).max(1024),
            ..*self
        }
    }
}

/// What the scrubber should do with the issues it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPolicy {
    DetectOnly,
    Repair,
}

/// `OnlineIndexScrubber` batch envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrubberConfig {
    pub entries_per_batch: usize,
    pub bytes_per_batch: usize,
    pub repair: RepairPolicy,
    pub retry: RetryPolicy,
}

impl Default for ScrubberConfig {
    fn default() -> Self {
        Self {
            entries_per_batch: 100,
            bytes_per_batch: 1024 * 1024,
            repair: RepairPolicy::DetectOnly,
            retry: RetryPolicy::default(),
        }
    }
}

/// Version-index history retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionRetention {
    KeepAll,
    KeepLastN(u32),
    KeepForDuration(Duration),
}

impl Default for VersionRetention {
    fn default() -> Self {
        VersionRetention::KeepAll
    }
}
