//! Progress supervision for running transfers
//!
//! Each poll of a Running migration feeds the latest transfer counters to
//! [`ProgressMonitor::evaluate`]. The monitor enforces two limits, both
//! taken from the configuration pinned at admission:
//!
//! - `progressTimeout`: seconds without measurable progress, where progress
//!   means more bytes processed or fewer bytes remaining
//! - `completionTimeoutPerGiB`: seconds per GiB of guest memory, measured
//!   from the transfer start, with guests under 1 GiB counted as 1 GiB
//!
//! The monitor holds no state of its own; the last progress sample lives in
//! the migration status so restarts do not reset the clocks.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::crd::{PinnedMigrationConfig, TransferProgress};

const GIB: u64 = 1024 * 1024 * 1024;

/// Why the monitor wants the migration aborted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortCause {
    /// No progress for longer than the progress timeout
    ProgressStalled {
        /// Last time progress was observed
        since: DateTime<Utc>,
        /// Configured timeout
        timeout: Duration,
    },
    /// The transfer ran longer than its completion budget
    CompletionTimeout {
        /// Time since the transfer started
        elapsed: Duration,
        /// Budget derived from guest size
        budget: Duration,
    },
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProgressStalled { since, timeout } => write!(
                f,
                "no transfer progress since {} (progress timeout {}s)",
                since.to_rfc3339(),
                timeout.num_seconds()
            ),
            Self::CompletionTimeout { elapsed, budget } => write!(
                f,
                "transfer running for {}s exceeds completion timeout of {}s",
                elapsed.num_seconds(),
                budget.num_seconds()
            ),
        }
    }
}

/// Result of one evaluation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorVerdict {
    /// Keep going; persist `progress` if `changed`
    Continue {
        /// Progress record to store
        progress: TransferProgress,
        /// True if `progress` differs from the stored record
        changed: bool,
    },
    /// Abort the transfer
    Abort(AbortCause),
}

/// Timeout enforcement for one migration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressMonitor {
    progress_timeout: Duration,
    completion_budget: Duration,
}

impl ProgressMonitor {
    /// Monitor for a guest of `guest_memory_bytes` under `pinned`
    pub fn new(pinned: &PinnedMigrationConfig, guest_memory_bytes: u64) -> Self {
        let gib = guest_memory_bytes.div_ceil(GIB).max(1);
        let budget_secs = pinned.completion_timeout_per_gib.saturating_mul(gib);
        Self {
            progress_timeout: seconds(pinned.progress_timeout),
            completion_budget: seconds(budget_secs),
        }
    }

    /// Total time the transfer may take
    pub fn completion_budget(&self) -> Duration {
        self.completion_budget
    }

    /// Judge the latest sample
    ///
    /// `started` is the transfer start timestamp and `previous` the stored
    /// progress record, if any.
    pub fn evaluate(
        &self,
        started: DateTime<Utc>,
        previous: Option<&TransferProgress>,
        data_processed_bytes: u64,
        data_remaining_bytes: u64,
        now: DateTime<Utc>,
    ) -> MonitorVerdict {
        let last_progress = match previous {
            Some(prev)
                if data_processed_bytes <= prev.data_processed_bytes
                    && data_remaining_bytes >= prev.data_remaining_bytes =>
            {
                prev.last_progress_timestamp
            }
            Some(_) => now,
            // First sample: anything moved counts, otherwise the clock runs from the start
            None if data_processed_bytes > 0 => now,
            None => started,
        };

        let elapsed = now - started;
        if elapsed > self.completion_budget {
            return MonitorVerdict::Abort(AbortCause::CompletionTimeout {
                elapsed,
                budget: self.completion_budget,
            });
        }
        if now - last_progress > self.progress_timeout {
            return MonitorVerdict::Abort(AbortCause::ProgressStalled {
                since: last_progress,
                timeout: self.progress_timeout,
            });
        }

        let progress = TransferProgress {
            data_processed_bytes,
            data_remaining_bytes,
            last_progress_timestamp: last_progress,
        };
        let changed = previous != Some(&progress);
        MonitorVerdict::Continue { progress, changed }
    }
}

fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}
