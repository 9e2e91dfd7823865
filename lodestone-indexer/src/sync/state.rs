//! Synchronization state machine.
//!
//! Pure decision logic, no I/O: the controller feeds it poll results and
//! task outcomes, and executes whatever action comes back. Keeping the
//! current time a parameter makes every transition deterministic under
//! test.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lodestone_common::models::{BlockRange, Height};
use rand::Rng;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Synchronizing,
    UpToDate,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Synchronizing => "synchronizing",
            SyncPhase::UpToDate => "up-to-date",
            SyncPhase::Failed => "failed",
        }
    }
}

/// What the controller should do next, as decided by [`SyncStateMachine`].
#[derive(Clone, Debug, PartialEq)]
pub enum SyncAction {
    NoOp,
    /// Begin downloading the given ranges, one task per range.
    StartSync(Vec<BlockRange>),
    /// An attempt is in flight; wait for its tasks to report.
    AwaitOutstanding,
    /// The local index just caught up with the daemon.
    DeclareUpToDate,
    /// Height polling failed; the attempt is recorded as failed.
    DeclareFailure(String),
    /// A failed attempt is still cooling down.
    RetryAfterBackoff,
}

/// Outcome of an attempt, produced once its last task has reported.
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptResolution {
    /// Every task succeeded; heights should be re-evaluated immediately.
    AllSucceeded,
    /// At least one task errored; the attempt is failed and backed off.
    Failed(String),
    /// Tasks were stopped without an error (shutdown).
    Aborted,
}

/// Bounded exponential backoff with jitter, applied between failed
/// attempts so a flapping daemon is not hammered on every poll tick.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), cap: Duration::from_secs(60) }
    }
}

impl BackoffPolicy {
    /// Delay before the `consecutive_failures`-th retry: exponential,
    /// capped, with ±25% uniform jitter.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let shift = consecutive_failures.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << shift).min(self.cap);
        raw.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
    }
}

pub struct SyncStateMachine {
    phase: SyncPhase,
    max_tasks: NonZeroUsize,
    backoff: BackoffPolicy,
    local: Option<Height>,
    remote: Option<Height>,
    attempt: u64,
    attempt_size: usize,
    outstanding: usize,
    failures: usize,
    successes: usize,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    last_error: Option<String>,
}

impl SyncStateMachine {
    pub fn new(max_tasks: NonZeroUsize, backoff: BackoffPolicy) -> Self {
        Self {
            phase: SyncPhase::Idle,
            max_tasks,
            backoff,
            local: None,
            remote: None,
            attempt: 0,
            attempt_size: 0,
            outstanding: 0,
            failures: 0,
            successes: 0,
            consecutive_failures: 0,
            retry_at: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn local(&self) -> Option<Height> {
        self.local
    }

    pub fn remote(&self) -> Option<Height> {
        self.remote
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Decides what to do for one poll tick, given freshly queried heights.
    pub fn on_poll(&mut self, local: Option<Height>, remote: Height, now: Instant) -> SyncAction {
        self.local = local;
        self.remote = Some(remote);

        if self.outstanding > 0 {
            return SyncAction::AwaitOutstanding;
        }
        if self.phase == SyncPhase::Failed {
            if let Some(retry_at) = self.retry_at {
                if now < retry_at {
                    return SyncAction::RetryAfterBackoff;
                }
            }
        }

        if let Some(local) = local {
            if remote < local {
                // The remote tip moved below ours (deep reorg or a flaky
                // daemon); never derive a range from it.
                warn!(local, remote, "remote height below local tip");
                return SyncAction::NoOp;
            }
        }

        let next_needed = local.map_or(0, |h| h + 1);
        if remote < next_needed {
            let previous = self.phase;
            self.phase = SyncPhase::UpToDate;
            self.retry_at = None;
            return if previous == SyncPhase::UpToDate {
                SyncAction::NoOp
            } else {
                SyncAction::DeclareUpToDate
            };
        }

        let ranges = BlockRange::new(next_needed, remote + 1).split(self.max_tasks.get());
        self.phase = SyncPhase::Synchronizing;
        self.attempt += 1;
        self.attempt_size = ranges.len();
        self.outstanding = ranges.len();
        self.failures = 0;
        self.successes = 0;
        self.last_error = None;
        self.retry_at = None;
        debug!(attempt = self.attempt, n_ranges = ranges.len(), "attempt planned");
        SyncAction::StartSync(ranges)
    }

    /// Height polling itself failed (daemon or storage unreachable).
    pub fn on_poll_error(&mut self, reason: &str, now: Instant) -> SyncAction {
        if self.outstanding > 0 {
            return SyncAction::AwaitOutstanding;
        }
        if self.phase == SyncPhase::Failed {
            if let Some(retry_at) = self.retry_at {
                if now < retry_at {
                    return SyncAction::RetryAfterBackoff;
                }
            }
        }
        self.enter_failed(reason.to_string(), now);
        SyncAction::DeclareFailure(reason.to_string())
    }

    pub fn on_task_success(&mut self) {
        debug_assert_eq!(self.phase, SyncPhase::Synchronizing, "success outside an attempt");
        self.successes += 1;
    }

    pub fn on_task_error(&mut self, reason: &str) {
        debug_assert_eq!(self.phase, SyncPhase::Synchronizing, "error outside an attempt");
        self.failures += 1;
        self.last_error = Some(reason.to_string());
    }

    /// Called for every task's `finished` signal. Returns the attempt's
    /// resolution once the last task has reported, `None` before that.
    pub fn on_task_finished(&mut self, now: Instant) -> Option<AttemptResolution> {
        debug_assert!(self.outstanding > 0, "finished signal without outstanding task");
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding > 0 {
            return None;
        }

        if self.failures > 0 {
            let reason = self
                .last_error
                .clone()
                .unwrap_or_else(|| "task failed".to_string());
            self.enter_failed(reason.clone(), now);
            Some(AttemptResolution::Failed(reason))
        } else if self.successes == self.attempt_size {
            self.consecutive_failures = 0;
            // stay in Synchronizing: the follow-up poll either declares
            // up-to-date or plans more work if the remote advanced
            Some(AttemptResolution::AllSucceeded)
        } else {
            self.phase = SyncPhase::Idle;
            Some(AttemptResolution::Aborted)
        }
    }

    fn enter_failed(&mut self, reason: String, now: Instant) {
        self.consecutive_failures += 1;
        let delay = self.backoff.delay(self.consecutive_failures);
        debug!(
            consecutive_failures = self.consecutive_failures,
            ?delay,
            %reason,
            "entering failed state"
        );
        self.phase = SyncPhase::Failed;
        self.retry_at = Some(now + delay);
        self.last_error = Some(reason);
    }
}
