//! Job deduplication options and per-key state.

use serde_json::Value;
use slotlock_config::DeduplicationConfig;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// When a job holds its deduplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeduplicationStrategy {
    /// Every enqueue produces a job.
    #[default]
    None,
    /// The key is held from enqueue until the job starts executing.
    UntilExecuting,
}

/// What to do with a duplicate that was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfDeduplicated {
    #[default]
    Drop,
    /// Flag the surviving job so one follow-up runs after it finishes.
    RescheduleOnce,
}

impl fmt::Display for DeduplicationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeduplicationStrategy::None => write!(f, "none"),
            DeduplicationStrategy::UntilExecuting => write!(f, "until_executing"),
        }
    }
}

impl fmt::Display for IfDeduplicated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfDeduplicated::Drop => write!(f, "drop"),
            IfDeduplicated::RescheduleOnce => write!(f, "reschedule_once"),
        }
    }
}

/// A worker's deduplication settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeduplicationOptions {
    pub strategy: DeduplicationStrategy,
    pub if_deduplicated: IfDeduplicated,
    /// Jobs scheduled for later hold the key too.
    pub including_scheduled: bool,
    /// Delay before the follow-up of a rescheduled job.
    pub reschedule_delay: Duration,
}

impl Default for DeduplicationOptions {
    fn default() -> Self {
        Self::none()
    }
}

impl DeduplicationOptions {
    pub fn none() -> Self {
        Self {
            strategy: DeduplicationStrategy::None,
            if_deduplicated: IfDeduplicated::Drop,
            including_scheduled: false,
            reschedule_delay: Duration::ZERO,
        }
    }

    /// `until_executing`, rescheduling once, including scheduled jobs.
    pub fn until_executing() -> Self {
        Self::from_config(&DeduplicationConfig::default())
    }

    pub fn from_config(config: &DeduplicationConfig) -> Self {
        Self {
            strategy: DeduplicationStrategy::UntilExecuting,
            if_deduplicated: IfDeduplicated::RescheduleOnce,
            including_scheduled: config.including_scheduled,
            reschedule_delay: config.reschedule_delay(),
        }
    }

    pub fn with_reschedule_delay(mut self, delay: Duration) -> Self {
        self.reschedule_delay = delay;
        self
    }

    pub fn reschedules(&self) -> bool {
        self.if_deduplicated == IfDeduplicated::RescheduleOnce
    }

    /// Whether a job enqueued with these options holds its key.
    /// `scheduled` is true when the job runs later than now.
    pub fn holds_key(&self, scheduled: bool) -> bool {
        match self.strategy {
            DeduplicationStrategy::None => false,
            DeduplicationStrategy::UntilExecuting => self.including_scheduled || !scheduled,
        }
    }
}

/// The deduplication key of a job: its serialized arguments.
pub fn dedup_key(args: &Value) -> String {
    args.to_string()
}

/// State of a held key. An idle key has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DuplicateState {
    Queued { job_id: Uuid },
    QueuedWithPendingRetry { job_id: Uuid },
}

impl DuplicateState {
    pub(crate) fn job_id(&self) -> Uuid {
        match self {
            DuplicateState::Queued { job_id } | DuplicateState::QueuedWithPendingRetry { job_id } => {
                *job_id
            }
        }
    }

    pub(crate) fn reschedule_pending(&self) -> bool {
        matches!(self, DuplicateState::QueuedWithPendingRetry { .. })
    }

    /// Record a dropped duplicate.
    pub(crate) fn on_duplicate(self, if_deduplicated: IfDeduplicated) -> Self {
        match (self, if_deduplicated) {
            (DuplicateState::Queued { job_id }, IfDeduplicated::RescheduleOnce) => {
                DuplicateState::QueuedWithPendingRetry { job_id }
            }
            (state, _) => state,
        }
    }
}
