// src/models/stats_models.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::models::prediction::BusinessKey;

/// Which expected-producer set a batch is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// First predictions for a slate.
    Scheduled,
    /// Re-run after thresholds moved or late features arrived.
    Refresh,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Scheduled => "scheduled",
            RunMode::Refresh => "refresh",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(RunMode::Scheduled),
            "refresh" => Ok(RunMode::Refresh),
            other => Err(PipelineError::Config(format!("unknown run mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    PartialFailure,
    Blocked,
    Failed,
    AlreadyComplete,
    /// Nothing was staged (empty roster, or every entity skipped). Not terminal:
    /// the next trigger for the date runs again.
    NoWork,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::PartialFailure => "PARTIAL_FAILURE",
            RunStatus::Blocked => "BLOCKED",
            RunStatus::Failed => "FAILED",
            RunStatus::AlreadyComplete => "ALREADY_COMPLETE",
            RunStatus::NoWork => "NO_WORK",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

/// One business key that validation found more than once in the canonical store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub key: BusinessKey,
    pub count: usize,
    pub written_at: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationStats {
    pub scope_key: String,
    pub staged_count: usize,
    pub merged_count: usize,
    pub duplicate_count: usize,
    pub duplicates: Vec<DuplicateGroup>,
    pub lock_acquired: bool,
    pub staging_discarded: bool,
}

impl ConsolidationStats {
    pub fn is_clean(&self) -> bool {
        self.duplicate_count == 0
    }
}

/// Whether the expected producers for a date/mode are in, so consolidation may run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum TriggerDecision {
    /// `missing_optional` non-empty means the degraded trigger fired.
    Ready { missing_optional: Vec<String> },
    Blocked {
        missing_critical: Vec<String>,
        optional_done_ratio: f64,
    },
}

impl TriggerDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, TriggerDecision::Ready { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, TriggerDecision::Ready { missing_optional } if !missing_optional.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub context_date: NaiveDate,
    pub mode: RunMode,
    pub status: RunStatus,
    /// Entity-level counts.
    pub requested: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub missing_entities: Vec<String>,
    pub partitions_total: usize,
    pub partitions_succeeded: usize,
    pub partitions_failed: usize,
    pub staged_records: usize,
    pub trigger: Option<TriggerDecision>,
    pub consolidation: Option<ConsolidationStats>,
    pub errors: Vec<String>,
    pub elapsed_secs: f64,
}

impl BatchSummary {
    pub fn empty(run_id: &str, context_date: NaiveDate, mode: RunMode, status: RunStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            context_date,
            mode,
            status,
            requested: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            missing_entities: Vec::new(),
            partitions_total: 0,
            partitions_succeeded: 0,
            partitions_failed: 0,
            staged_records: 0,
            trigger: None,
            consolidation: None,
            errors: Vec::new(),
            elapsed_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradingSummary {
    pub context_date: NaiveDate,
    pub status: RunStatus,
    /// Canonical predictions considered.
    pub requested: usize,
    pub graded: usize,
    pub correct: usize,
    pub incorrect: usize,
    /// Graded with `correct = null` (push, PASS, did not participate).
    pub ungraded: usize,
    /// Outcome not final yet; picked up by the next cycle.
    pub deferred: usize,
    pub consolidation: Option<ConsolidationStats>,
    pub errors: Vec<String>,
}

impl GradingSummary {
    pub fn hit_rate(&self) -> Option<f64> {
        let decided = self.correct + self.incorrect;
        if decided == 0 {
            None
        } else {
            Some(self.correct as f64 / decided as f64)
        }
    }
}
