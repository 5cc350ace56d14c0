//! Run reports

use crate::snapshot::Snapshot;
use crate::step::{StepKind, StepOutcome, StepStatus};
use crate::urn::Urn;
use serde::{Deserialize, Serialize};

/// Overall outcome of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step completed
    Succeeded,
    /// Some steps failed or were skipped; completed work was committed
    SucceededWithErrors,
    /// The program failed or the run was cancelled or aborted; work that
    /// completed is still committed unless the built snapshot was inconsistent
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::SucceededWithErrors => write!(f, "succeeded with errors"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-resource line of a run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub urn: Urn,
    pub kind: StepKind,
    pub status: StepStatus,
}

impl From<&StepOutcome> for StepReport {
    fn from(outcome: &StepOutcome) -> Self {
        Self {
            urn: outcome.urn.clone(),
            kind: outcome.kind,
            status: outcome.status.clone(),
        }
    }
}

/// Result of one deployment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,

    /// Steps in the order they reached a terminal state
    pub steps: Vec<StepReport>,

    /// The committed snapshot, or the computed one for previews; the prior
    /// snapshot when nothing could be committed
    pub snapshot: Snapshot,

    /// Whether `snapshot` was written to the store
    pub committed: bool,

    pub preview: bool,

    /// Run-level error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn step(&self, urn: &Urn) -> Option<&StepReport> {
        self.steps.iter().find(|s| &s.urn == urn)
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Skipped(_)))
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for step in &self.steps {
            match &step.status {
                StepStatus::Failed(_) => summary.failed += 1,
                StepStatus::Skipped(_) => summary.skipped += 1,
                StepStatus::Completed => match step.kind {
                    StepKind::Same => summary.same += 1,
                    StepKind::Create => summary.create += 1,
                    StepKind::Update => summary.update += 1,
                    StepKind::Delete => summary.delete += 1,
                    StepKind::Replace => summary.replace += 1,
                    StepKind::Read => summary.read += 1,
                },
            }
        }
        summary
    }
}

/// Counts of completed steps by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub read: usize,
    pub same: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PlanSummary {
    pub fn has_changes(&self) -> bool {
        self.create + self.update + self.replace + self.delete > 0
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.same
        )?;
        if self.read > 0 {
            write!(f, ", {} read", self.read)?;
        }
        if self.failed > 0 || self.skipped > 0 {
            write!(f, " ({} failed, {} skipped)", self.failed, self.skipped)?;
        }
        Ok(())
    }
}
