use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One node of the per-ticket pipeline, plus the batch-level `Pipeline`
/// pseudo-stage used for batch start/finish events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SpamFilter,
    PiiScrub,
    LlmAnalysis,
    Geocode,
    Priority,
    Routing,
    Pipeline,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpamFilter => "spam_filter",
            Self::PiiScrub => "pii_scrub",
            Self::LlmAnalysis => "llm_analysis",
            Self::Geocode => "geocode",
            Self::Priority => "priority",
            Self::Routing => "routing",
            Self::Pipeline => "pipeline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spam_filter" => Some(Self::SpamFilter),
            "pii_scrub" => Some(Self::PiiScrub),
            "llm_analysis" => Some(Self::LlmAnalysis),
            "geocode" => Some(Self::Geocode),
            "priority" => Some(Self::Priority),
            "routing" => Some(Self::Routing),
            "pipeline" => Some(Self::Pipeline),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal statuses never transition to anything else.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one stage run's terminal (or in-flight) state.
/// The current status per (ticket, stage) is the latest write; terminal
/// statuses are sticky (enforced by the progress store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub ticket_id: Uuid,
    pub batch_id: Uuid,
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageOutcome {
    pub fn started(ticket_id: Uuid, batch_id: Uuid, stage: Stage) -> Self {
        Self {
            ticket_id,
            batch_id,
            stage,
            status: StageStatus::InProgress,
            message: None,
            error_detail: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn completed(mut self, message: impl Into<String>) -> Self {
        self.status = StageStatus::Completed;
        self.message = Some(message.into());
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn failed(mut self, error_detail: impl Into<String>) -> Self {
        self.status = StageStatus::Failed;
        self.error_detail = Some(error_detail.into());
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}
