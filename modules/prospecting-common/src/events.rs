//! Typed progress events streamed to the caller during a run.
//!
//! Single writer (the orchestrator), single logical reader (the SSE
//! response). Emission order matches causal order within the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Brief, Prospect, RunSummary};

/// Severity attached to `progress` events. Recoverable per-prospect
/// failures surface as `Warning` progress frames, not terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        brief: Brief,
    },
    Progress {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        stage: u8,
        total_steps: u8,
        company: Option<String>,
        message: String,
        level: ProgressLevel,
    },
    CompanyComplete {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        prospect: Box<Prospect>,
    },
    Skipped {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        company: String,
        reason: String,
    },
    Reused {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        company: String,
        prospect_id: Uuid,
    },
    Linked {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        company: String,
        prospect_id: Uuid,
        project_id: Uuid,
    },
    Error {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        message: String,
    },
    Complete {
        timestamp: DateTime<Utc>,
        run_id: Uuid,
        results: RunSummary,
    },
}

impl ProgressEvent {
    pub fn started(run_id: Uuid, brief: Brief) -> Self {
        ProgressEvent::Started {
            timestamp: Utc::now(),
            run_id,
            brief,
        }
    }

    pub fn progress(run_id: Uuid, stage: u8, company: Option<&str>, message: &str) -> Self {
        ProgressEvent::Progress {
            timestamp: Utc::now(),
            run_id,
            stage,
            total_steps: 7,
            company: company.map(String::from),
            message: message.to_string(),
            level: ProgressLevel::Info,
        }
    }

    pub fn warning(run_id: Uuid, stage: u8, company: Option<&str>, message: &str) -> Self {
        ProgressEvent::Progress {
            timestamp: Utc::now(),
            run_id,
            stage,
            total_steps: 7,
            company: company.map(String::from),
            message: message.to_string(),
            level: ProgressLevel::Warning,
        }
    }

    pub fn company_complete(run_id: Uuid, prospect: Prospect) -> Self {
        ProgressEvent::CompanyComplete {
            timestamp: Utc::now(),
            run_id,
            prospect: Box::new(prospect),
        }
    }

    pub fn skipped(run_id: Uuid, company: &str, reason: &str) -> Self {
        ProgressEvent::Skipped {
            timestamp: Utc::now(),
            run_id,
            company: company.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn reused(run_id: Uuid, company: &str, prospect_id: Uuid) -> Self {
        ProgressEvent::Reused {
            timestamp: Utc::now(),
            run_id,
            company: company.to_string(),
            prospect_id,
        }
    }

    pub fn linked(run_id: Uuid, company: &str, prospect_id: Uuid, project_id: Uuid) -> Self {
        ProgressEvent::Linked {
            timestamp: Utc::now(),
            run_id,
            company: company.to_string(),
            prospect_id,
            project_id,
        }
    }

    pub fn error(run_id: Uuid, message: &str) -> Self {
        ProgressEvent::Error {
            timestamp: Utc::now(),
            run_id,
            message: message.to_string(),
        }
    }

    pub fn complete(run_id: Uuid, results: RunSummary) -> Self {
        ProgressEvent::Complete {
            timestamp: Utc::now(),
            run_id,
            results,
        }
    }

    /// Intermediate info-level `progress` frames may be coalesced under
    /// backpressure. Warnings and every other event type must reach the
    /// reader.
    pub fn is_coalescable(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Progress {
                level: ProgressLevel::Info,
                ..
            }
        )
    }

    /// Coalescing key: the last progress frame per (stage, company) survives.
    pub fn coalesce_key(&self) -> Option<(u8, Option<&str>)> {
        match self {
            ProgressEvent::Progress { stage, company, .. } => {
                Some((*stage, company.as_deref()))
            }
            _ => None,
        }
    }

    /// The stream terminates after a single `complete` or `error` frame.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        )
    }
}
