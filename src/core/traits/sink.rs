use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::{RunOutcome, SourceSnapshot};

/// Everything a finished run hands over for persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub snapshot: SourceSnapshot,
}

impl RunRecord {
    pub fn new(outcome: RunOutcome, snapshot: SourceSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            outcome,
            snapshot,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write run record: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode run record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Caller-supplied destination for completed runs.
#[cfg_attr(test, mockall::automock)]
pub trait ResultSink: Send + Sync {
    fn save(&self, record: &RunRecord) -> Result<(), SinkError>;
}

/// Wraps a finished run into a [`RunRecord`] and hands it to `sink`.
#[tracing::instrument(skip_all, fields(kind = %outcome.kind, total = outcome.total))]
pub fn persist(
    sink: &dyn ResultSink,
    outcome: RunOutcome,
    snapshot: SourceSnapshot,
) -> Result<RunRecord, SinkError> {
    let record = RunRecord::new(outcome, snapshot);
    sink.save(&record)?;
    tracing::info!(id = %record.id, "Run record saved");
    Ok(record)
}
