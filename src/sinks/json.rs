use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::traits::sink::{ResultSink, RunRecord, SinkError};

/// Writes each run record as a pretty-printed JSON document.
///
/// When `path` is an existing directory, every record goes to its own
/// `run_<id>.json` inside it; otherwise `path` itself is (over)written.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new<T: AsRef<Path>>(path: T) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn target_for(&self, record: &RunRecord) -> PathBuf {
        if self.path.is_dir() {
            self.path.join(format!("run_{}.json", record.id))
        } else {
            self.path.clone()
        }
    }
}

impl ResultSink for JsonFileSink {
    #[tracing::instrument(skip_all, fields(id = %record.id))]
    fn save(&self, record: &RunRecord) -> Result<(), SinkError> {
        let target = self.target_for(record);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut encoded = serde_json::to_vec_pretty(record)?;
        encoded.push(b'\n');
        let mut file = fs::File::create(&target)?;
        file.write_all(&encoded)?;
        tracing::debug!("Run record written to {}", target.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::core::domain::{
        CaseData, CaseResult, CaseStatus, PipelineKind, RunOutcome, SourceSnapshot,
    };

    fn record() -> RunRecord {
        let case = CaseResult {
            case_number: 1,
            passed: false,
            status: CaseStatus::RuntimeError { exit_code: 11 },
            elapsed_seconds: 0.01,
            total_seconds: 0.02,
            peak_memory_mb: 2.0,
            data: CaseData::empty(PipelineKind::Comparison),
        };
        let outcome = RunOutcome {
            kind: PipelineKind::Comparison,
            requested: 1,
            total: 1,
            passed: 0,
            failed: 1,
            errored: 0,
            all_passed: false,
            cancelled: false,
            cases: vec![case],
        };
        RunRecord::new(outcome, SourceSnapshot::empty(PipelineKind::Comparison))
    }

    #[test]
    fn test_writes_record_to_file() {
        let dir = std::env::temp_dir().join(format!("stress_{}", Uuid::new_v4()));
        let path = dir.join("nested").join("run.json");
        let sink = JsonFileSink::new(&path);
        let record = record();

        sink.save(&record).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let decoded: RunRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(decoded, record);
        assert!(content.contains("\"status\": \"runtime_error\""));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_directory_target_gets_one_file_per_run() {
        let dir = std::env::temp_dir().join(format!("stress_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let sink = JsonFileSink::new(&dir);

        sink.save(&record()).unwrap();
        sink.save(&record()).unwrap();

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);
        fs::remove_dir_all(dir).unwrap();
    }
}
