use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{BYTES_IN_MB, MAX_DEFAULT_WORKERS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Comparison,
    Validation,
    Benchmark,
}

impl PipelineKind {
    /// Roles whose stages run for this kind, in execution order.
    pub fn roles(&self) -> &'static [Role] {
        match self {
            PipelineKind::Comparison => &[Role::Generator, Role::Test, Role::Correct],
            PipelineKind::Validation => &[Role::Generator, Role::Test, Role::Validator],
            PipelineKind::Benchmark => &[Role::Generator, Role::Test],
        }
    }

    pub fn requires(&self, role: Role) -> bool {
        self.roles().contains(&role)
    }

    /// Name of the workspace subdirectory holding this kind's sources.
    pub fn workspace_dir(&self) -> &'static str {
        match self {
            PipelineKind::Comparison => "comparator",
            PipelineKind::Validation => "validator",
            PipelineKind::Benchmark => "benchmarker",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineKind::Comparison => "comparison",
            PipelineKind::Validation => "validation",
            PipelineKind::Benchmark => "benchmark",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pipeline kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for PipelineKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "comparison" | "comparator" | "stress" => Ok(PipelineKind::Comparison),
            "validation" | "validator" => Ok(PipelineKind::Validation),
            "benchmark" | "benchmarker" | "tle" => Ok(PipelineKind::Benchmark),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Generator,
    Correct,
    Validator,
    Test,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Generator, Role::Correct, Role::Validator, Role::Test];

    /// File stem used for this role inside a workspace directory.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Role::Generator => "generator",
            Role::Correct => "correct",
            Role::Validator => "validator",
            Role::Test => "test",
        }
    }

    /// File stems naming this role, the canonical one first.
    pub fn stem_aliases(&self) -> &'static [&'static str] {
        match self {
            Role::Generator => &["generator", "gen"],
            Role::Correct => &["correct", "solution", "sol"],
            Role::Validator => &["validator", "checker"],
            Role::Test => &["test", "brute"],
        }
    }

    /// Role named by a whole file stem (case-insensitive), with the rank of
    /// the matching alias. Helpers such as `testlib` or `correct-brute` name no role.
    pub fn from_file_stem(stem: &str) -> Option<(Role, usize)> {
        let stem = stem.to_ascii_lowercase();
        Role::ALL.into_iter().find_map(|role| {
            role.stem_aliases()
                .iter()
                .position(|alias| *alias == stem)
                .map(|rank| (role, rank))
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Cpp,
    Python,
    Java,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitsError {
    #[error("time limit must be a positive number of seconds, got {0}")]
    Time(f64),
    #[error("memory limit must be a positive number of megabytes, got {0}")]
    Memory(f64),
    #[error("worker count must be at least 1")]
    Workers,
}

/// Caller limits for the candidate stage plus the size of the worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    time_limit_seconds: f64,
    memory_limit_mb: f64,
    worker_count: usize,
}

impl Limits {
    pub fn new(
        time_limit_seconds: f64,
        memory_limit_mb: f64,
        worker_count: usize,
    ) -> Result<Self, LimitsError> {
        if !time_limit_seconds.is_finite() || time_limit_seconds <= 0.0 {
            return Err(LimitsError::Time(time_limit_seconds));
        }
        if !memory_limit_mb.is_finite() || memory_limit_mb <= 0.0 {
            return Err(LimitsError::Memory(memory_limit_mb));
        }
        if worker_count == 0 {
            return Err(LimitsError::Workers);
        }
        Ok(Self {
            time_limit_seconds,
            memory_limit_mb,
            worker_count,
        })
    }

    pub fn with_default_workers(
        time_limit_seconds: f64,
        memory_limit_mb: f64,
    ) -> Result<Self, LimitsError> {
        Self::new(time_limit_seconds, memory_limit_mb, default_worker_count())
    }

    pub fn time_limit_seconds(&self) -> f64 {
        self.time_limit_seconds
    }

    pub fn memory_limit_mb(&self) -> f64 {
        self.memory_limit_mb
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn candidate_stage(&self) -> StageLimits {
        StageLimits {
            time: Duration::from_secs_f64(self.time_limit_seconds),
            memory_mb: Some(self.memory_limit_mb),
        }
    }
}

/// One slot per core, leaving a core for the processes under test.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).clamp(1, MAX_DEFAULT_WORKERS)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StageLimits {
    pub time: Duration,
    pub memory_mb: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageRequest {
    pub argv: Vec<String>,
    pub stdin: Vec<u8>,
    pub limits: StageLimits,
    pub env: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub elapsed_seconds: f64,
    pub peak_memory_mb: f64,
    pub timed_out: bool,
    pub killed_for_memory: bool,
    pub cancelled: bool,
}

impl StageOutcome {
    /// True when the process ran to completion on its own.
    pub fn finished(&self) -> bool {
        !self.timed_out && !self.killed_for_memory && !self.cancelled
    }

    pub fn succeeded(&self) -> bool {
        self.finished() && self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_IN_MB
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaseStatus {
    Accepted,
    WrongAnswer,
    PresentationError,
    RuntimeError { exit_code: i32 },
    TimeLimitExceeded,
    MemoryLimitExceeded,
    ExecutionError { role: Role, message: String },
}

impl CaseStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CaseStatus::Accepted)
    }

    pub fn is_execution_error(&self) -> bool {
        matches!(self, CaseStatus::ExecutionError { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMismatch {
    pub line: usize,
    pub expected: String,
    pub actual: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaseData {
    Comparison {
        input: String,
        expected_output: String,
        actual_output: String,
        first_mismatch: Option<LineMismatch>,
    },
    Validation {
        input: String,
        output: String,
        validator_exit_code: Option<i32>,
        validation_message: String,
    },
    Benchmark {
        input: String,
        output: String,
        exit_code: Option<i32>,
        input_lines: usize,
    },
}

impl CaseData {
    pub fn empty(kind: PipelineKind) -> Self {
        match kind {
            PipelineKind::Comparison => CaseData::Comparison {
                input: String::new(),
                expected_output: String::new(),
                actual_output: String::new(),
                first_mismatch: None,
            },
            PipelineKind::Validation => CaseData::Validation {
                input: String::new(),
                output: String::new(),
                validator_exit_code: None,
                validation_message: String::new(),
            },
            PipelineKind::Benchmark => CaseData::Benchmark {
                input: String::new(),
                output: String::new(),
                exit_code: None,
                input_lines: 0,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_number: u32,
    pub passed: bool,
    pub status: CaseStatus,
    /// Wall-clock time of the candidate stage.
    pub elapsed_seconds: f64,
    /// Wall-clock time of every stage of the case.
    pub total_seconds: f64,
    pub peak_memory_mb: f64,
    pub data: CaseData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub kind: PipelineKind,
    pub requested: u32,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    pub all_passed: bool,
    pub cancelled: bool,
    pub cases: Vec<CaseResult>,
}

impl RunOutcome {
    /// Execution errors per role, kept apart from verdict failures.
    pub fn errors_by_role(&self) -> BTreeMap<Role, u32> {
        let mut counts = BTreeMap::new();
        for case in &self.cases {
            if let CaseStatus::ExecutionError { role, .. } = &case.status {
                *counts.entry(*role).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn health(&self) -> String {
        let verdict_failures = self.failed.saturating_sub(self.errored);
        let mut summary = format!(
            "{}/{} passed, {} failed verdict, {} failed to execute",
            self.passed, self.total, verdict_failures, self.errored
        );
        for (role, count) in self.errors_by_role() {
            summary.push_str(&format!("; {role}: {count}"));
        }
        if self.cancelled {
            summary.push_str(&format!(" (stopped after {} of {})", self.total, self.requested));
        }
        summary
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub content: String,
    pub language: Language,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub kind: PipelineKind,
    pub primary_language: Option<Language>,
    pub files: BTreeMap<String, SourceFile>,
}

impl SourceSnapshot {
    pub fn empty(kind: PipelineKind) -> Self {
        Self {
            kind,
            primary_language: None,
            files: BTreeMap::new(),
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.files.values().map(|file| file.role)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    CaseStarted { case_number: u32, total: u32 },
    CaseCompleted(CaseResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roles() {
        assert!(PipelineKind::Comparison.requires(Role::Correct));
        assert!(!PipelineKind::Comparison.requires(Role::Validator));
        assert!(PipelineKind::Validation.requires(Role::Validator));
        assert!(!PipelineKind::Benchmark.requires(Role::Correct));
        assert_eq!(PipelineKind::Benchmark.roles().len(), 2);
    }

    #[test]
    fn test_kind_parsing_accepts_aliases() {
        assert_eq!("Comparator".parse::<PipelineKind>(), Ok(PipelineKind::Comparison));
        assert_eq!("stress".parse::<PipelineKind>(), Ok(PipelineKind::Comparison));
        assert_eq!("validation".parse::<PipelineKind>(), Ok(PipelineKind::Validation));
        assert_eq!("tle".parse::<PipelineKind>(), Ok(PipelineKind::Benchmark));
        assert!("judge".parse::<PipelineKind>().is_err());
    }

    #[test]
    fn test_role_from_file_stem() {
        assert_eq!(Role::from_file_stem("generator"), Some((Role::Generator, 0)));
        assert_eq!(Role::from_file_stem("Correct"), Some((Role::Correct, 0)));
        assert_eq!(Role::from_file_stem("sol"), Some((Role::Correct, 2)));
        assert_eq!(Role::from_file_stem("checker"), Some((Role::Validator, 1)));
        assert_eq!(Role::from_file_stem("brute"), Some((Role::Test, 1)));
        assert_eq!(Role::from_file_stem("testlib"), None);
        assert_eq!(Role::from_file_stem("correct-brute"), None);
        assert_eq!(Role::from_file_stem("generator_old"), None);
    }

    #[test]
    fn test_limits_validation() {
        assert!(Limits::new(1.0, 256.0, 4).is_ok());
        assert_eq!(Limits::new(0.0, 256.0, 4), Err(LimitsError::Time(0.0)));
        assert_eq!(Limits::new(1.0, -1.0, 4), Err(LimitsError::Memory(-1.0)));
        assert_eq!(Limits::new(1.0, 256.0, 0), Err(LimitsError::Workers));
        assert!(Limits::new(f64::NAN, 256.0, 1).is_err());

        let limits = Limits::with_default_workers(0.5, 64.0).unwrap();
        assert!(limits.worker_count() >= 1);
        assert!(limits.worker_count() <= MAX_DEFAULT_WORKERS);
        assert_eq!(limits.candidate_stage().time, Duration::from_millis(500));
        assert_eq!(limits.candidate_stage().memory_mb, Some(64.0));
    }

    #[test]
    fn test_health_separates_errors_from_verdicts() {
        let case = |n, status: CaseStatus| CaseResult {
            case_number: n,
            passed: status.is_accepted(),
            status,
            elapsed_seconds: 0.0,
            total_seconds: 0.0,
            peak_memory_mb: 0.0,
            data: CaseData::empty(PipelineKind::Comparison),
        };
        let outcome = RunOutcome {
            kind: PipelineKind::Comparison,
            requested: 3,
            total: 3,
            passed: 1,
            failed: 2,
            errored: 1,
            all_passed: false,
            cancelled: false,
            cases: vec![
                case(1, CaseStatus::Accepted),
                case(2, CaseStatus::WrongAnswer),
                case(
                    3,
                    CaseStatus::ExecutionError {
                        role: Role::Test,
                        message: "not found".to_string(),
                    },
                ),
            ],
        };

        assert_eq!(outcome.errors_by_role().get(&Role::Test), Some(&1));
        assert_eq!(
            outcome.health(),
            "1/3 passed, 1 failed verdict, 1 failed to execute; test: 1"
        );
    }

    #[test]
    fn test_health_tolerates_inconsistent_counts() {
        let outcome = RunOutcome {
            kind: PipelineKind::Benchmark,
            requested: 2,
            total: 2,
            passed: 2,
            failed: 0,
            errored: 1,
            all_passed: false,
            cancelled: true,
            cases: Vec::new(),
        };

        assert_eq!(
            outcome.health(),
            "2/2 passed, 0 failed verdict, 1 failed to execute (stopped after 2 of 2)"
        );
    }
}
