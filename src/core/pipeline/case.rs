use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    constants::{CASE_NUMBER_ENV, UNCONSTRAINED_STAGE_TIMEOUT},
    core::{
        domain::{
            CaseData, CaseResult, CaseStatus, Limits, LineMismatch, PipelineKind, Role,
            StageLimits, StageOutcome, StageRequest,
        },
        pipeline::{
            matching::{OutputMatcher, first_mismatch},
            plan::{Checker, PipelinePlan},
        },
        traits::executor::StageExecutor,
    },
};

/// Runs the stages of a single case: generate, run the candidate, check.
#[derive(Clone, Debug)]
pub struct CaseRunner {
    executor: Arc<dyn StageExecutor>,
    plan: Arc<PipelinePlan>,
    limits: Limits,
    matcher: Arc<dyn OutputMatcher>,
    scratch_dir: Option<PathBuf>,
}

/// Result of a stage that runs without caller limits.
enum HelperStage {
    Done(StageOutcome),
    Cancelled,
    Failed(String),
}

/// Collects what a case produced so far; turned into a `CaseResult` once a verdict exists.
struct CaseProgress {
    case_number: u32,
    kind: PipelineKind,
    elapsed_seconds: f64,
    total_seconds: f64,
    peak_memory_mb: f64,
    input: String,
    output: String,
    expected_output: String,
    first_mismatch: Option<LineMismatch>,
    candidate_exit_code: Option<i32>,
    validator_exit_code: Option<i32>,
    validation_message: String,
}

impl CaseProgress {
    fn new(case_number: u32, kind: PipelineKind) -> Self {
        Self {
            case_number,
            kind,
            elapsed_seconds: 0.0,
            total_seconds: 0.0,
            peak_memory_mb: 0.0,
            input: String::new(),
            output: String::new(),
            expected_output: String::new(),
            first_mismatch: None,
            candidate_exit_code: None,
            validator_exit_code: None,
            validation_message: String::new(),
        }
    }

    fn finish(self, status: CaseStatus) -> CaseResult {
        let data = match self.kind {
            PipelineKind::Comparison => CaseData::Comparison {
                input: self.input,
                expected_output: self.expected_output,
                actual_output: self.output,
                first_mismatch: self.first_mismatch,
            },
            PipelineKind::Validation => CaseData::Validation {
                input: self.input,
                output: self.output,
                validator_exit_code: self.validator_exit_code,
                validation_message: self.validation_message,
            },
            PipelineKind::Benchmark => CaseData::Benchmark {
                input_lines: self.input.trim().lines().count(),
                input: self.input,
                output: self.output,
                exit_code: self.candidate_exit_code,
            },
        };
        CaseResult {
            case_number: self.case_number,
            passed: status.is_accepted(),
            status,
            elapsed_seconds: self.elapsed_seconds,
            total_seconds: self.total_seconds,
            peak_memory_mb: self.peak_memory_mb,
            data,
        }
    }

    fn error(self, role: Role, message: String) -> CaseResult {
        tracing::error!(case = self.case_number, %role, "Execution error: {}", message);
        self.finish(CaseStatus::ExecutionError { role, message })
    }
}

fn unconstrained() -> StageLimits {
    StageLimits {
        time: UNCONSTRAINED_STAGE_TIMEOUT,
        memory_mb: None,
    }
}

fn stderr_excerpt(outcome: &StageOutcome) -> String {
    outcome.stderr_lossy().trim().to_string()
}

impl CaseRunner {
    pub fn new(
        executor: Arc<dyn StageExecutor>,
        plan: Arc<PipelinePlan>,
        limits: Limits,
        matcher: Arc<dyn OutputMatcher>,
        scratch_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            executor,
            plan,
            limits,
            matcher,
            scratch_dir,
        }
    }

    /// Runs one case to a verdict. `None` means the case was cancelled
    /// before it reached one.
    #[tracing::instrument(skip(self, cancel), fields(kind = %self.plan.kind))]
    pub async fn run_case(&self, case_number: u32, cancel: CancellationToken) -> Option<CaseResult> {
        let mut progress = CaseProgress::new(case_number, self.plan.kind);

        let generated = match self
            .helper_stage(Role::Generator, &self.plan.generator, Vec::new(), case_number, &cancel)
            .await
        {
            HelperStage::Done(outcome) => outcome,
            HelperStage::Cancelled => return None,
            HelperStage::Failed(message) => return Some(progress.error(Role::Generator, message)),
        };
        progress.total_seconds += generated.elapsed_seconds;
        progress.input = generated.stdout_lossy();
        tracing::debug!(case_number, bytes = generated.stdout.len(), "Input generated");

        let candidate = match self
            .executor
            .run(
                self.request(
                    self.plan.candidate.clone(),
                    generated.stdout.clone(),
                    self.limits.candidate_stage(),
                    case_number,
                ),
                cancel.clone(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return Some(progress.error(Role::Test, e.to_string())),
        };
        if candidate.cancelled {
            return None;
        }
        progress.elapsed_seconds = candidate.elapsed_seconds;
        progress.total_seconds += candidate.elapsed_seconds;
        progress.peak_memory_mb = candidate.peak_memory_mb;
        progress.output = candidate.stdout_lossy();
        progress.candidate_exit_code = Some(candidate.exit_code);

        if candidate.timed_out {
            return Some(progress.finish(CaseStatus::TimeLimitExceeded));
        }
        if candidate.killed_for_memory {
            return Some(progress.finish(CaseStatus::MemoryLimitExceeded));
        }

        match &self.plan.checker {
            Checker::ResourcesOnly => Some(progress.finish(CaseStatus::Accepted)),
            _ if candidate.exit_code != 0 => Some(progress.finish(CaseStatus::RuntimeError {
                exit_code: candidate.exit_code,
            })),
            Checker::Reference(argv) => {
                self.compare(argv, progress, &generated, &candidate, &cancel)
                    .await
            }
            Checker::Validator(argv) => {
                self.validate(argv, progress, &generated, &candidate, &cancel)
                    .await
            }
        }
    }

    async fn compare(
        &self,
        argv: &[String],
        mut progress: CaseProgress,
        generated: &StageOutcome,
        candidate: &StageOutcome,
        cancel: &CancellationToken,
    ) -> Option<CaseResult> {
        let case_number = progress.case_number;
        let reference = match self
            .helper_stage(Role::Correct, argv, generated.stdout.clone(), case_number, cancel)
            .await
        {
            HelperStage::Done(outcome) => outcome,
            HelperStage::Cancelled => return None,
            HelperStage::Failed(message) => return Some(progress.error(Role::Correct, message)),
        };
        progress.total_seconds += reference.elapsed_seconds;
        progress.expected_output = reference.stdout_lossy();

        if self.matcher.matches(&reference.stdout, &candidate.stdout) {
            return Some(progress.finish(CaseStatus::Accepted));
        }
        progress.first_mismatch = first_mismatch(&progress.expected_output, &progress.output);
        Some(progress.finish(CaseStatus::WrongAnswer))
    }

    /// The validator gets `<input file> <output file>` as trailing arguments and,
    /// on stdin, the input followed by the candidate's output. The input is
    /// terminated with a newline first if it lacks one.
    async fn validate(
        &self,
        argv: &[String],
        mut progress: CaseProgress,
        generated: &StageOutcome,
        candidate: &StageOutcome,
        cancel: &CancellationToken,
    ) -> Option<CaseResult> {
        let case_number = progress.case_number;
        let Some(scratch_dir) = &self.scratch_dir else {
            return Some(progress.error(Role::Validator, "no scratch directory".to_string()));
        };
        let input_path = scratch_dir.join(format!("input_{case_number}.txt"));
        let output_path = scratch_dir.join(format!("output_{case_number}.txt"));
        let written = match tokio::fs::write(&input_path, &generated.stdout).await {
            Ok(()) => tokio::fs::write(&output_path, &candidate.stdout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            remove_scratch(&[&input_path, &output_path]).await;
            return Some(progress.error(
                Role::Validator,
                format!("failed to write scratch files: {e}"),
            ));
        }

        let mut validator_argv = argv.to_vec();
        validator_argv.push(input_path.display().to_string());
        validator_argv.push(output_path.display().to_string());

        let mut stdin = generated.stdout.clone();
        if !stdin.is_empty() && !stdin.ends_with(b"\n") {
            stdin.push(b'\n');
        }
        stdin.extend_from_slice(&candidate.stdout);

        let result = self
            .executor
            .run(
                self.request(validator_argv, stdin, unconstrained(), case_number),
                cancel.clone(),
            )
            .await;
        remove_scratch(&[&input_path, &output_path]).await;

        let validator = match result {
            Ok(outcome) => outcome,
            Err(e) => return Some(progress.error(Role::Validator, e.to_string())),
        };
        if validator.cancelled {
            return None;
        }
        progress.total_seconds += validator.elapsed_seconds;
        if validator.timed_out {
            return Some(progress.error(
                Role::Validator,
                format!(
                    "validator timed out after {:.1}s",
                    UNCONSTRAINED_STAGE_TIMEOUT.as_secs_f64()
                ),
            ));
        }

        progress.validator_exit_code = Some(validator.exit_code);
        let message = |default: &str| {
            [validator.stderr_lossy(), validator.stdout_lossy()]
                .into_iter()
                .map(|text| text.trim().to_string())
                .find(|text| !text.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let status = match validator.exit_code {
            0 => {
                progress.validation_message = message("Correct");
                CaseStatus::Accepted
            }
            1 => {
                progress.validation_message = message("Wrong Answer");
                CaseStatus::WrongAnswer
            }
            2 => {
                progress.validation_message = message("Presentation Error");
                CaseStatus::PresentationError
            }
            code => {
                let message = format!(
                    "validator exited with code {code}: {}",
                    stderr_excerpt(&validator)
                );
                progress.validation_message = message.clone();
                return Some(progress.error(Role::Validator, message));
            }
        };
        Some(progress.finish(status))
    }

    /// Generator and reference stages: anything but a clean exit is an execution error.
    async fn helper_stage(
        &self,
        role: Role,
        argv: &[String],
        stdin: Vec<u8>,
        case_number: u32,
        cancel: &CancellationToken,
    ) -> HelperStage {
        let request = self.request(argv.to_vec(), stdin, unconstrained(), case_number);
        match self.executor.run(request, cancel.clone()).await {
            Err(e) => HelperStage::Failed(e.to_string()),
            Ok(outcome) if outcome.cancelled => HelperStage::Cancelled,
            Ok(outcome) if outcome.timed_out => HelperStage::Failed(format!(
                "{role} timed out after {:.1}s",
                UNCONSTRAINED_STAGE_TIMEOUT.as_secs_f64()
            )),
            Ok(outcome) if outcome.exit_code != 0 => HelperStage::Failed(format!(
                "{role} exited with code {}: {}",
                outcome.exit_code,
                stderr_excerpt(&outcome)
            )),
            Ok(outcome) => HelperStage::Done(outcome),
        }
    }

    fn request(
        &self,
        argv: Vec<String>,
        stdin: Vec<u8>,
        limits: StageLimits,
        case_number: u32,
    ) -> StageRequest {
        StageRequest {
            argv,
            stdin,
            limits,
            env: vec![(CASE_NUMBER_ENV.to_string(), case_number.to_string())],
        }
    }
}

async fn remove_scratch(paths: &[&PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove scratch file {}: {}", path.display(), e);
            }
        }
    }
}
