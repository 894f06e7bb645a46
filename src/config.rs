use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use crate::core::{
    commands::{CommandError, CommandSet},
    domain::{Limits, LimitsError, PipelineKind, Role, default_worker_count},
    pipeline::matching::{ExactMatch, OutputMatcher, TrailingWhitespaceInsensitive},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CompareMode {
    /// Byte-for-byte equality
    Exact,
    /// Ignore trailing whitespace on each line and trailing blank lines
    Trim,
}

/// Runs generated test cases against a candidate program.
#[derive(Parser, Debug)]
#[command(name = "stress-runner", version)]
pub struct Config {
    /// Workspace holding the `comparator/`, `validator/` and `benchmarker/` directories
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub workspace: PathBuf,

    /// Pipeline to run: comparison, validation or benchmark
    #[arg(long, short)]
    pub kind: PipelineKind,

    /// Number of cases to run
    #[arg(long, short = 'n', default_value_t = 10)]
    pub tests: u32,

    /// Candidate time limit in seconds
    #[arg(long, default_value_t = 1.0)]
    pub time_limit: f64,

    /// Candidate memory limit in megabytes
    #[arg(long, default_value_t = 256.0)]
    pub memory_limit: f64,

    /// Cases in flight at once (defaults to one per spare core)
    #[arg(long, short)]
    pub workers: Option<usize>,

    #[arg(long, value_enum, default_value_t = CompareMode::Trim)]
    pub compare: CompareMode,

    /// Generator command, overriding workspace lookup
    #[arg(long, value_name = "CMD")]
    pub generator: Option<String>,

    /// Candidate command, overriding workspace lookup
    #[arg(long = "test", value_name = "CMD")]
    pub candidate: Option<String>,

    /// Reference solution command, overriding workspace lookup
    #[arg(long, value_name = "CMD")]
    pub correct: Option<String>,

    /// Validator command, overriding workspace lookup
    #[arg(long, value_name = "CMD")]
    pub validator: Option<String>,

    /// File or directory receiving the JSON run record
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Where per-run scratch directories are created
    #[arg(long, value_name = "DIR")]
    pub scratch_root: Option<PathBuf>,
}

impl Config {
    pub fn limits(&self) -> Result<Limits, LimitsError> {
        Limits::new(
            self.time_limit,
            self.memory_limit,
            self.workers.unwrap_or_else(default_worker_count),
        )
    }

    pub fn matcher(&self) -> Arc<dyn OutputMatcher> {
        match self.compare {
            CompareMode::Exact => Arc::new(ExactMatch),
            CompareMode::Trim => Arc::new(TrailingWhitespaceInsensitive),
        }
    }

    /// Explicit overrides first, the workspace fills in the rest.
    pub fn commands(&self) -> Result<CommandSet, CommandError> {
        let mut commands = CommandSet::new();
        let overrides = [
            (Role::Generator, &self.generator),
            (Role::Test, &self.candidate),
            (Role::Correct, &self.correct),
            (Role::Validator, &self.validator),
        ];
        for (role, line) in overrides {
            if let Some(line) = line.as_deref().filter(|_| self.kind.requires(role)) {
                commands.set_from_line(role, line)?;
            }
        }
        commands.resolve_workspace(&self.workspace, self.kind)?;
        Ok(commands)
    }
}
