use tokio_util::sync::CancellationToken;

use crate::core::domain::{StageOutcome, StageRequest};

/// Runs a single pipeline stage as a child process.
///
/// Limit violations and cancellation are reported through the flags of
/// [`StageOutcome`]; `Err` is reserved for failures to run the stage at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait StageExecutor: std::fmt::Debug + Send + Sync {
    async fn run(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, ExecError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,
    #[error("executable not found: {program}")]
    NotFound { program: String },
    #[error("permission denied: {program}")]
    PermissionDenied { program: String },
    #[error("failed to spawn {program}: {msg}")]
    Spawn { program: String, msg: String },
    #[error("i/o error while running stage: {msg}")]
    Io { msg: String },
}

impl ExecError {
    pub fn from_spawn(program: &str, err: std::io::Error) -> Self {
        let program = program.to_string();
        match err.kind() {
            std::io::ErrorKind::NotFound => ExecError::NotFound { program },
            std::io::ErrorKind::PermissionDenied => ExecError::PermissionDenied { program },
            _ => ExecError::Spawn {
                program,
                msg: err.to_string(),
            },
        }
    }
}
