use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{StageOutcome, StageRequest},
    traits::executor::{ExecError, StageExecutor},
};

/// Answers every stage with the same canned result after `delay`.
#[derive(Debug, Clone)]
pub struct ExecutorStub {
    result: Result<StageOutcome, ExecError>,
    delay: Duration,
}

impl ExecutorStub {
    pub fn new(result: Result<StageOutcome, ExecError>, delay: Duration) -> Self {
        Self { result, delay }
    }

    /// A stage that exits with 0 and prints `stdout`.
    pub fn succeeding(stdout: &str, delay: Duration) -> Self {
        Self::new(
            Ok(StageOutcome {
                stdout: stdout.as_bytes().to_vec(),
                ..StageOutcome::default()
            }),
            delay,
        )
    }
}

#[async_trait::async_trait]
impl StageExecutor for ExecutorStub {
    #[tracing::instrument(skip(self, cancel))]
    async fn run(
        &self,
        request: StageRequest,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, ExecError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                tracing::debug!("Stage cancelled");
                return Ok(StageOutcome {
                    cancelled: true,
                    exit_code: -1,
                    ..StageOutcome::default()
                });
            }
        }
        tracing::debug!("Execution result: {:?}", self.result);

        self.result.clone()
    }
}
