use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::core::domain::{CaseResult, PipelineKind, RunOutcome};

/// Collects case results from concurrent workers.
///
/// Counters are live while the run progresses; [`ResultAggregator::finalize`]
/// freezes the outcome on its first call.
#[derive(Debug)]
pub struct ResultAggregator {
    kind: PipelineKind,
    cases: DashMap<u32, CaseResult>,
    passed: AtomicU32,
    failed: AtomicU32,
    errored: AtomicU32,
    outcome: OnceLock<RunOutcome>,
}

impl ResultAggregator {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            cases: DashMap::new(),
            passed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            errored: AtomicU32::new(0),
            outcome: OnceLock::new(),
        }
    }

    /// Stores `result`. A case number recorded twice keeps its first result.
    pub fn record(&self, result: CaseResult) {
        if self.outcome.get().is_some() {
            tracing::warn!(case = result.case_number, "Result arrived after finalize, ignoring");
            return;
        }

        let entry = self.cases.entry(result.case_number);
        if let Entry::Occupied(_) = entry {
            tracing::warn!(case = result.case_number, "Duplicate case result, ignoring");
            return;
        }

        if result.passed {
            self.passed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
            if result.status.is_execution_error() {
                self.errored.fetch_add(1, Ordering::SeqCst);
            }
        }
        entry.or_insert(result);
    }

    pub fn passed(&self) -> u32 {
        self.passed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn errored(&self) -> u32 {
        self.errored.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u32 {
        self.passed() + self.failed()
    }

    /// Builds the run outcome with cases sorted by number. Later calls return
    /// the first outcome unchanged.
    pub fn finalize(&self, requested: u32, cancelled: bool) -> RunOutcome {
        self.outcome
            .get_or_init(|| {
                let mut cases: Vec<CaseResult> =
                    self.cases.iter().map(|entry| entry.value().clone()).collect();
                cases.sort_by_key(|case| case.case_number);

                let passed = self.passed();
                let failed = self.failed();
                let total = passed + failed;
                RunOutcome {
                    kind: self.kind,
                    requested,
                    total,
                    passed,
                    failed,
                    errored: self.errored(),
                    all_passed: !cancelled && failed == 0 && total == requested,
                    cancelled,
                    cases,
                }
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::stream::{FuturesUnordered, StreamExt};

    use super::*;
    use crate::core::domain::{CaseData, CaseStatus, Role};

    fn result(case_number: u32, status: CaseStatus) -> CaseResult {
        CaseResult {
            case_number,
            passed: status.is_accepted(),
            status,
            elapsed_seconds: 0.1,
            total_seconds: 0.2,
            peak_memory_mb: 1.0,
            data: CaseData::empty(PipelineKind::Validation),
        }
    }

    #[test]
    fn test_counts_and_sorting() {
        let aggregator = ResultAggregator::new(PipelineKind::Validation);
        aggregator.record(result(3, CaseStatus::WrongAnswer));
        aggregator.record(result(1, CaseStatus::Accepted));
        aggregator.record(result(
            2,
            CaseStatus::ExecutionError {
                role: Role::Validator,
                message: "exited with code 3".to_string(),
            },
        ));

        assert_eq!(aggregator.passed(), 1);
        assert_eq!(aggregator.failed(), 2);
        assert_eq!(aggregator.errored(), 1);

        let outcome = aggregator.finalize(3, false);
        assert_eq!(outcome.total, 3);
        assert!(!outcome.all_passed);
        assert_eq!(
            outcome.cases.iter().map(|c| c.case_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_duplicate_case_is_ignored() {
        let aggregator = ResultAggregator::new(PipelineKind::Validation);
        aggregator.record(result(1, CaseStatus::Accepted));
        aggregator.record(result(1, CaseStatus::WrongAnswer));

        let outcome = aggregator.finalize(1, false);
        assert_eq!(outcome.total, 1);
        assert!(outcome.all_passed);
        assert_eq!(outcome.cases[0].status, CaseStatus::Accepted);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let aggregator = ResultAggregator::new(PipelineKind::Validation);
        aggregator.record(result(1, CaseStatus::Accepted));

        let first = aggregator.finalize(5, true);
        aggregator.record(result(2, CaseStatus::WrongAnswer));
        let second = aggregator.finalize(5, false);

        assert_eq!(first, second);
        assert!(first.cancelled);
        assert!(!first.all_passed);
        assert_eq!(first.total, 1);
        assert_eq!(first.requested, 5);
    }

    #[tokio::test]
    async fn test_concurrent_record() {
        let aggregator = Arc::new(ResultAggregator::new(PipelineKind::Validation));
        let mut tasks = (1..=200)
            .map(|n| {
                let aggregator = aggregator.clone();
                tokio::spawn(async move {
                    let status = if n % 4 == 0 {
                        CaseStatus::WrongAnswer
                    } else {
                        CaseStatus::Accepted
                    };
                    aggregator.record(result(n, status));
                })
            })
            .collect::<FuturesUnordered<_>>();
        while let Some(joined) = tasks.next().await {
            joined.unwrap();
        }

        let outcome = aggregator.finalize(200, false);
        assert_eq!(outcome.total, 200);
        assert_eq!(outcome.passed, 150);
        assert_eq!(outcome.failed, 50);
        assert_eq!(outcome.cases.len(), 200);
    }
}
