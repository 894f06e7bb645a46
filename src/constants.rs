use std::time::Duration;

/// Tick of the per-stage memory sampler. Lower values catch shorter peaks
/// at the cost of more `/proc` reads.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Safety net for stages that run without caller limits (generator, reference, validator).
pub const UNCONSTRAINED_STAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Progress events buffered per run before new ones are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub const MAX_DEFAULT_WORKERS: usize = 8;

pub const BYTES_IN_MB: f64 = 1024.0 * 1024.0;

/// Set for every stage to the 1-based number of its case.
pub const CASE_NUMBER_ENV: &str = "STRESS_CASE_NUMBER";

pub const SCRATCH_DIR_PREFIX: &str = "stress_";

/// How long output pipes may stay open after the stage's process group is gone.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);
