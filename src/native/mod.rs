/// Native module runs stages as plain child processes, enforcing limits
/// through process groups and `/proc` sampling instead of containers.
pub mod executor;
pub mod memory;
