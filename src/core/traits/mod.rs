pub mod executor;
pub mod sink;
