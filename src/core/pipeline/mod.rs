pub mod aggregator;
pub mod case;
pub mod matching;
pub mod plan;
pub mod scheduler;
