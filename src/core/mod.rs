pub mod commands;
pub mod domain;
pub mod language;
pub mod pipeline;
pub mod snapshot;
pub mod traits;
