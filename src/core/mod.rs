//! Shared primitives under the engine: errors, configuration, the
//! journal, the mutation lock and the subprocess runner.

pub mod config;
pub mod error;
pub mod journal;
pub mod lock;
pub mod output;
pub mod probe;
pub mod process;
pub mod time;
