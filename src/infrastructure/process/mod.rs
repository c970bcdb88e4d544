pub mod runner;

pub use runner::{CommandOutput, CommandSpec, ProcessError, ProcessRunner};
