pub mod repositories;
pub mod secret_vault;
pub mod source_control;
pub mod stack_runtime;

pub use repositories::*;
pub use secret_vault::{open_string, seal_string, SecretVault};
pub use source_control::{Commit, SourceControl};
pub use stack_runtime::StackRuntime;
