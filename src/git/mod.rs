//! Git Sync: CLI-backed working copies, per-operation credential staging,
//! path confinement and ref validation.

pub mod auth;
pub mod paths;
pub mod refs;
pub mod sync;

pub use auth::StagedAuth;
pub use paths::{confine, validate_relative};
pub use refs::{validate_ref, validate_ref_name};
pub use sync::GitCliSync;
