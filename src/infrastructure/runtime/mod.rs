pub mod compose_runtime;
pub mod health;

pub use compose_runtime::ComposeStackRuntime;
pub use health::HealthCheck;
