pub mod sqlite_store;
mod build_config_repo;
mod build_request_repo;
mod deployment_repo;
mod git_repository_repo;
mod webhook_event_repo;

pub use sqlite_store::SqliteStore;
