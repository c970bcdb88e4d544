pub mod database;
pub mod logging;
pub mod process;
pub mod runtime;
pub mod vault;
