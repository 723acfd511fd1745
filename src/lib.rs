#[cfg(not(unix))]
compile_error!("supervisor only supports unix targets");

pub mod clienv;
pub mod daemon;
pub mod error;
pub mod fs;
pub mod supervisor_config;

pub use error::{Result, SupervisorError};
pub use supervisor_config::SupervisorConfig;
