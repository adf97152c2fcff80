#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod receiver;
pub mod source;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
