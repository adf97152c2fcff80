//! Domain model module declarations.

pub mod chunk;
pub mod progress;
pub mod session;
