//! Upload orchestration.
//!
//! Covers chunk scheduling with retry and backoff, finalize, the event
//! stream observers subscribe to, and the coordinator tying them together.

pub mod backoff;
pub mod coordinator;
pub mod events;
pub mod finalize;
pub mod scheduler;
