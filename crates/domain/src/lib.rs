//! Core domain model shared by every Hi-Boss crate: addresses, envelopes,
//! agents, cron schedules, run audit records, and the time/ID helpers the
//! daemon builds on.

pub mod address;
pub mod agent;
pub mod cron;
pub mod envelope;
pub mod error;
pub mod id;
pub mod run;
pub mod time;

pub use address::Address;
pub use error::{Error, Result};
