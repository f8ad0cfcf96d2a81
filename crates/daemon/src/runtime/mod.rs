//! Daemon runtime: scheduling, routing, cron materialization, per-agent
//! execution, and the adapter bridge.

pub mod bridge;
pub mod cron;
pub mod executor;
pub mod materializer;
pub mod router;
pub mod scheduler;
pub mod session_policy;
pub mod turn_input;
