//! In-process health monitoring agent.
//!
//! Samples process health on timers, keeps local time aligned with the
//! collector's clock, and ships windowed metric snapshots upstream.

pub mod agent;
pub mod config;
pub mod export;
pub mod metrics;
pub mod probes;
pub mod retry;
pub mod sizecache;
pub mod timesync;
