//! Watchtower - synthetic uptime monitoring.
//!
//! Probes registered HTTP endpoints on their own cadence, records every
//! check, derives rolling uptime statistics, guards each endpoint with
//! a circuit breaker, streams live updates to dashboard sessions, and
//! compacts old detail rows into hourly and daily aggregates.

pub mod breaker;
pub mod bus;
pub mod config;
pub mod db;
pub mod engine;
pub mod monitor;
pub mod retention;
