//! Vayam invitation dispatch pipeline
//!
//! Queues one email job per pending recipient of a question, sends them from a
//! rate-limited worker pool and tracks per-batch progress in Redis for polling
//! clients.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
