//! Core data models for the tape archival pipeline.
//!
//! These entities represent jobs in flight, ledger rows, and tape volumes.
//! They map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod job;
pub mod tape;
pub mod upload;
