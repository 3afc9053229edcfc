//! tape-archive: a worker daemon that drains an upload intake queue and
//! archives staged files onto group-affine tape volumes. Every upload is
//! tracked in a SQLite ledger through `pending -> processing ->
//! completed | failed`, and owners and admins are notified over webhooks
//! on a best-effort basis.

pub mod config;
pub mod db;
pub mod models;
pub mod processor;
pub mod queue;
pub mod services;
