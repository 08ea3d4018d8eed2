//! Mail Triage: incremental, idempotent urgent-mail triage.

pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
