//! Persistence layer: per-mailbox cursor records.
//!
//! The cursor is the only state shared across batch invocations. Everything
//! else the pipeline touches is batch-local.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlCursorStore;
pub use memory::InMemoryCursorStore;
pub use traits::{CursorRecord, CursorStore};
