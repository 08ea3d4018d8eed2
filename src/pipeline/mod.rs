//! Incremental, idempotent triage pipeline.
//!
//! Every trigger for a mailbox flows through:
//! 1. `MailboxScheduler::submit()`: coalesces triggers, one worker per mailbox
//! 2. `TriageOrchestrator::run_batch()`: load watermark, resolve, process, commit
//! 3. `ChangeResolver` → `MessageFetcher` → `ClassifierGateway` → `ActionExecutor`
//!
//! The watermark is the only state that outlives a batch, and it is only
//! committed once every record at or below it has settled.

pub mod classifier;
pub mod dedup;
pub mod executor;
pub mod fetcher;
pub mod heuristic;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use orchestrator::{Boundaries, TriageOrchestrator};
pub use report::{BatchReport, CommitStatus, MessageOutcome, Recovery, Settlement};
pub use scheduler::{MailboxScheduler, ShutdownSignal, ShutdownTrigger, Submission, shutdown_channel};
