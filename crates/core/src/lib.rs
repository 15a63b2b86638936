//! Core job engine domain for the Clipper generation backend.
//!
//! Pure types and policies shared by the store, worker pool, and
//! orchestrator crates:
//!
//! - [`job`]: job model, type tags, and the status state machine.
//! - [`job_store`]: the persistence contract plus an in-memory store.
//! - [`retry_ladder`]: degrade-on-memory-exhaustion retry policy.
//! - [`oom`]: memory-exhaustion failure classification.

pub mod error;
pub mod job;
pub mod job_store;
pub mod oom;
pub mod retry_ladder;
pub mod types;
