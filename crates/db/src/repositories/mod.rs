//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async CRUD methods
//! that accept `&SqlitePool` as the first argument.

pub mod job_repo;

pub use job_repo::{JobRepo, SqliteJobStore};
