//! Local background job execution for Clipper.
//!
//! - [`queue::JobQueue`]: fixed-size worker pool draining a FIFO of job ids.
//! - [`registry::HandlerRegistry`]: maps each job type to its handler.
//! - [`progress::ProgressReporter`]: the handler's channel back to the
//!   job record, and the point where cancellation is observed.
//! - [`config::WorkerConfig`]: environment-driven settings.

pub mod config;
pub mod progress;
pub mod queue;
pub mod registry;

pub use config::WorkerConfig;
pub use progress::ProgressReporter;
pub use queue::JobQueue;
pub use registry::{HandlerError, HandlerRegistry, JobHandler};
