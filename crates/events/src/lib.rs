//! Clipper job lifecycle events.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEvent`]: one job lifecycle change, tagged with a stable
//!   message type for downstream consumers.

pub mod bus;

pub use bus::{EventBus, JobEvent, JobEventKind};
