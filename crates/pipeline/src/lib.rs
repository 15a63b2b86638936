//! Content-generation job handlers for Clipper.
//!
//! [`orchestrator::GenerationOrchestrator`] turns each job type into calls
//! on opaque generation collaborators ([`collaborators`]), runs the
//! expensive ones on blocking threads behind the retry ladder, writes the
//! outputs under the project directory, and records them as assets.

pub mod collaborators;
pub mod orchestrator;
pub mod params;
pub mod storyboard;

pub use collaborators::GenerationError;
pub use orchestrator::{Collaborators, GenerationOrchestrator, PipelineConfig};
