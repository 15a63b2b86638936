//! Memory-exhaustion failure classification.
//!
//! Generation engines report allocation failures as free-form text, and
//! the phrasing differs per backend. Classification sits behind
//! [`FailureClassifier`] so the retry ladder never matches strings itself.

/// Decides whether a failure description means "ran out of memory".
pub trait FailureClassifier: Send + Sync {
    fn is_resource_exhaustion(&self, message: &str) -> bool;
}

/// Phrases reported by common accelerator and CPU allocators, lowercase.
pub const DEFAULT_OOM_PHRASES: &[&str] = &[
    "out of memory",
    "cuda error: out of memory",
    "cublas_status_alloc_failed",
    "cudnn_status_alloc_failed",
    "hip out of memory",
    "mps backend out of memory",
    "not enough memory",
    "failed to allocate memory",
    "can't allocate memory",
    "oom when allocating",
    "std::bad_alloc",
];

/// Case-insensitive substring classifier.
#[derive(Debug, Clone)]
pub struct PhraseClassifier {
    phrases: Vec<String>,
}

impl PhraseClassifier {
    pub fn new(phrases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .collect(),
        }
    }

    /// Add another phrase, e.g. for a new execution engine.
    pub fn with_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.phrases.push(phrase.into().to_lowercase());
        self
    }
}

impl Default for PhraseClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_OOM_PHRASES.iter().copied())
    }
}

impl FailureClassifier for PhraseClassifier {
    fn is_resource_exhaustion(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }
}

/// Releases cached accelerator memory between ladder rungs.
pub trait MemoryReclaimer: Send + Sync {
    fn release_cached_memory(&self);
}

/// Reclaimer for backends with nothing to release.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReclaimer;

impl MemoryReclaimer for NoopReclaimer {
    fn release_cached_memory(&self) {}
}
