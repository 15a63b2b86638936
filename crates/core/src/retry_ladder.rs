//! Adaptive generation policy: degrade the resource budget on memory
//! exhaustion instead of failing the job outright.
//!
//! A ladder run tries up to three rungs of decreasing cost:
//!
//! | Rung | Envelope                               | Steps            |
//! |------|----------------------------------------|------------------|
//! | 0    | requested                              | requested        |
//! | 1    | each side x 80%, aligned down to 64    | requested        |
//! | 2    | rung 1 envelope                        | requested x 70%  |
//!
//! Only memory-exhaustion failures move to the next rung. Any other
//! failure, or exhaustion on the last rung, ends the run with the last
//! failure's description. The ladder never varies the seed; the caller's
//! attempt closure owns it, so a fixed seed always selects the same rung.
//!
//! The ladder is synchronous: it is meant to run on the blocking thread
//! that performs the generation itself.

use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;

use crate::oom::{FailureClassifier, MemoryReclaimer, NoopReclaimer, PhraseClassifier};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Default per-side scale for rung 1, in percent.
pub const DEFAULT_DIMENSION_SCALE_PCT: u32 = 80;

/// Default step scale for rung 2, in percent.
pub const DEFAULT_STEP_SCALE_PCT: u32 = 70;

/// Diffusion pipelines want sides in multiples of 64.
pub const DEFAULT_ALIGNMENT: u32 = 64;

/// Smallest side a degraded rung may produce.
pub const DEFAULT_MIN_DIMENSION: u32 = 320;

/// Shape of the rung list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderPolicy {
    pub dimension_scale_pct: u32,
    pub step_scale_pct: u32,
    pub alignment: u32,
    pub min_dimension: u32,
}

impl Default for LadderPolicy {
    fn default() -> Self {
        Self {
            dimension_scale_pct: DEFAULT_DIMENSION_SCALE_PCT,
            step_scale_pct: DEFAULT_STEP_SCALE_PCT,
            alignment: DEFAULT_ALIGNMENT,
            min_dimension: DEFAULT_MIN_DIMENSION,
        }
    }
}

/// One resource tier of a ladder run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rung {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
}

impl LadderPolicy {
    /// Build the ordered rung list for a requested envelope.
    pub fn rungs(&self, width: u32, height: u32, steps: u32) -> Vec<Rung> {
        let reduced_width = self.shrink_side(width);
        let reduced_height = self.shrink_side(height);
        vec![
            Rung {
                index: 0,
                width,
                height,
                steps,
            },
            Rung {
                index: 1,
                width: reduced_width,
                height: reduced_height,
                steps,
            },
            Rung {
                index: 2,
                width: reduced_width,
                height: reduced_height,
                steps: self.shrink_steps(steps),
            },
        ]
    }

    /// Scale a side down, align it, and keep it above the floor.
    ///
    /// The floor never exceeds the requested side, so a small request is
    /// not inflated by a degraded rung.
    fn shrink_side(&self, side: u32) -> u32 {
        let alignment = u64::from(self.alignment.max(1));
        let scaled = u64::from(side) * u64::from(self.dimension_scale_pct) / 100;
        let aligned = (scaled / alignment * alignment) as u32;
        aligned.max(self.min_dimension.min(side))
    }

    fn shrink_steps(&self, steps: u32) -> u32 {
        let scaled = u64::from(steps) * u64::from(self.step_scale_pct) / 100;
        (scaled as u32).max(1)
    }
}

// ---------------------------------------------------------------------------
// Outcome / error
// ---------------------------------------------------------------------------

/// A successful ladder run.
#[derive(Debug, Clone)]
pub struct LadderOutcome<T> {
    pub value: T,
    /// The rung that succeeded.
    pub rung: Rung,
    /// A memory-exhaustion failure was seen on an earlier rung, so the
    /// output is lower quality than requested.
    pub oom_recovered: bool,
}

/// Serializable summary of which rung produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LadderReport {
    pub rung_index: usize,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub oom_recovered: bool,
}

impl<T> LadderOutcome<T> {
    pub fn report(&self) -> LadderReport {
        LadderReport {
            rung_index: self.rung.index,
            width: self.rung.width,
            height: self.rung.height,
            steps: self.rung.steps,
            oom_recovered: self.oom_recovered,
        }
    }
}

/// The ladder gave up. Displays exactly the last failure's description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct LadderError {
    /// Rung of the final failed attempt.
    pub rung_index: usize,
    pub message: String,
    /// Whether the final failure was itself memory exhaustion.
    pub resource_exhausted: bool,
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

/// Runs one expensive attempt under a declining resource budget.
#[derive(Clone)]
pub struct RetryLadder {
    policy: LadderPolicy,
    classifier: Arc<dyn FailureClassifier>,
    reclaimer: Arc<dyn MemoryReclaimer>,
}

impl Default for RetryLadder {
    fn default() -> Self {
        Self::new(
            LadderPolicy::default(),
            Arc::new(PhraseClassifier::default()),
            Arc::new(NoopReclaimer),
        )
    }
}

impl RetryLadder {
    pub fn new(
        policy: LadderPolicy,
        classifier: Arc<dyn FailureClassifier>,
        reclaimer: Arc<dyn MemoryReclaimer>,
    ) -> Self {
        Self {
            policy,
            classifier,
            reclaimer,
        }
    }

    pub fn policy(&self) -> &LadderPolicy {
        &self.policy
    }

    /// Execute `attempt` rung by rung until it succeeds, fails for a reason
    /// other than memory exhaustion, or the rungs run out.
    pub fn run<T, E, F>(
        &self,
        width: u32,
        height: u32,
        steps: u32,
        mut attempt: F,
    ) -> Result<LadderOutcome<T>, LadderError>
    where
        E: Display,
        F: FnMut(&Rung) -> Result<T, E>,
    {
        let mut rungs = self.policy.rungs(width, height, steps).into_iter().peekable();
        let mut oom_seen = false;

        loop {
            let Some(rung) = rungs.next() else {
                // Only reachable with an empty rung list.
                return Err(LadderError {
                    rung_index: 0,
                    message: "no generation attempts were configured".to_string(),
                    resource_exhausted: false,
                });
            };

            let message = match attempt(&rung) {
                Ok(value) => {
                    if oom_seen {
                        tracing::info!(
                            rung = rung.index,
                            width = rung.width,
                            height = rung.height,
                            steps = rung.steps,
                            "Generation succeeded on a degraded rung",
                        );
                    }
                    return Ok(LadderOutcome {
                        value,
                        rung,
                        oom_recovered: oom_seen,
                    });
                }
                Err(e) => e.to_string(),
            };

            let exhausted = self.classifier.is_resource_exhaustion(&message);
            if !exhausted || rungs.peek().is_none() {
                tracing::warn!(
                    rung = rung.index,
                    resource_exhausted = exhausted,
                    error = %message,
                    "Generation attempt failed; giving up",
                );
                return Err(LadderError {
                    rung_index: rung.index,
                    message,
                    resource_exhausted: exhausted,
                });
            }

            tracing::warn!(
                rung = rung.index,
                width = rung.width,
                height = rung.height,
                steps = rung.steps,
                error = %message,
                "Memory exhausted; releasing cache and stepping down",
            );
            oom_seen = true;
            self.reclaimer.release_cached_memory();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
