//! Teacher-forcing policy: where each direction's next input comes from.
//!
//! The decision is taken once per rollout and then read back per step via
//! [`RolloutPlan::feed`]. Mixed mode draws from a caller-supplied RNG, so a
//! seeded `ChaCha8Rng` makes training rollouts reproducible.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Decode strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TeacherForcingMode {
    /// Every next input is the ground-truth reference frame.
    #[default]
    TeacherForcing,
    /// Every next input is the direction's own previous prediction.
    Recursive,
    /// One draw per rollout: below `ratio` → teacher forcing, else recursive.
    Mixed { ratio: f64 },
}

impl TeacherForcingMode {
    pub fn validate(&self) -> Result<()> {
        match *self {
            TeacherForcingMode::Mixed { ratio } if !(0.0..=1.0).contains(&ratio) => Err(
                Error::Config(format!("teacher forcing ratio must be in [0, 1], got {ratio}")),
            ),
            _ => Ok(()),
        }
    }

    /// Whether a rollout under this mode can read reference frames.
    pub fn uses_reference(&self) -> bool {
        !matches!(self, TeacherForcingMode::Recursive)
    }
}

/// How the two directions resolve a [`TeacherForcingMode::Mixed`] draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectionCoupling {
    /// One draw decides both directions.
    #[default]
    Shared,
    /// Forward draws first, then backward draws on its own.
    Independent,
}

/// Decoding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Source of the next recurrent input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    Reference,
    Prediction,
}

/// Per-direction feed decision for one rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutPlan {
    pub forward: FeedSource,
    pub backward: FeedSource,
}

impl RolloutPlan {
    /// Free-running plan, used when no reference exists.
    pub fn recursive() -> Self {
        Self {
            forward: FeedSource::Prediction,
            backward: FeedSource::Prediction,
        }
    }

    /// Input source for `direction` after `step`. Constant across a rollout.
    pub fn feed(&self, direction: Direction, _step: usize) -> FeedSource {
        match direction {
            Direction::Forward => self.forward,
            Direction::Backward => self.backward,
        }
    }

    pub fn uses_reference(&self) -> bool {
        self.forward == FeedSource::Reference || self.backward == FeedSource::Reference
    }
}

/// Teacher-forcing policy shared by both decoder directions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TeacherForcingPolicy {
    pub mode: TeacherForcingMode,
    pub coupling: DirectionCoupling,
}

impl TeacherForcingPolicy {
    pub fn new(mode: TeacherForcingMode, coupling: DirectionCoupling) -> Result<Self> {
        mode.validate()?;
        Ok(Self { mode, coupling })
    }

    /// Resolve the feed sources for one rollout.
    ///
    /// Only [`TeacherForcingMode::Mixed`] touches `rng`.
    pub fn plan<R: Rng>(&self, rng: &mut R) -> RolloutPlan {
        match self.mode {
            TeacherForcingMode::TeacherForcing => RolloutPlan {
                forward: FeedSource::Reference,
                backward: FeedSource::Reference,
            },
            TeacherForcingMode::Recursive => RolloutPlan::recursive(),
            TeacherForcingMode::Mixed { ratio } => {
                let forward = draw(rng, ratio);
                let backward = match self.coupling {
                    DirectionCoupling::Shared => forward,
                    DirectionCoupling::Independent => draw(rng, ratio),
                };
                RolloutPlan { forward, backward }
            }
        }
    }
}

fn draw<R: Rng>(rng: &mut R, ratio: f64) -> FeedSource {
    // random::<f64>() lies in [0, 1): ratio 1.0 always forces, 0.0 never does.
    if rng.random::<f64>() < ratio {
        FeedSource::Reference
    } else {
        FeedSource::Prediction
    }
}
