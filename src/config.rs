//! Configuration for the infilling decoder and pipeline.
//!
//! Defaults match the speech-editing setup the decoder was trained with:
//! 80 mel bins and a 256-wide FastSpeech hidden size, full teacher forcing.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::merge::MergePolicy;
use crate::model::teacher_forcing::{DirectionCoupling, TeacherForcingMode};
use crate::{Error, Result};

/// Top-level infill configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfillConfig {
    /// Mel channel count (frame dimension D).
    #[serde(default = "default_mel_bins")]
    pub mel_bins: usize,

    /// Per-frame hidden size H of the upstream acoustic model.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Rollout strategy used in training mode.
    #[serde(default)]
    pub teacher_forcing: TeacherForcingMode,

    /// Whether forward and backward share one mixed-mode draw.
    #[serde(default)]
    pub direction_coupling: DirectionCoupling,

    /// How the two directional estimates become one frame.
    #[serde(default)]
    pub merge: MergePolicy,

    /// Seed for the teacher-forcing RNG.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for InfillConfig {
    fn default() -> Self {
        Self {
            mel_bins: default_mel_bins(),
            hidden_size: default_hidden_size(),
            teacher_forcing: TeacherForcingMode::default(),
            direction_coupling: DirectionCoupling::default(),
            merge: MergePolicy::default(),
            seed: default_seed(),
        }
    }
}

impl InfillConfig {
    /// Load and validate a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mel_bins == 0 {
            return Err(Error::Config("mel_bins must be positive".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Config("hidden_size must be positive".into()));
        }
        self.teacher_forcing.validate()
    }
}

fn default_mel_bins() -> usize {
    80
}

fn default_hidden_size() -> usize {
    256
}

fn default_seed() -> u64 {
    1234
}
