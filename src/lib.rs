//! Masked-span mel-spectrogram infilling for speech editing.
//!
//! A candle-based bidirectional LSTM decoder that regenerates the frames of
//! an edited region so they blend with the untouched audio on both sides.
//!
//! ## Architecture
//!
//! ```text
//! upstream per-frame hidden ──┐
//!                             ├→ MelContextProducer (visible mel only)
//! reference mel ──────────────┘
//!                             ↓
//!             contiguous masked spans of the edit mask
//!                             ↓
//!     forward LSTM from left edge ║ backward LSTM from right edge
//!            (teacher forcing / recursive / mixed rollouts)
//!                             ↓
//!               MergePolicy (average or cross-fade)
//!                             ↓
//!             merged frames spliced into the reference mel
//! ```
//!
//! ## Modules
//!
//! - [`mask`] — edit masks and contiguous span bookkeeping
//! - [`model`] — step cell, infill decoder, teacher forcing, merge, context
//! - [`pipeline`] — end-to-end editing over a batch
//! - [`config`] — serde configuration with defaults

pub mod config;
pub mod mask;
pub mod model;
pub mod pipeline;

mod error;

pub use error::{Error, Result};
