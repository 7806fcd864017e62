//! Model components for masked-span infilling.
//!
//! ## Components
//!
//! - [`cell`] — single-layer LSTM step cell projecting back to frame space
//! - [`decoder`] — bidirectional infill decoder over one contiguous span
//! - [`teacher_forcing`] — per-rollout choice between reference and prediction inputs
//! - [`merge`] — reconciling the forward and backward estimates
//! - [`context`] — injecting the visible reference mel into per-frame hidden states

pub mod cell;
pub mod context;
pub mod decoder;
pub mod merge;
pub mod teacher_forcing;
