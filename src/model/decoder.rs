//! Bidirectional masked-span infilling decoder.
//!
//! Two [`StepCell`]s walk inward over one contiguous masked span: the forward
//! cell from the left boundary, the backward cell from the right boundary.
//!
//! ```text
//! context[left-1] ─▶ fwd ─▶ fwd ─▶ fwd ─▶ ...        (predicts left, left+1, ...)
//!                   ... ◀─ bwd ◀─ bwd ◀─ bwd ◀─ context[right+1]
//!                                                    (predicts right, right-1, ...)
//! ```
//!
//! Each direction starts from the context-conditioned hidden vector just
//! outside the span, projected from hidden size H to frame size D by
//! `decoder_in`. Both sequences are returned unmerged in emission order; see
//! [`crate::model::merge`] for reconciling them.

use candle_core::{DType, IndexOp, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};
use rand::Rng;

use super::cell::{RecurrentStepCell, StepCell};
use super::teacher_forcing::{Direction, FeedSource, RolloutPlan, TeacherForcingPolicy};
use crate::config::InfillConfig;
use crate::mask::MaskedSpan;
use crate::{Error, Result};

/// Forward and backward predictions for one span, each `[L, B, D]`.
///
/// `forward[t]` targets frame `left + t`, `backward[t]` targets `right - t`.
#[derive(Debug, Clone)]
pub struct DirectionalOutputs {
    pub forward: Tensor,
    pub backward: Tensor,
    pub span: MaskedSpan,
}

impl DirectionalOutputs {
    pub fn len(&self) -> usize {
        self.span.len()
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_empty()
    }

    /// Backward predictions reordered so index `k` targets `left + k`.
    pub fn backward_in_frame_order(&self) -> Result<Tensor> {
        reverse_time(&self.backward)
    }

    /// Report non-finite predictions without altering them.
    pub fn divergence(&self) -> Result<Option<NumericDivergence>> {
        let mut directions = Vec::new();
        for (direction, frames) in [
            (Direction::Forward, &self.forward),
            (Direction::Backward, &self.backward),
        ] {
            if let Some(found) = scan_non_finite(direction, frames)? {
                directions.push(found);
            }
        }
        Ok((!directions.is_empty()).then_some(NumericDivergence {
            span: self.span,
            directions,
        }))
    }
}

/// Non-finite values found in one direction's predictions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergentDirection {
    pub direction: Direction,
    /// Number of NaN or infinite entries.
    pub non_finite: usize,
    /// First decoding step that emitted one.
    pub first_step: usize,
}

/// Observability report for a span whose predictions left the finite range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericDivergence {
    pub span: MaskedSpan,
    pub directions: Vec<DivergentDirection>,
}

fn scan_non_finite(direction: Direction, frames: &Tensor) -> Result<Option<DivergentDirection>> {
    let steps = frames.dim(0)?;
    if steps == 0 || frames.elem_count() == 0 {
        return Ok(None);
    }
    let rows: Vec<Vec<f32>> = frames
        .to_dtype(DType::F32)?
        .reshape((steps, ()))?
        .to_vec2()?;
    let mut non_finite = 0;
    let mut first_step = None;
    for (step, row) in rows.iter().enumerate() {
        let bad = row.iter().filter(|v| !v.is_finite()).count();
        if bad > 0 {
            non_finite += bad;
            first_step.get_or_insert(step);
        }
    }
    Ok(first_step.map(|first_step| DivergentDirection {
        direction,
        non_finite,
        first_step,
    }))
}

/// Reverse a time-major tensor along its first axis.
pub(crate) fn reverse_time(x: &Tensor) -> Result<Tensor> {
    let len = x.dim(0)?;
    if len < 2 {
        return Ok(x.clone());
    }
    let idx: Vec<u32> = (0..len as u32).rev().collect();
    let idx = Tensor::new(idx.as_slice(), x.device())?;
    Ok(x.index_select(&idx, 0)?)
}

/// Seq2seq infill decoder matching the Python `LSTM_Seq2Seq`.
#[derive(Debug, Clone)]
pub struct BidirectionalInfillDecoder<C = RecurrentStepCell> {
    decoder_in: nn::Linear,
    forward_decoder: C,
    backward_decoder: C,
    policy: TeacherForcingPolicy,
    context_size: usize,
    frame_dim: usize,
}

impl BidirectionalInfillDecoder<RecurrentStepCell> {
    pub fn new(cfg: &InfillConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let decoder_in = nn::linear(cfg.hidden_size, cfg.mel_bins, vb.pp("decoder_in"))?;
        let forward_decoder =
            RecurrentStepCell::new(cfg.mel_bins, cfg.hidden_size, vb.pp("forward_decoder"))?;
        let backward_decoder =
            RecurrentStepCell::new(cfg.mel_bins, cfg.hidden_size, vb.pp("backward_decoder"))?;
        let policy = TeacherForcingPolicy::new(cfg.teacher_forcing, cfg.direction_coupling)?;
        Self::from_parts(decoder_in, forward_decoder, backward_decoder, policy)
    }
}

impl<C: StepCell> BidirectionalInfillDecoder<C> {
    /// Assemble a decoder from prebuilt parts.
    ///
    /// `decoder_in` maps context hidden vectors `[B, H]` to frames `[B, D]`;
    /// both cells must consume and produce frames of that same `D`.
    pub fn from_parts(
        decoder_in: nn::Linear,
        forward_decoder: C,
        backward_decoder: C,
        policy: TeacherForcingPolicy,
    ) -> Result<Self> {
        let (frame_dim, context_size) = decoder_in.weight().dims2()?;
        for cell in [&forward_decoder, &backward_decoder] {
            if cell.frame_dim() != frame_dim {
                return Err(Error::shape("cell frame dim", frame_dim, cell.frame_dim()));
            }
        }
        policy.mode.validate()?;
        Ok(Self {
            decoder_in,
            forward_decoder,
            backward_decoder,
            policy,
            context_size,
            frame_dim,
        })
    }

    pub fn frame_dim(&self) -> usize {
        self.frame_dim
    }

    /// Dtype of the decoder weights; inputs must match it.
    pub fn dtype(&self) -> DType {
        self.decoder_in.weight().dtype()
    }

    /// Hidden size H of the context vectors `decode` expects.
    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn policy(&self) -> &TeacherForcingPolicy {
        &self.policy
    }

    /// Swap the teacher-forcing policy, e.g. per batch or per epoch.
    pub fn set_policy(&mut self, policy: TeacherForcingPolicy) -> Result<()> {
        policy.mode.validate()?;
        self.policy = policy;
        Ok(())
    }

    pub fn forward_decoder(&self) -> &C {
        &self.forward_decoder
    }

    pub fn backward_decoder(&self) -> &C {
        &self.backward_decoder
    }

    /// First inputs of the forward and backward rollouts, each `[B, D]`.
    ///
    /// Forward starts from `context_hidden[left - 1]`, backward from
    /// `context_hidden[right + 1]`. A span touching the utterance start or end
    /// starts from its own boundary frame on that side instead.
    pub fn anchor_inputs(
        &self,
        context_hidden: &Tensor,
        span: MaskedSpan,
    ) -> Result<(Tensor, Tensor)> {
        let (frames, _batch) = self.check_context(context_hidden)?;
        let (left, right) = span.bounds();
        let Some(last) = span.right() else {
            return Err(Error::span(left, right, "empty span has no anchor frames"));
        };
        if span.end() > frames {
            return Err(Error::span(
                left,
                right,
                format!("span exceeds utterance of {frames} frames"),
            ));
        }
        let before = span.left().saturating_sub(1);
        let after = (last + 1).min(frames - 1);
        let forward = self.decoder_in.forward(&context_hidden.i(before)?)?;
        let backward = self.decoder_in.forward(&context_hidden.i(after)?)?;
        Ok((forward, backward))
    }

    /// Decode one span under the configured policy.
    ///
    /// - `context_hidden`: `[T, B, H]` context-conditioned per-frame hidden states
    /// - `span`: masked frames to regenerate
    /// - `reference`: `[L, B, D]` ground truth for the span; `None` forces a
    ///   recursive rollout
    /// - `rng`: source for mixed-mode draws
    pub fn decode<R: Rng>(
        &self,
        context_hidden: &Tensor,
        span: MaskedSpan,
        reference: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<DirectionalOutputs> {
        let (frames, batch) = self.check_context(context_hidden)?;
        self.check_span(span, frames)?;
        let plan = match reference {
            Some(reference) if self.policy.mode.uses_reference() => {
                self.check_reference(reference, span, batch)?;
                self.policy.plan(rng)
            }
            _ => RolloutPlan::recursive(),
        };
        self.rollout(context_hidden, span, reference, plan)
    }

    /// [`Self::decode`] for a span given by its left boundary and signed length.
    pub fn decode_span<R: Rng>(
        &self,
        context_hidden: &Tensor,
        left: usize,
        span_length: i64,
        reference: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<DirectionalOutputs> {
        let span = MaskedSpan::with_length(left, span_length)?;
        self.decode(context_hidden, span, reference, rng)
    }

    /// Decode one span with an explicit rollout plan, bypassing the policy.
    pub fn decode_with_plan(
        &self,
        context_hidden: &Tensor,
        span: MaskedSpan,
        reference: Option<&Tensor>,
        plan: RolloutPlan,
    ) -> Result<DirectionalOutputs> {
        let (frames, batch) = self.check_context(context_hidden)?;
        self.check_span(span, frames)?;
        if plan.uses_reference() {
            let (left, right) = span.bounds();
            let reference = reference.ok_or_else(|| {
                Error::span(left, right, "teacher forcing requires reference frames")
            })?;
            self.check_reference(reference, span, batch)?;
        }
        self.rollout(context_hidden, span, reference, plan)
    }

    fn rollout(
        &self,
        context_hidden: &Tensor,
        span: MaskedSpan,
        reference: Option<&Tensor>,
        plan: RolloutPlan,
    ) -> Result<DirectionalOutputs> {
        let batch = context_hidden.dim(1)?;
        let len = span.len();
        tracing::debug!(
            left = span.left(),
            len,
            forward = ?plan.forward,
            backward = ?plan.backward,
            "decoding masked span"
        );

        if span.is_empty() {
            let empty = Tensor::zeros(
                (0, batch, self.frame_dim),
                context_hidden.dtype(),
                context_hidden.device(),
            )?;
            return Ok(DirectionalOutputs {
                forward: empty.clone(),
                backward: empty,
                span,
            });
        }

        let (mut forward_input, mut backward_input) = self.anchor_inputs(context_hidden, span)?;
        let mut forward_state = self.forward_decoder.init_state(batch)?;
        let mut backward_state = self.backward_decoder.init_state(batch)?;

        let mut forward_frames = Vec::with_capacity(len);
        let mut backward_frames = Vec::with_capacity(len);

        for t in 0..len {
            let (forward_output, next) = self.forward_decoder.step(&forward_input, &forward_state)?;
            forward_state = next;
            let (backward_output, next) =
                self.backward_decoder.step(&backward_input, &backward_state)?;
            backward_state = next;

            if t + 1 < len {
                // Reference rows are in frame order: forward just predicted
                // row t, backward just predicted row len - 1 - t.
                forward_input = next_input(
                    span,
                    plan.feed(Direction::Forward, t),
                    reference,
                    t,
                    &forward_output,
                )?;
                backward_input = next_input(
                    span,
                    plan.feed(Direction::Backward, t),
                    reference,
                    len - 1 - t,
                    &backward_output,
                )?;
            }

            forward_frames.push(forward_output);
            backward_frames.push(backward_output);
        }

        Ok(DirectionalOutputs {
            forward: Tensor::stack(&forward_frames, 0)?,
            backward: Tensor::stack(&backward_frames, 0)?,
            span,
        })
    }

    /// Returns `(T, B)` of a `[T, B, H]` context tensor.
    fn check_context(&self, context_hidden: &Tensor) -> Result<(usize, usize)> {
        match *context_hidden.dims() {
            [frames, batch, hidden] if hidden == self.context_size => Ok((frames, batch)),
            ref dims => Err(Error::ShapeMismatch {
                what: "context hidden",
                expected: format!("[frames, batch, {}]", self.context_size),
                actual: format!("{dims:?}"),
            }),
        }
    }

    fn check_span(&self, span: MaskedSpan, frames: usize) -> Result<()> {
        if span.end() > frames {
            let (left, right) = span.bounds();
            return Err(Error::span(
                left,
                right,
                format!("span exceeds utterance of {frames} frames"),
            ));
        }
        Ok(())
    }

    fn check_reference(&self, reference: &Tensor, span: MaskedSpan, batch: usize) -> Result<()> {
        let dims = reference.dims();
        if dims.len() != 3 {
            return Err(Error::shape("reference frames", [span.len(), batch, self.frame_dim], dims));
        }
        if dims[0] != span.len() {
            let (left, right) = span.bounds();
            return Err(Error::span(
                left,
                right,
                format!(
                    "{} reference frames for a span of {}",
                    dims[0],
                    span.len()
                ),
            ));
        }
        if dims[1] != batch || dims[2] != self.frame_dim {
            return Err(Error::shape("reference frames", [span.len(), batch, self.frame_dim], dims));
        }
        Ok(())
    }
}

fn next_input(
    span: MaskedSpan,
    source: FeedSource,
    reference: Option<&Tensor>,
    row: usize,
    prediction: &Tensor,
) -> Result<Tensor> {
    match source {
        FeedSource::Prediction => Ok(prediction.clone()),
        FeedSource::Reference => {
            let (left, right) = span.bounds();
            let reference = reference.ok_or_else(|| {
                Error::span(left, right, "teacher forcing requires reference frames")
            })?;
            Ok(reference.i(row)?)
        }
    }
}
