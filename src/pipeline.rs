//! End-to-end masked-span editing.
//!
//! Orchestrates one edit over a batch of utterances sharing a mask:
//! 1. Decompose the mask into contiguous spans
//! 2. Decode each span bidirectionally (teacher-forced in training,
//!    free-running at inference)
//! 3. Merge the two directions per span
//! 4. Splice merged frames into a copy of the reference mel
//!
//! Context frames outside the spans are copied through untouched.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::InfillConfig;
use crate::mask::{MaskedSpan, contiguous_spans};
use crate::model::decoder::{BidirectionalInfillDecoder, DirectionalOutputs, NumericDivergence};
use crate::model::merge::MergePolicy;
use crate::{Error, Result};

/// Whether decoding may read ground truth for the masked frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Reference frames inside spans feed the teacher-forcing policy.
    Train,
    /// No ground truth for the spans; every rollout is recursive.
    Infer,
}

/// One edit request. All tensors are batch-major.
#[derive(Debug, Clone, Copy)]
pub struct EditRequest<'a> {
    /// `[B, T, H]` context-conditioned per-frame hidden states.
    pub context_hidden: &'a Tensor,
    /// `T` entries, `true` = frame to regenerate.
    pub mask: &'a [bool],
    /// `[B, T, D]` reference mel; its unmasked frames are kept verbatim.
    pub reference_mels: &'a Tensor,
}

/// Decoder output for one contiguous span.
#[derive(Debug, Clone)]
pub struct SpanPrediction {
    pub outputs: DirectionalOutputs,
    /// `[L, B, D]` merged frames in frame order.
    pub merged: Tensor,
    pub divergence: Option<NumericDivergence>,
}

impl SpanPrediction {
    pub fn span(&self) -> MaskedSpan {
        self.outputs.span
    }
}

/// Result of one edit.
#[derive(Debug, Clone)]
pub struct EditOutput {
    /// `[B, T, D]` reference mel with every masked span replaced.
    pub mel: Tensor,
    pub spans: Vec<SpanPrediction>,
}

impl EditOutput {
    pub fn has_divergence(&self) -> bool {
        self.spans.iter().any(|s| s.divergence.is_some())
    }
}

/// Masked-span infilling pipeline.
#[derive(Debug, Clone)]
pub struct InfillPipeline {
    decoder: BidirectionalInfillDecoder,
    merge: MergePolicy,
    rng: ChaCha8Rng,
}

impl InfillPipeline {
    pub fn new(cfg: &InfillConfig, vb: VarBuilder) -> Result<Self> {
        let decoder = BidirectionalInfillDecoder::new(cfg, vb)?;
        Ok(Self::from_decoder(decoder, cfg.merge, cfg.seed))
    }

    pub fn from_decoder(decoder: BidirectionalInfillDecoder, merge: MergePolicy, seed: u64) -> Self {
        Self {
            decoder,
            merge,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Load decoder weights from a safetensors checkpoint.
    pub fn load(
        cfg: &InfillConfig,
        weights: impl AsRef<Path>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        cfg.validate()?;
        let vb = load_weights(weights, dtype, device)?;
        Self::new(cfg, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("infill decoder: {e}")),
            other => other,
        })
    }

    pub fn decoder(&self) -> &BidirectionalInfillDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut BidirectionalInfillDecoder {
        &mut self.decoder
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge
    }

    pub fn set_merge_policy(&mut self, merge: MergePolicy) {
        self.merge = merge;
    }

    /// Restart the teacher-forcing RNG from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Regenerate every masked span of `request`.
    ///
    /// Either every span decodes or an error is returned; no partial output.
    pub fn run(&mut self, request: &EditRequest<'_>, mode: RunMode) -> Result<EditOutput> {
        let (batch, frames) = self.check_request(request)?;
        let spans = contiguous_spans(request.mask);

        if spans.is_empty() {
            tracing::info!(frames, "mask selects no frames, nothing to infill");
            return Ok(EditOutput {
                mel: request.reference_mels.clone(),
                spans: Vec::new(),
            });
        }

        // Decoder works time-major: [T, B, *].
        let context = request.context_hidden.transpose(0, 1)?.contiguous()?;
        let reference = request.reference_mels.transpose(0, 1)?.contiguous()?;

        let mut predictions = Vec::with_capacity(spans.len());
        for span in spans {
            let span_reference = match mode {
                RunMode::Train => Some(reference.narrow(0, span.left(), span.len())?),
                RunMode::Infer => None,
            };
            let outputs =
                self.decoder
                    .decode(&context, span, span_reference.as_ref(), &mut self.rng)?;
            let merged = self.merge.merge(&outputs)?;
            let divergence = outputs.divergence()?;
            if let Some(report) = &divergence {
                tracing::warn!(
                    left = span.left(),
                    len = span.len(),
                    ?report,
                    "non-finite frames in infilled span"
                );
            }
            predictions.push(SpanPrediction {
                outputs,
                merged,
                divergence,
            });
        }

        let mel = splice(&reference, &predictions, frames)?
            .transpose(0, 1)?
            .contiguous()?;

        tracing::info!(
            batch,
            frames,
            spans = predictions.len(),
            masked = request.mask.iter().filter(|&&m| m).count(),
            ?mode,
            "infilled masked spans"
        );

        Ok(EditOutput {
            mel,
            spans: predictions,
        })
    }

    /// Returns `(B, T)` after checking every request tensor agrees.
    fn check_request(&self, request: &EditRequest<'_>) -> Result<(usize, usize)> {
        let context_size = self.decoder.context_size();
        let (batch, frames) = match *request.context_hidden.dims() {
            [batch, frames, hidden] if hidden == context_size => (batch, frames),
            ref dims => {
                return Err(Error::ShapeMismatch {
                    what: "context hidden",
                    expected: format!("[batch, frames, {context_size}]"),
                    actual: format!("{dims:?}"),
                });
            }
        };
        if request.mask.len() != frames {
            return Err(Error::shape("mask length", frames, request.mask.len()));
        }
        let expected = [batch, frames, self.decoder.frame_dim()];
        if request.reference_mels.dims() != expected {
            return Err(Error::shape(
                "reference mels",
                expected,
                request.reference_mels.dims(),
            ));
        }
        let dtype = self.decoder.dtype();
        for (what, tensor) in [
            ("context hidden", request.context_hidden),
            ("reference mels", request.reference_mels),
        ] {
            if tensor.dtype() != dtype {
                return Err(Error::DTypeMismatch {
                    what,
                    expected: dtype,
                    actual: tensor.dtype(),
                });
            }
        }
        Ok((batch, frames))
    }
}

/// Replace each span of the time-major `reference` with its merged frames.
fn splice(reference: &Tensor, predictions: &[SpanPrediction], frames: usize) -> Result<Tensor> {
    let mut pieces = Vec::with_capacity(predictions.len() * 2 + 1);
    let mut cursor = 0;
    for prediction in predictions {
        let span = prediction.span();
        if span.left() > cursor {
            pieces.push(reference.narrow(0, cursor, span.left() - cursor)?);
        }
        if !span.is_empty() {
            pieces.push(prediction.merged.clone());
        }
        cursor = span.end();
    }
    if cursor < frames {
        pieces.push(reference.narrow(0, cursor, frames - cursor)?);
    }
    Ok(Tensor::cat(&pieces, 0)?)
}

/// Open a safetensors checkpoint as a [`VarBuilder`].
///
/// Checkpoints exported from the full editing model keep the decoder under a
/// `decoder.` prefix; that prefix is stripped so keys line up with
/// [`BidirectionalInfillDecoder::new`].
pub fn load_weights(
    path: impl AsRef<Path>,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let path = path.as_ref();
    tracing::info!("Loading infill weights from {:?}", path);
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| Error::WeightLoad(format!("{}: {e}", path.display())))?;
    let tensors = tensors
        .into_iter()
        .map(|(name, tensor)| match name.strip_prefix("decoder.") {
            Some(stripped) => (stripped.to_string(), tensor),
            None => (name, tensor),
        })
        .collect();
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}
