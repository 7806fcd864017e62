//! Edit masks and the contiguous spans they decompose into.
//!
//! A mask has one entry per frame: `true` marks a frame to regenerate,
//! `false` a trusted context frame. The decoder only ever works on one
//! contiguous run of `true` entries at a time, described by [`MaskedSpan`].

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Inclusive run of masked frames `[left, right]`.
///
/// An empty span (`len == 0`) is valid and sits just before `left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskedSpan {
    left: usize,
    len: usize,
}

impl MaskedSpan {
    /// Build a span from inclusive boundaries.
    ///
    /// `right == left - 1` yields an empty span; anything further left, or a
    /// negative `left`, is rejected.
    pub fn new(left: i64, right: i64) -> Result<Self> {
        if left < 0 {
            return Err(Error::span(left, right, "left boundary is negative"));
        }
        let len = right - left + 1;
        if len < 0 {
            return Err(Error::span(
                left,
                right,
                format!("span length {len} is negative"),
            ));
        }
        Ok(Self {
            left: left as usize,
            len: len as usize,
        })
    }

    /// Build a span from its left boundary and a signed length.
    pub fn with_length(left: usize, span_length: i64) -> Result<Self> {
        Self::new(left as i64, left as i64 + span_length - 1)
    }

    pub fn left(&self) -> usize {
        self.left
    }

    /// Inclusive right boundary, `None` for an empty span.
    pub fn right(&self) -> Option<usize> {
        (self.len > 0).then(|| self.left + self.len - 1)
    }

    /// Exclusive end index.
    pub fn end(&self) -> usize {
        self.left + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frame predicted by the forward direction at step `t`.
    pub fn forward_target(&self, t: usize) -> usize {
        self.left + t
    }

    /// Frame predicted by the backward direction at step `t`.
    pub fn backward_target(&self, t: usize) -> usize {
        self.left + self.len - 1 - t
    }

    /// Signed boundaries, used when reporting errors.
    pub(crate) fn bounds(&self) -> (i64, i64) {
        (self.left as i64, self.left as i64 + self.len as i64 - 1)
    }
}

/// Split a mask into its maximal runs of `true`, left to right.
pub fn contiguous_spans(mask: &[bool]) -> Vec<MaskedSpan> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, &masked) in mask.iter().enumerate() {
        match (masked, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push(MaskedSpan { left: s, len: i - s });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(MaskedSpan {
            left: s,
            len: mask.len() - s,
        });
    }
    spans
}

/// Mask as a `[T]` tensor of 1.0 (masked) / 0.0 (kept).
pub fn mask_to_tensor(mask: &[bool], dtype: DType, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();
    Ok(Tensor::new(values.as_slice(), device)?.to_dtype(dtype)?)
}

/// Read a `[T]` tensor back into a boolean mask; any non-zero entry is masked.
pub fn mask_from_tensor(mask: &Tensor) -> Result<Vec<bool>> {
    let values: Vec<f32> = mask.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    Ok(values.into_iter().map(|v| v != 0.0).collect())
}
