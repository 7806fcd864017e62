//! Reconciling forward and backward predictions into one frame per position.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::decoder::DirectionalOutputs;
use crate::Result;

/// Merge strategy for the two directional estimates of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Equal weight for both directions.
    Average,
    /// Weight each direction by its closeness to the boundary it started from.
    ///
    /// At span position `k` of `L`, forward gets `(L - k) / (L + 1)` and
    /// backward `(k + 1) / (L + 1)`.
    #[default]
    LinearCrossFade,
}

impl MergePolicy {
    /// Forward weight per span position; the backward weight is `1 - w`.
    pub fn forward_weights(&self, len: usize) -> Vec<f32> {
        match self {
            MergePolicy::Average => vec![0.5; len],
            MergePolicy::LinearCrossFade => {
                let denom = (len + 1) as f32;
                (0..len).map(|k| (len - k) as f32 / denom).collect()
            }
        }
    }

    /// Merge both directions into `[L, B, D]` in frame order.
    pub fn merge(&self, outputs: &DirectionalOutputs) -> Result<Tensor> {
        let len = outputs.len();
        if len == 0 {
            return Ok(outputs.forward.clone());
        }
        let forward = &outputs.forward;
        let backward = outputs.backward_in_frame_order()?;

        let weights = self.forward_weights(len);
        let w = Tensor::new(weights.as_slice(), forward.device())?
            .to_dtype(forward.dtype())?
            .reshape((len, 1, 1))?;
        let one_minus_w = w.affine(-1.0, 1.0)?;

        let merged = (forward.broadcast_mul(&w)? + backward.broadcast_mul(&one_minus_w)?)?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::MaskedSpan;
    use candle_core::{DType, Device};

    fn one_sided(len: usize) -> DirectionalOutputs {
        let dev = Device::Cpu;
        DirectionalOutputs {
            forward: Tensor::ones((len, 2, 3), DType::F32, &dev).unwrap(),
            backward: Tensor::zeros((len, 2, 3), DType::F32, &dev).unwrap(),
            span: MaskedSpan::with_length(4, len as i64).unwrap(),
        }
    }

    #[test]
    fn cross_fade_weights_favour_nearer_boundary() {
        let w = MergePolicy::LinearCrossFade.forward_weights(4);
        assert_eq!(w, vec![0.8, 0.6, 0.4, 0.2]);
        for pair in w.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn single_frame_cross_fade_is_even() {
        assert_eq!(MergePolicy::LinearCrossFade.forward_weights(1), vec![0.5]);
    }

    #[test]
    fn merge_applies_forward_weights() {
        let merged = MergePolicy::LinearCrossFade.merge(&one_sided(4)).unwrap();
        assert_eq!(merged.dims(), &[4, 2, 3]);
        let first_column: Vec<f32> = merged
            .narrow(1, 0, 1)
            .unwrap()
            .narrow(2, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (got, want) in first_column.iter().zip([0.8f32, 0.6, 0.4, 0.2]) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn average_is_midpoint() {
        let merged = MergePolicy::Average.merge(&one_sided(3)).unwrap();
        let vals: Vec<f32> = merged.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn merge_reorders_backward_before_blending() {
        let dev = Device::Cpu;
        // backward[t] targets right - t, so in frame order it reads [2, 1, 0].
        let outputs = DirectionalOutputs {
            forward: Tensor::zeros((3, 1, 1), DType::F32, &dev).unwrap(),
            backward: Tensor::new(&[[[0.0f32]], [[1.0]], [[2.0]]], &dev).unwrap(),
            span: MaskedSpan::new(0, 2).unwrap(),
        };
        let merged: Vec<f32> = MergePolicy::Average
            .merge(&outputs)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(merged, vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn empty_span_merges_to_empty() {
        let merged = MergePolicy::LinearCrossFade.merge(&one_sided(0)).unwrap();
        assert_eq!(merged.dims(), &[0, 2, 3]);
    }
}
