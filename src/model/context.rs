//! Masked context injection.
//!
//! The upstream acoustic model hands over length-regulated per-frame hidden
//! states. Before infilling, the visible part of the reference mel is encoded
//! and added on top, so the decoder's anchor frames carry what the kept audio
//! actually sounds like. Masked frames are zeroed before encoding.

use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use crate::config::InfillConfig;
use crate::mask::mask_to_tensor;
use crate::{Error, Result};

/// Produces the context-conditioned per-frame hidden states the decoder reads.
pub trait MaskedContextProducer {
    /// - `frame_hidden`: `[B, T, H]` upstream per-frame hidden states
    /// - `mask`: `T` entries, `true` = frame to regenerate
    /// - `reference_frames`: `[B, T, D]` reference mel
    /// - `nonpadding`: optional `[B, T]` with 1.0 on real frames
    ///
    /// Returns `[B, T, H]`.
    fn produce(
        &self,
        frame_hidden: &Tensor,
        mask: &[bool],
        reference_frames: &Tensor,
        nonpadding: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Conv1d(D→H, k=3) → ReLU → Linear(H→H) over the visible mel.
#[derive(Debug, Clone)]
pub struct MelContextProducer {
    conv: nn::Conv1d,
    proj: nn::Linear,
    mel_bins: usize,
    hidden_size: usize,
}

impl MelContextProducer {
    pub fn new(cfg: &InfillConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = nn::Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = nn::conv1d(cfg.mel_bins, cfg.hidden_size, 3, conv_cfg, vb.pp("conv"))?;
        let proj = nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("proj"))?;
        Ok(Self {
            conv,
            proj,
            mel_bins: cfg.mel_bins,
            hidden_size: cfg.hidden_size,
        })
    }

    /// Encode `[B, T, D]` mel frames into `[B, T, H]`.
    pub fn encode(&self, mels: &Tensor) -> Result<Tensor> {
        let x = mels.transpose(1, 2)?.contiguous()?;
        let x = self.conv.forward(&x)?.relu()?;
        let x = x.transpose(1, 2)?.contiguous()?;
        Ok(self.proj.forward(&x)?)
    }
}

impl MaskedContextProducer for MelContextProducer {
    fn produce(
        &self,
        frame_hidden: &Tensor,
        mask: &[bool],
        reference_frames: &Tensor,
        nonpadding: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b, t) = match *frame_hidden.dims() {
            [b, t, h] if h == self.hidden_size && t == mask.len() => (b, t),
            ref dims => {
                return Err(Error::ShapeMismatch {
                    what: "frame hidden",
                    expected: format!("[batch, {}, {}]", mask.len(), self.hidden_size),
                    actual: format!("{dims:?}"),
                });
            }
        };
        if reference_frames.dims() != [b, t, self.mel_bins] {
            return Err(Error::shape(
                "reference frames",
                [b, t, self.mel_bins],
                reference_frames.dims(),
            ));
        }

        let keep = mask_to_tensor(mask, reference_frames.dtype(), reference_frames.device())?
            .affine(-1.0, 1.0)?
            .reshape((1, t, 1))?;
        let visible = reference_frames.broadcast_mul(&keep)?;
        let mut context = self.encode(&visible)?;
        if let Some(nonpadding) = nonpadding {
            context = context.broadcast_mul(&nonpadding.unsqueeze(2)?)?;
        }
        Ok((frame_hidden + context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn small_cfg() -> InfillConfig {
        InfillConfig {
            mel_bins: 5,
            hidden_size: 8,
            ..InfillConfig::default()
        }
    }

    #[test]
    fn produces_per_frame_hidden() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let producer = MelContextProducer::new(&small_cfg(), vb).unwrap();
        let hidden = Tensor::randn(0f32, 1.0, (2, 7, 8), &dev).unwrap();
        let mels = Tensor::randn(0f32, 1.0, (2, 7, 5), &dev).unwrap();
        let mask = [false, false, true, true, true, false, false];
        let out = producer.produce(&hidden, &mask, &mels, None).unwrap();
        assert_eq!(out.dims(), &[2, 7, 8]);
    }

    #[test]
    fn masked_reference_content_does_not_leak() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let producer = MelContextProducer::new(&small_cfg(), vb).unwrap();
        let hidden = Tensor::randn(0f32, 1.0, (1, 6, 8), &dev).unwrap();
        let mask = [false, true, true, false, false, false];
        let mels = Tensor::randn(0f32, 1.0, (1, 6, 5), &dev).unwrap();

        // Overwrite the masked frames with something else entirely.
        let noise = Tensor::randn(0f32, 10.0, (1, 2, 5), &dev).unwrap();
        let altered = Tensor::cat(
            &[
                mels.narrow(1, 0, 1).unwrap(),
                noise,
                mels.narrow(1, 3, 3).unwrap(),
            ],
            1,
        )
        .unwrap();

        let a: Vec<f32> = producer
            .produce(&hidden, &mask, &mels, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = producer
            .produce(&hidden, &mask, &altered, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn padding_frames_receive_no_context() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let producer = MelContextProducer::new(&small_cfg(), vb).unwrap();
        let hidden = Tensor::randn(0f32, 1.0, (1, 4, 8), &dev).unwrap();
        let mels = Tensor::randn(0f32, 1.0, (1, 4, 5), &dev).unwrap();
        let nonpadding = Tensor::zeros((1, 4), DType::F32, &dev).unwrap();
        let out = producer
            .produce(&hidden, &[false; 4], &mels, Some(&nonpadding))
            .unwrap();
        let diff: f32 = (&out - &hidden)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn mask_length_must_match_frames() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let producer = MelContextProducer::new(&small_cfg(), vb).unwrap();
        let hidden = Tensor::zeros((1, 4, 8), DType::F32, &dev).unwrap();
        let mels = Tensor::zeros((1, 4, 5), DType::F32, &dev).unwrap();
        assert!(matches!(
            producer.produce(&hidden, &[true; 3], &mels, None),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rank_two_hidden_is_shape_mismatch() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let producer = MelContextProducer::new(&small_cfg(), vb).unwrap();
        let hidden = Tensor::zeros((4, 8), DType::F32, &dev).unwrap();
        let mels = Tensor::zeros((1, 4, 5), DType::F32, &dev).unwrap();
        assert!(matches!(
            producer.produce(&hidden, &[true; 4], &mels, None),
            Err(Error::ShapeMismatch { what: "frame hidden", .. })
        ));
    }
}
