//! Single-layer LSTM step cell with a projection back to frame space.
//!
//! The cell keeps no state between calls: [`RecurrentState`] is a value the
//! caller threads through [`StepCell::step`]. Parameter names follow the
//! PyTorch layout (`lstm.weight_ih_l0`, `linear.weight`, ...) so exported
//! checkpoints load unchanged.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, LSTMState, RNN};
use candle_nn::{self as nn, VarBuilder};

use crate::{Error, Result};

/// Recurrent `(hidden, memory)` pair, each `[layers = 1, batch, hidden]`.
#[derive(Debug, Clone)]
pub struct RecurrentState {
    h: Tensor,
    c: Tensor,
}

impl RecurrentState {
    pub fn zeros(
        batch_size: usize,
        hidden_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let zeros = Tensor::zeros((1, batch_size, hidden_size), dtype, device)?;
        Ok(Self {
            h: zeros.clone(),
            c: zeros,
        })
    }

    pub fn h(&self) -> &Tensor {
        &self.h
    }

    pub fn c(&self) -> &Tensor {
        &self.c
    }
}

/// One recurrent decoding step over batched frames.
///
/// Implemented by [`RecurrentStepCell`]; tests substitute instrumented cells.
pub trait StepCell {
    /// Frame dimension D consumed and produced by [`StepCell::step`].
    fn frame_dim(&self) -> usize;

    /// Recurrent hidden size H.
    fn hidden_size(&self) -> usize;

    /// Fresh zeroed state for `batch_size` sequences.
    fn init_state(&self, batch_size: usize) -> Result<RecurrentState>;

    /// Consume `input` `[B, D]` and `state`, return the predicted frame
    /// `[B, D]` and the advanced state.
    fn step(&self, input: &Tensor, state: &RecurrentState) -> Result<(Tensor, RecurrentState)>;
}

/// LSTM decoder cell matching the Python `lstm_decoder`.
#[derive(Debug, Clone)]
pub struct RecurrentStepCell {
    lstm: LSTM,
    linear: nn::Linear,
    frame_dim: usize,
    hidden_size: usize,
    dtype: DType,
    device: Device,
}

impl RecurrentStepCell {
    pub fn new(frame_dim: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let lstm = LSTM::new(
            frame_dim,
            hidden_size,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let linear = nn::linear(hidden_size, frame_dim, vb.pp("linear"))?;
        Ok(Self {
            lstm,
            linear,
            frame_dim,
            hidden_size,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    fn check_state(&self, batch_size: usize, state: &RecurrentState) -> Result<()> {
        for member in [&state.h, &state.c] {
            let dims = member.dims();
            if dims.len() != 3 || dims[0] != 1 || dims[2] != self.hidden_size {
                return Err(Error::shape(
                    "recurrent state",
                    [1, batch_size, self.hidden_size],
                    dims,
                ));
            }
            if dims[1] != batch_size {
                return Err(Error::shape("recurrent state batch", batch_size, dims[1]));
            }
        }
        Ok(())
    }
}

impl StepCell for RecurrentStepCell {
    fn frame_dim(&self) -> usize {
        self.frame_dim
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn init_state(&self, batch_size: usize) -> Result<RecurrentState> {
        RecurrentState::zeros(batch_size, self.hidden_size, self.dtype, &self.device)
    }

    fn step(&self, input: &Tensor, state: &RecurrentState) -> Result<(Tensor, RecurrentState)> {
        let dims = input.dims();
        if dims.len() != 2 || dims[1] != self.frame_dim {
            return Err(Error::ShapeMismatch {
                what: "input frame",
                expected: format!("[batch, {}]", self.frame_dim),
                actual: format!("{dims:?}"),
            });
        }
        self.check_state(dims[0], state)?;

        let prev = LSTMState::new(state.h.squeeze(0)?, state.c.squeeze(0)?);
        let next = self.lstm.step(input, &prev)?;
        let prediction = self.linear.forward(&next.h)?;

        let state = RecurrentState {
            h: next.h.unsqueeze(0)?,
            c: next.c.unsqueeze(0)?,
        };
        Ok((prediction, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use std::collections::HashMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn init_state_is_zeroed_with_layer_axis() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cell = RecurrentStepCell::new(8, 16, vb).unwrap();
        let state = cell.init_state(3).unwrap();
        assert_eq!(state.h().dims(), &[1, 3, 16]);
        assert_eq!(state.c().dims(), &[1, 3, 16]);
        let sum: f32 = state.h().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn step_shapes() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cell = RecurrentStepCell::new(8, 16, vb).unwrap();
        let state = cell.init_state(2).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8), &dev).unwrap();
        let (y, next) = cell.step(&x, &state).unwrap();
        assert_eq!(y.dims(), &[2, 8]);
        assert_eq!(next.h().dims(), &[1, 2, 16]);
        assert_eq!(next.c().dims(), &[1, 2, 16]);
    }

    #[test]
    fn wrong_frame_dim_is_shape_mismatch() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cell = RecurrentStepCell::new(8, 16, vb).unwrap();
        let state = cell.init_state(2).unwrap();
        let x = Tensor::zeros((2, 7), DType::F32, &dev).unwrap();
        assert!(matches!(
            cell.step(&x, &state),
            Err(Error::ShapeMismatch { what: "input frame", .. })
        ));
    }

    #[test]
    fn wrong_hidden_size_is_shape_mismatch() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cell = RecurrentStepCell::new(8, 16, vb).unwrap();
        let state = RecurrentState::zeros(2, 12, DType::F32, &dev).unwrap();
        let x = Tensor::zeros((2, 8), DType::F32, &dev).unwrap();
        assert!(matches!(
            cell.step(&x, &state),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn batch_disagreement_is_shape_mismatch() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cell = RecurrentStepCell::new(8, 16, vb).unwrap();
        let state = cell.init_state(3).unwrap();
        let x = Tensor::zeros((2, 8), DType::F32, &dev).unwrap();
        assert!(matches!(
            cell.step(&x, &state),
            Err(Error::ShapeMismatch { what: "recurrent state batch", .. })
        ));
    }

    #[test]
    fn step_is_deterministic() {
        let dev = Device::Cpu;
        let (_vm, vb) = make_vb(&dev);
        let cell = RecurrentStepCell::new(4, 6, vb).unwrap();
        let state = cell.init_state(1).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4), &dev).unwrap();
        let (a, _) = cell.step(&x, &state).unwrap();
        let (b, _) = cell.step(&x, &state).unwrap();
        assert_eq!(
            a.to_vec2::<f32>().unwrap(),
            b.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn parameter_names_follow_torch_layout() {
        let dev = Device::Cpu;
        let (varmap, vb) = make_vb(&dev);
        let _cell = RecurrentStepCell::new(4, 6, vb.pp("forward_decoder")).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "forward_decoder.lstm.weight_ih_l0",
            "forward_decoder.lstm.weight_hh_l0",
            "forward_decoder.lstm.bias_ih_l0",
            "forward_decoder.lstm.bias_hh_l0",
            "forward_decoder.linear.weight",
            "forward_decoder.linear.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn single_step_matches_lstm_equations() {
        let dev = Device::Cpu;
        // D = H = 1; gate order is input, forget, cell, output.
        let mut tensors = HashMap::new();
        let w_ih = Tensor::new(&[[0.5f32], [-1.0], [2.0], [1.5]], &dev).unwrap();
        tensors.insert("lstm.weight_ih_l0".to_string(), w_ih);
        tensors.insert(
            "lstm.weight_hh_l0".to_string(),
            Tensor::zeros((4, 1), DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "lstm.bias_ih_l0".to_string(),
            Tensor::zeros(4, DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "lstm.bias_hh_l0".to_string(),
            Tensor::zeros(4, DType::F32, &dev).unwrap(),
        );
        tensors.insert(
            "linear.weight".to_string(),
            Tensor::new(&[[2.0f32]], &dev).unwrap(),
        );
        tensors.insert(
            "linear.bias".to_string(),
            Tensor::new(&[0.5f32], &dev).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &dev);
        let cell = RecurrentStepCell::new(1, 1, vb).unwrap();

        let x = Tensor::new(&[[1.0f32]], &dev).unwrap();
        let (y, state) = cell.step(&x, &cell.init_state(1).unwrap()).unwrap();

        let sigmoid = |v: f32| 1.0 / (1.0 + (-v).exp());
        let c = sigmoid(0.5) * 2.0f32.tanh();
        let h = sigmoid(1.5) * c.tanh();
        let expected = 2.0 * h + 0.5;

        let got: f32 = y.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        let got_c: f32 = state.c().flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((got - expected).abs() < 1e-5, "got {got}, expected {expected}");
        assert!((got_c - c).abs() < 1e-5);
    }

    #[test]
    fn zero_weights_predict_zeros() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let cell = RecurrentStepCell::new(3, 5, vb).unwrap();
        let x = Tensor::ones((2, 3), DType::F32, &dev).unwrap();
        let (y, _) = cell.step(&x, &cell.init_state(2).unwrap()).unwrap();
        let sum: f32 = y.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
