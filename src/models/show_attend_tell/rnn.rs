//! Recurrent building blocks shared by the decoding procedures.
use candle::{Module, Result, Tensor, D};
use candle_nn::ops::sigmoid;
use candle_nn::{Dropout, VarBuilder};

use crate::models::with_tracing::{linear, Linear};

/// The recurrent state threaded through a decoding procedure.
///
/// Both tensors have shape `[1, batch, lstm_size]`; during beam search the
/// batch axis carries the beams of a single image. The state is a value, not
/// a view: each step consumes the previous state and produces a fresh one.
#[derive(Debug, Clone)]
pub struct State {
    pub(crate) h: Tensor,
    pub(crate) c: Tensor,
}

impl State {
    /// The hidden state vector, which is also the output of the cell.
    pub fn h(&self) -> &Tensor {
        &self.h
    }

    /// The cell state vector.
    pub fn c(&self) -> &Tensor {
        &self.c
    }
}

/// A plain LSTM cell.
///
/// Drives the reconstruction pathway: it consumes the attention core's
/// output vector and produces the hidden state the reconstruction target is
/// predicted from.
#[derive(Debug, Clone)]
pub struct LstmCore {
    i2h: Linear,
    h2h: Linear,
    dropout: Dropout,
}

impl LstmCore {
    pub fn new(in_dim: usize, hidden_dim: usize, drop_prob: f32, vb: VarBuilder) -> Result<Self> {
        let i2h = linear(in_dim, 4 * hidden_dim, vb.pp("i2h"))?;
        let h2h = linear(hidden_dim, 4 * hidden_dim, vb.pp("h2h"))?;
        let dropout = Dropout::new(drop_prob);
        Ok(Self { i2h, h2h, dropout })
    }

    /// Applies a single step. `input` has shape `[batch, in_dim]`.
    pub fn step(&self, input: &Tensor, state: &State, train: bool) -> Result<(Tensor, State)> {
        let h = state.h.squeeze(0)?;
        let c = state.c.squeeze(0)?;
        let gates = (self.i2h.forward(input)? + self.h2h.forward(&h)?)?;
        let chunks = gates.chunk(4, D::Minus1)?;
        let in_gate = sigmoid(&chunks[0])?;
        let forget_gate = sigmoid(&chunks[1])?;
        let in_transform = chunks[2].tanh()?;
        let out_gate = sigmoid(&chunks[3])?;
        let c = ((forget_gate * c)? + (in_gate * in_transform)?)?;
        let h = (out_gate * c.tanh()?)?;
        let output = self.dropout.forward(&h, train)?;
        let state = State {
            h: h.unsqueeze(0)?,
            c: c.unsqueeze(0)?,
        };
        Ok((output, state))
    }
}
