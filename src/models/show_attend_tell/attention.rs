//! Soft-attention LSTM core: advances the decoder by one token while
//! attending over the spatial feature grid.
use candle::{Module, Result, Tensor, D};
use candle_nn::ops::{sigmoid, softmax};
use candle_nn::{Dropout, VarBuilder};

use super::config::Config;
use super::rnn::State;
use crate::models::with_tracing::{linear, Linear};

/// Attention-conditioned LSTM cell.
///
/// Every step recomputes additive attention over the region features from
/// the previous hidden state; the resulting context vector enters the gate
/// pre-activations alongside the token embedding and the hidden state.
#[derive(Debug, Clone)]
pub struct SoftAttentionCore {
    i2h: Linear,
    h2h: Linear,
    a2h: Linear,
    ctx2att: Linear,
    h2att: Linear,
    alpha_net: Linear,
    dropout: Dropout,
    span: tracing::Span,
}

impl SoftAttentionCore {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let i2h = linear(cfg.input_encoding_size, 4 * cfg.lstm_size, vb.pp("i2h"))?;
        let h2h = linear(cfg.lstm_size, 4 * cfg.lstm_size, vb.pp("h2h"))?;
        let a2h = linear(cfg.conv_feat_size, 4 * cfg.lstm_size, vb.pp("a2h"))?;
        let ctx2att = linear(cfg.conv_feat_size, cfg.att_hidden_size, vb.pp("ctx2att"))?;
        let h2att = linear(cfg.lstm_size, cfg.att_hidden_size, vb.pp("h2att"))?;
        let alpha_net = linear(cfg.att_hidden_size, 1, vb.pp("alpha_net"))?;
        let dropout = Dropout::new(cfg.drop_prob_lm);
        let span = tracing::span!(tracing::Level::TRACE, "soft-attention-core");
        Ok(Self {
            i2h,
            h2h,
            a2h,
            ctx2att,
            h2att,
            alpha_net,
            dropout,
            span,
        })
    }

    /// Context vector for the current step: additive attention scores over
    /// the regions, softmaxed and used to weigh the region features.
    fn attend(&self, h: &Tensor, att_feats: &Tensor) -> Result<Tensor> {
        let att_v = self.ctx2att.forward(att_feats)?;
        let att_h = self.h2att.forward(h)?.unsqueeze(1)?;
        let dot = att_v.broadcast_add(&att_h)?.tanh()?;
        let scores = self.alpha_net.forward(&dot)?.squeeze(D::Minus1)?;
        let alpha = softmax(&scores, D::Minus1)?;
        att_feats.broadcast_mul(&alpha.unsqueeze(D::Minus1)?)?.sum(1)
    }

    /// Advances the cell by one step.
    ///
    /// `xt` is the embedded input token `[batch, input_encoding_size]`,
    /// `att_feats` the region features `[batch, regions, conv_feat_size]`.
    /// The batch axis may carry distinct beams.
    pub fn step(
        &self,
        xt: &Tensor,
        att_feats: &Tensor,
        state: &State,
        train: bool,
    ) -> Result<(Tensor, State)> {
        let (output, state, _context) = self.step_with_context(xt, att_feats, state, train)?;
        Ok((output, state))
    }

    /// Same as [`Self::step`], additionally returning the attention-weighted
    /// context vector consumed at this step. The reconstruction forward uses
    /// it as part of the reconstruction target.
    pub fn step_with_context(
        &self,
        xt: &Tensor,
        att_feats: &Tensor,
        state: &State,
        train: bool,
    ) -> Result<(Tensor, State, Tensor)> {
        let _enter = self.span.enter();
        let h = state.h.squeeze(0)?;
        let c = state.c.squeeze(0)?;
        let context = self.attend(&h, att_feats)?;
        let gates = ((self.i2h.forward(xt)? + self.h2h.forward(&h)?)?
            + self.a2h.forward(&context)?)?;
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
        Ok((output, state, context))
    }
}
