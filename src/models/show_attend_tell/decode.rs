//! Decoding procedures: teacher-forced unrolling, reconstruction-augmented
//! unrolling, free-running sampling and the hidden-state extraction mirrors.
use candle::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_nn::VarBuilder;

use super::attention::SoftAttentionCore;
use super::config::Config;
use super::rnn::{LstmCore, State};
use crate::generation::LogitsProcessor;
use crate::models::with_tracing::{linear, Embedding, Linear};

/// Per-call decoding options.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Beam width; 1 disables beam search.
    pub beam_size: usize,
    /// Take the most likely token instead of drawing from the distribution.
    pub sample_max: bool,
    /// Temperature applied to stochastic draws.
    pub temperature: f64,
    /// Optional nucleus mass for stochastic draws.
    pub top_p: Option<f64>,
    /// Seed of the RNG driving stochastic draws.
    pub seed: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            beam_size: 1,
            sample_max: true,
            temperature: 1.0,
            top_p: None,
            seed: 299792458,
        }
    }
}

/// Output of [`ShowAttendTellModel::sample`].
#[derive(Debug)]
pub struct SampleOutput {
    /// Generated token ids `[batch, steps]`, zeroed once an element has
    /// emitted the end sentinel.
    pub seq: Tensor,
    /// Log-probability of each recorded token, `[batch, steps]`.
    pub seq_logprobs: Tensor,
    /// Full per-step distributions `[batch, steps, vocab_size + 1]`.
    /// Not retained by the beam-search path.
    pub logprobs: Option<Tensor>,
}

/// Attention captioning decoder with a reconstruction pathway.
///
/// The recurrent state is initialized once per sequence from the global
/// image feature, then the attention core is advanced through time. During
/// training the reconstruction cell replays the decoder outputs to predict
/// the previous hidden state and attention context, and the masked squared
/// error of that prediction is accumulated as an auxiliary loss.
#[derive(Debug, Clone)]
pub struct ShowAttendTellModel {
    fc2h: Linear,
    core: SoftAttentionCore,
    embed: Embedding,
    logit: Linear,
    rcst_lstm: LstmCore,
    rcst_proj: Linear,
    rcst_weight: f64,
    ss_prob: f64,
    seq_length: usize,
    span: tracing::Span,
}

impl ShowAttendTellModel {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let fc2h = linear(cfg.fc_feat_size, cfg.lstm_size, vb.pp("fc2h"))?;
        let core = SoftAttentionCore::new(cfg, vb.pp("core"))?;
        let embed = Embedding::new(cfg.vocab_size + 1, cfg.input_encoding_size, vb.pp("embed"))?;
        let logit = linear(cfg.lstm_size, cfg.vocab_size + 1, vb.pp("logit"))?;
        let rcst_lstm = LstmCore::new(cfg.lstm_size, cfg.lstm_size, cfg.drop_prob_lm, vb.pp("rcst_lstm"))?;
        let rcst_proj = linear(
            cfg.lstm_size,
            cfg.lstm_size + cfg.conv_feat_size,
            vb.pp("rcst_proj"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "show-attend-tell");
        Ok(Self {
            fc2h,
            core,
            embed,
            logit,
            rcst_lstm,
            rcst_proj,
            rcst_weight: cfg.rcst_weight,
            ss_prob: 0.0,
            seq_length: cfg.seq_length,
            span,
        })
    }

    /// Probability of replacing a ground-truth input token with a token
    /// sampled from the model's own previous-step distribution. Zero until
    /// the training schedule raises it.
    pub fn set_ss_prob(&mut self, ss_prob: f64) {
        self.ss_prob = ss_prob;
    }

    /// Maximum number of decoding steps.
    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    /// Projects the global image feature into the initial recurrent state.
    /// The cell state starts out as a copy of the hidden state.
    pub fn init_state(&self, fc_feats: &Tensor) -> Result<State> {
        let h = self.fc2h.forward(fc_feats)?.unsqueeze(0)?;
        let c = h.clone();
        Ok(State { h, c })
    }

    /// Embeds `it`, advances the attention core and log-softmaxes the
    /// projected logits, yielding the distribution over the extended
    /// vocabulary together with the updated state.
    pub(crate) fn step_logprobs(
        &self,
        it: &Tensor,
        att_feats: &Tensor,
        state: &State,
        train: bool,
    ) -> Result<(Tensor, State)> {
        let xt = self.embed.forward(it)?;
        let (output, state) = self.core.step(&xt, att_feats, state, train)?;
        let logits = self.logit.forward(&output)?;
        let logprobs = log_softmax(&logits, D::Minus1)?;
        Ok((logprobs, state))
    }

    /// Scheduled sampling: each batch element flips an independent coin with
    /// probability `ss_prob` and, on success, its input token is drawn by
    /// `lp` from the previous step's distribution instead of taken from the
    /// ground truth.
    fn select_input(
        &self,
        seq_t: &Tensor,
        prev_logprobs: Option<&Tensor>,
        lp: &mut LogitsProcessor,
    ) -> Result<Tensor> {
        let prev_logprobs = match prev_logprobs {
            Some(prev) if self.ss_prob > 0.0 => prev,
            _ => return Ok(seq_t.clone()),
        };
        let (batch_size, _) = prev_logprobs.dims2()?;
        let device = seq_t.device();
        let sample_prob = Tensor::rand(0f32, 1f32, batch_size, device)?;
        let sample_mask = sample_prob.lt(self.ss_prob as f32)?;
        if sample_mask.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()? == 0.0 {
            return Ok(seq_t.clone());
        }
        let mut sampled = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            sampled.push(lp.sample(&prev_logprobs.i(b)?)?);
        }
        let sampled = Tensor::from_vec(sampled, batch_size, device)?;
        sample_mask.where_cond(&sampled, seq_t)
    }

    /// Shared teacher-forced unroll: returns the per-step distributions and
    /// the final recurrent state, stopping early once every ground-truth
    /// token left in the batch is the end sentinel.
    fn teacher_forced_steps(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        seq: &Tensor,
        lp: &mut LogitsProcessor,
        train: bool,
    ) -> Result<(Vec<Tensor>, State)> {
        let (_batch_size, seq_len) = seq.dims2()?;
        let mut state = self.init_state(fc_feats)?;
        let mut outputs: Vec<Tensor> = Vec::with_capacity(seq_len);
        for i in 0..seq_len {
            let seq_t = seq.i((.., i))?;
            let it = self.select_input(&seq_t, outputs.last(), lp)?;
            if i >= 1 && seq_t.to_vec1::<u32>()?.iter().all(|&t| t == 0) {
                break;
            }
            let (logprobs, new_state) = self.step_logprobs(&it, att_feats, &state, train)?;
            state = new_state;
            outputs.push(logprobs);
        }
        Ok((outputs, state))
    }

    /// Teacher-forced forward pass.
    ///
    /// `seq` holds ground-truth token ids `[batch, time]` with 0 as
    /// padding/end. Returns the stacked log-probability distributions
    /// `[batch, steps, vocab_size + 1]`, truncated to the last step at which
    /// any element still had real content.
    pub fn forward(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        seq: &Tensor,
        lp: &mut LogitsProcessor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (outputs, _state) = self.teacher_forced_steps(fc_feats, att_feats, seq, lp, train)?;
        Tensor::stack(&outputs, 1)
    }

    /// Teacher-forced forward pass that additionally reconstructs, from each
    /// decoder output, the hidden state that entered the step concatenated
    /// with the attention context consumed by it.
    ///
    /// `mask` is a float tensor `[batch, time]` zeroing the end sentinel and
    /// everything after it. Returns the stacked distributions and the
    /// accumulated reconstruction loss, scaled by the configured weight and
    /// normalized by batch size.
    pub fn forward_with_reconstruction(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        seq: &Tensor,
        mask: &Tensor,
        lp: &mut LogitsProcessor,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (batch_size, seq_len) = seq.dims2()?;
        let mut state = self.init_state(fc_feats)?;
        let mut rcst_state = state.clone();
        let mut previous_hidden = state.h().clone();
        let mut outputs: Vec<Tensor> = Vec::with_capacity(seq_len.saturating_sub(1));
        let mut rcst_loss = Tensor::zeros((), DType::F32, fc_feats.device())?;
        for i in 0..seq_len.saturating_sub(1) {
            let seq_t = seq.i((.., i))?;
            let it = self.select_input(&seq_t, outputs.last(), lp)?;
            if i >= 1 && seq_t.to_vec1::<u32>()?.iter().all(|&t| t == 0) {
                break;
            }
            let xt = self.embed.forward(&it)?;
            let (output, new_state, context) =
                self.core.step_with_context(&xt, att_feats, &state, train)?;
            let logits = self.logit.forward(&output)?;
            outputs.push(log_softmax(&logits, D::Minus1)?);

            let (rcst_output, new_rcst_state) = self.rcst_lstm.step(&output, &rcst_state, train)?;
            let rcst_hidden = self.rcst_proj.forward(&rcst_output)?;
            let target = Tensor::cat(&[&previous_hidden.squeeze(0)?, &context], 1)?;
            let diff = (rcst_hidden - target)?;
            let mask_t = mask.i((.., i))?.unsqueeze(1)?;
            let step_loss = diff.sqr()?.broadcast_mul(&mask_t)?.sum_all()?;
            rcst_loss =
                (rcst_loss + step_loss.affine(self.rcst_weight / batch_size as f64, 0.0)?)?;

            previous_hidden = new_state.h().clone();
            state = new_state;
            rcst_state = new_rcst_state;
        }
        Ok((Tensor::stack(&outputs, 1)?, rcst_loss))
    }

    /// Free-running sampling: `bos_token` primes every element at t = 0, then
    /// each following input is the model's own previous draw (argmax under
    /// `sample_max`, temperature-scaled categorical otherwise). An element is
    /// finished once it draws the end sentinel; its recorded tokens are
    /// zeroed from then on, and the loop stops when every element finished.
    ///
    /// A beam width above 1 dispatches to [`Self::beam_search`].
    pub fn sample(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        bos_token: u32,
        opts: &SampleOptions,
    ) -> Result<SampleOutput> {
        if opts.beam_size > 1 {
            let out = self.beam_search(fc_feats, att_feats, bos_token, opts.beam_size)?;
            return Ok(SampleOutput {
                seq: out.seq,
                seq_logprobs: out.seq_logprobs,
                logprobs: None,
            });
        }
        let _enter = self.span.enter();
        let temperature = if opts.sample_max {
            None
        } else {
            Some(opts.temperature)
        };
        let mut lp = LogitsProcessor::new(opts.seed, temperature, opts.top_p);
        let batch_size = fc_feats.dim(0)?;
        let device = fc_feats.device();
        let mut state = self.init_state(fc_feats)?;
        let mut seq: Vec<Tensor> = vec![];
        let mut seq_logprobs: Vec<Tensor> = vec![];
        let mut logprobs_all: Vec<Tensor> = vec![];
        let mut unfinished: Option<Tensor> = None;
        let mut logprobs: Option<Tensor> = None;
        for _t in 0..self.seq_length {
            let it = match &logprobs {
                None => Tensor::full(bos_token, batch_size, device)?,
                Some(prev) => {
                    let mut toks = Vec::with_capacity(batch_size);
                    for b in 0..batch_size {
                        toks.push(lp.sample(&prev.i(b)?)?);
                    }
                    let it = Tensor::from_vec(toks, batch_size, device)?;
                    let picked = prev.gather(&it.unsqueeze(1)?, 1)?.squeeze(1)?;
                    let step_unfinished = it.ne(0u32)?;
                    let combined = match &unfinished {
                        None => step_unfinished,
                        Some(u) => (u * &step_unfinished)?,
                    };
                    if combined.to_vec1::<u8>()?.iter().all(|&u| u == 0) {
                        break;
                    }
                    // the raw draw still feeds the next step; only the
                    // recorded token is zeroed for finished elements
                    seq.push((it.clone() * combined.to_dtype(DType::U32)?)?);
                    seq_logprobs.push(picked);
                    unfinished = Some(combined);
                    it
                }
            };
            let (new_logprobs, new_state) = self.step_logprobs(&it, att_feats, &state, false)?;
            state = new_state;
            logprobs_all.push(new_logprobs.clone());
            logprobs = Some(new_logprobs);
        }
        let (seq, seq_logprobs) = if seq.is_empty() {
            (
                Tensor::from_vec(Vec::<u32>::new(), (batch_size, 0), device)?,
                Tensor::from_vec(Vec::<f32>::new(), (batch_size, 0), device)?,
            )
        } else {
            (Tensor::stack(&seq, 1)?, Tensor::stack(&seq_logprobs, 1)?)
        };
        Ok(SampleOutput {
            seq,
            seq_logprobs,
            logprobs: Some(Tensor::stack(&logprobs_all, 1)?),
        })
    }

    /// Final recurrent hidden state `[1, batch, lstm_size]` of a
    /// teacher-forced unroll; reproduces the scheduled-sampling and
    /// early-stop behavior of [`Self::forward`] so the state corresponds to
    /// the same trajectory.
    pub fn teacher_forced_hidden_state(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        seq: &Tensor,
        lp: &mut LogitsProcessor,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_outputs, state) = self.teacher_forced_steps(fc_feats, att_feats, seq, lp, train)?;
        Ok(state.h().clone())
    }

    /// Final recurrent hidden state `[1, batch, lstm_size]` of a greedy
    /// free-running rollout; mirrors the early-stop behavior of
    /// [`Self::sample`] under `sample_max`.
    pub fn free_running_hidden_state(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        bos_token: u32,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let batch_size = fc_feats.dim(0)?;
        let device = fc_feats.device();
        let mut state = self.init_state(fc_feats)?;
        let mut unfinished: Option<Tensor> = None;
        let mut logprobs: Option<Tensor> = None;
        for _t in 0..self.seq_length {
            let it = match &logprobs {
                None => Tensor::full(bos_token, batch_size, device)?,
                Some(prev) => {
                    let it = prev.argmax(D::Minus1)?;
                    let step_unfinished = it.ne(0u32)?;
                    let combined = match &unfinished {
                        None => step_unfinished,
                        Some(u) => (u * &step_unfinished)?,
                    };
                    if combined.to_vec1::<u8>()?.iter().all(|&u| u == 0) {
                        break;
                    }
                    unfinished = Some(combined);
                    it
                }
            };
            let (new_logprobs, new_state) = self.step_logprobs(&it, att_feats, &state, train)?;
            state = new_state;
            logprobs = Some(new_logprobs);
        }
        Ok(state.h().clone())
    }
}
