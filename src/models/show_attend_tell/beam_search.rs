//! Per-image beam search over caption continuations.
use candle::{IndexOp, Result, Tensor};

use super::decode::ShowAttendTellModel;
use super::rnn::State;

/// A finalized beam: its token sequence, the per-step log-probabilities and
/// their cumulative sum.
#[derive(Debug, Clone)]
pub struct BeamHypothesis {
    pub tokens: Vec<u32>,
    pub logprobs: Vec<f32>,
    pub cum_logprob: f32,
}

/// Continuation candidate built during one expansion step.
#[derive(Debug, Clone)]
struct BeamCandidate {
    token: u32,
    src: usize,
    cum_logprob: f32,
    logprob: f32,
}

/// Output of [`ShowAttendTellModel::beam_search`].
#[derive(Debug)]
pub struct BeamSearchOutput {
    /// Best sequence per image, `[batch, seq_length]`, zero-padded.
    pub seq: Tensor,
    /// Per-step log-probabilities of the best sequence, `[batch, seq_length]`.
    pub seq_logprobs: Tensor,
    /// Every finalized beam per image, sorted by cumulative log-probability
    /// descending.
    pub hypotheses: Vec<Vec<BeamHypothesis>>,
}

impl ShowAttendTellModel {
    /// Beam search, run independently for each image in the batch.
    ///
    /// At every step the top `min(beam_size, vocab + 1)` continuations of
    /// each live beam compete on cumulative log-probability; the winners fork
    /// their source beam's history and recurrent state into fresh slots.
    /// A continuation that emits the end sentinel, or that reaches the
    /// sequence cap, is finalized immediately. Expansion stops when no
    /// admissible candidate remains.
    pub fn beam_search(
        &self,
        fc_feats: &Tensor,
        att_feats: &Tensor,
        bos_token: u32,
        beam_size: usize,
    ) -> Result<BeamSearchOutput> {
        let span = tracing::span!(tracing::Level::TRACE, "beam-search");
        let _enter = span.enter();
        let batch_size = fc_feats.dim(0)?;
        let fc_feat_size = fc_feats.dim(1)?;
        let (_, att_size, conv_feat_size) = att_feats.dims3()?;
        let device = fc_feats.device();
        let seq_length = self.seq_length();

        let mut seq_rows: Vec<Tensor> = Vec::with_capacity(batch_size);
        let mut logprob_rows: Vec<Tensor> = Vec::with_capacity(batch_size);
        let mut hypotheses: Vec<Vec<BeamHypothesis>> = Vec::with_capacity(batch_size);

        for k in 0..batch_size {
            let fc_k = fc_feats
                .i(k)?
                .unsqueeze(0)?
                .expand((beam_size, fc_feat_size))?;
            let att_k = att_feats
                .i(k)?
                .unsqueeze(0)?
                .expand((beam_size, att_size, conv_feat_size))?
                .contiguous()?;
            let mut state = self.init_state(&fc_k)?;

            let mut beam_tokens: Vec<Vec<u32>> = vec![Vec::new(); beam_size];
            let mut beam_logprobs: Vec<Vec<f32>> = vec![Vec::new(); beam_size];
            let mut beam_cum: Vec<f32> = vec![0.0; beam_size];
            let mut done_beams: Vec<BeamHypothesis> = Vec::new();
            // only the first row carries signal at the first expansion since
            // every beam started from the same BOS token
            let mut active = 1usize;
            let mut logprobs: Option<Tensor> = None;

            for t in 0..=seq_length {
                let it = match &logprobs {
                    None => Tensor::full(bos_token, beam_size, device)?,
                    Some(prev) => {
                        let rows = prev.to_vec2::<f32>()?;
                        let cols = beam_size.min(rows[0].len());
                        let mut candidates: Vec<BeamCandidate> = Vec::new();
                        for (q, row) in rows.iter().enumerate().take(active) {
                            if t > 1 && beam_tokens[q].last() == Some(&0) {
                                // source beam already emitted the end sentinel
                                continue;
                            }
                            let mut idx: Vec<usize> = (0..row.len()).collect();
                            idx.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
                            for &c in idx.iter().take(cols) {
                                candidates.push(BeamCandidate {
                                    token: c as u32,
                                    src: q,
                                    cum_logprob: beam_cum[q] + row[c],
                                    logprob: row[c],
                                });
                            }
                        }
                        if candidates.is_empty() {
                            break;
                        }
                        candidates.sort_by(|a, b| b.cum_logprob.total_cmp(&a.cum_logprob));
                        candidates.truncate(beam_size);

                        // copy-on-fork into fresh slots; finalized winners
                        // still occupy a slot so the arena stays consistent
                        let mut new_tokens = Vec::with_capacity(candidates.len());
                        let mut new_logprobs = Vec::with_capacity(candidates.len());
                        let mut new_cum = Vec::with_capacity(candidates.len());
                        let mut src_rows: Vec<u32> = Vec::with_capacity(candidates.len());
                        for cand in &candidates {
                            let mut tokens = beam_tokens[cand.src].clone();
                            let mut logps = beam_logprobs[cand.src].clone();
                            tokens.push(cand.token);
                            logps.push(cand.logprob);
                            if cand.token == 0 || t == seq_length {
                                done_beams.push(BeamHypothesis {
                                    tokens: tokens.clone(),
                                    logprobs: logps.clone(),
                                    cum_logprob: cand.cum_logprob,
                                });
                            }
                            new_tokens.push(tokens);
                            new_logprobs.push(logps);
                            new_cum.push(cand.cum_logprob);
                            src_rows.push(cand.src as u32);
                        }
                        beam_tokens = new_tokens;
                        beam_logprobs = new_logprobs;
                        beam_cum = new_cum;
                        active = beam_tokens.len();
                        if t == seq_length {
                            // every winner above was finalized by the cap
                            break;
                        }
                        let src = Tensor::from_vec(src_rows, active, device)?;
                        state = State {
                            h: state.h().index_select(&src, 1)?,
                            c: state.c().index_select(&src, 1)?,
                        };
                        let toks: Vec<u32> = beam_tokens
                            .iter()
                            .map(|tokens| tokens.last().copied().unwrap_or(0))
                            .collect();
                        Tensor::from_vec(toks, active, device)?
                    }
                };
                let att_step = att_k.narrow(0, 0, it.dim(0)?)?;
                let (new_logprobs, new_state) =
                    self.step_logprobs(&it, &att_step, &state, false)?;
                state = new_state;
                logprobs = Some(new_logprobs);
            }

            done_beams.sort_by(|a, b| b.cum_logprob.total_cmp(&a.cum_logprob));
            let top = match done_beams.first() {
                Some(top) => top,
                None => candle::bail!("no finalized beams, seq_length must be at least 1"),
            };
            let mut tokens = top.tokens.clone();
            tokens.resize(seq_length, 0);
            let mut logps = top.logprobs.clone();
            logps.resize(seq_length, 0.0);
            seq_rows.push(Tensor::from_vec(tokens, seq_length, device)?);
            logprob_rows.push(Tensor::from_vec(logps, seq_length, device)?);
            hypotheses.push(done_beams);
        }

        Ok(BeamSearchOutput {
            seq: Tensor::stack(&seq_rows, 0)?,
            seq_logprobs: Tensor::stack(&logprob_rows, 0)?,
            hypotheses,
        })
    }
}
