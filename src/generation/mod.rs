use candle::{DType, Error, Result, Tensor, D};
use rand::{distributions::Distribution, SeedableRng};

#[derive(Clone, PartialEq, Debug)]
pub enum Sampling {
    ArgMax,
    All { temperature: f64 },
    TopP { p: f64, temperature: f64 },
}

/// Sampling policy applied to a single row of per-token log-probabilities.
///
/// The decoder's procedures record log-softmaxed distributions, so unlike a
/// raw-logit sampler the temperature rescales log-probabilities before they
/// are renormalized.
pub struct LogitsProcessor {
    rng: rand::rngs::StdRng,
    sampling: Sampling,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        let rng = rand::rngs::StdRng::seed_from_u64(seed);
        Self { rng, sampling }
    }

    pub fn new(seed: u64, temperature: Option<f64>, top_p: Option<f64>) -> Self {
        let temperature = temperature.and_then(|v| if v < 1e-7 { None } else { Some(v) });
        let sampling = match temperature {
            None => Sampling::ArgMax,
            Some(temperature) => match top_p {
                Some(p) => Sampling::TopP { p, temperature },
                None => Sampling::All { temperature },
            },
        };
        Self::from_sampling(seed, sampling)
    }

    fn sample_argmax(&mut self, logprobs: &Tensor) -> Result<u32> {
        let logprobs_v: Vec<f32> = logprobs.to_vec1()?;
        let next_token = logprobs_v
            .iter()
            .enumerate()
            .max_by(|(_, u), (_, v)| u.total_cmp(v))
            .map(|(i, _)| i as u32)
            .unwrap();
        Ok(next_token)
    }

    fn sample_multinomial(&mut self, prs: &Vec<f32>) -> Result<u32> {
        let distr = rand::distributions::WeightedIndex::new(prs).map_err(Error::wrap)?;
        let next_token = distr.sample(&mut self.rng) as u32;
        Ok(next_token)
    }

    fn sample_topp(&mut self, prs: &mut Vec<f32>, top_p: f32) -> Result<u32> {
        // top-p sampling (or "nucleus sampling") samples from the smallest set of
        // tokens that exceed probability top_p. This way we never sample tokens that
        // have very low probabilities and are less likely to go "off the rails".
        let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();

        // Sort by descending probability.
        argsort_indices.sort_by(|&i, &j| prs[j].total_cmp(&prs[i]));

        // Clamp smaller probabilities to zero.
        let mut cumsum = 0.;
        for index in &argsort_indices {
            if cumsum >= top_p {
                prs[*index] = 0.0;
            } else {
                cumsum += prs[*index];
            }
        }
        // Sample with clamped probabilities.
        self.sample_multinomial(prs)
    }

    fn renormalized(&self, logprobs: &Tensor, temperature: f64) -> Result<Vec<f32>> {
        let scaled = (logprobs / temperature)?;
        candle_nn::ops::softmax(&scaled, D::Minus1)?.to_vec1()
    }

    /// Samples a token id from a `(vocab,)` tensor of log-probabilities.
    pub fn sample(&mut self, logprobs: &Tensor) -> Result<u32> {
        let logprobs = logprobs.to_dtype(DType::F32)?;
        let sampling = self.sampling.clone();
        let next_token = match sampling {
            Sampling::ArgMax => self.sample_argmax(&logprobs)?,
            Sampling::All { temperature } => {
                let prs = self.renormalized(&logprobs, temperature)?;
                self.sample_multinomial(&prs)?
            }
            Sampling::TopP { p, temperature } => {
                let mut prs = self.renormalized(&logprobs, temperature)?;
                if p <= 0.0 || p >= 1.0 {
                    // simply sample from the renormalized distribution
                    self.sample_multinomial(&prs)?
                } else {
                    // top-p (nucleus) sampling, clamping the least likely tokens to zero
                    self.sample_topp(&mut prs, p as f32)?
                }
            }
        };
        Ok(next_token)
    }
}
