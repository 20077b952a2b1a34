//! Show-Attend-Tell caption decoder with reconstruction regularization.
//!
//! An LSTM decoder that attends over convolutional region features while
//! generating a caption for an image, plus a second recurrent cell that
//! reconstructs the previous hidden state and attention context from the
//! decoder output. The reconstruction error acts as a training regularizer.
//!
//! Key characteristics:
//! - Recurrent state initialized from the global image feature
//! - Soft additive attention recomputed at every decoding step
//! - Teacher forcing with per-example scheduled sampling
//! - Greedy/stochastic free-running sampling and per-image beam search
//!
//! References:
//! - [Show, Attend and Tell](https://arxiv.org/abs/1502.03044)
//! - [Regularizing RNNs by Reconstructing the Past](https://arxiv.org/abs/1803.11439)

pub mod attention;
pub mod beam_search;
pub mod config;
pub mod decode;
pub mod rnn;

pub use attention::SoftAttentionCore;
pub use beam_search::{BeamHypothesis, BeamSearchOutput};
pub use config::Config;
pub use decode::{SampleOptions, SampleOutput, ShowAttendTellModel};
pub use rnn::{LstmCore, State};
