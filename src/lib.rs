//! Attention-based image captioning decoders built on candle.
pub mod generation;
pub mod models;
