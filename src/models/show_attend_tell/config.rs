use serde::Deserialize;

/// Hyperparameters of the captioning decoder.
///
/// Token id 0 is reserved as the end-of-sequence sentinel: real word ids are
/// 1-indexed, the embedding table carries `vocab_size + 1` rows and the
/// output distributions have `vocab_size + 1` slots with slot 0 marking the
/// end of the caption.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Number of real words in the vocabulary.
    pub vocab_size: usize,
    /// Dimensionality of the token embeddings.
    pub input_encoding_size: usize,
    /// Hidden/cell size of the recurrent cells.
    pub lstm_size: usize,
    /// Dropout applied to the cell outputs during training.
    pub drop_prob_lm: f32,
    /// Maximum number of decoding steps.
    pub seq_length: usize,
    /// Channel count of the global image feature.
    pub fc_feat_size: usize,
    /// Channel count of each spatial region feature.
    pub conv_feat_size: usize,
    /// Number of spatial regions attended over.
    pub conv_att_size: usize,
    /// Width of the additive-attention hidden layer.
    pub att_hidden_size: usize,
    /// Weight of the reconstruction loss term.
    pub rcst_weight: f64,
}
