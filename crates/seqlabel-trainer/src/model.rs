//! Character-level emission encoder (Embedding -> BiLSTM -> Linear).
//!
//! Produces the `batch x positions x tags` emission scores consumed by the
//! constrained CRF. Parameters live in a [`candle_nn::VarMap`] owned by the
//! trainer so they can be optimized and saved as safetensors.
//!
//! The backward LSTM reads every row reversed within its true length, so
//! padding never feeds into the states of real positions in either direction.

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{embedding, linear, lstm, Embedding, LSTMConfig, Linear, VarBuilder, LSTM, RNN};
use seqlabel_core::{EmissionSource, PaddedBatch};

/// Layer sizes of an [`EmissionEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    /// Combined width of both directions; each LSTM gets half
    pub hidden_size: usize,
    pub num_tags: usize,
}

/// Embedding, bidirectional LSTM and a linear emission head over characters.
pub struct EmissionEncoder {
    embedding: Embedding,
    lstm_forward: LSTM,
    lstm_backward: LSTM,
    emission: Linear,
    device: Device,
    config: EncoderConfig,
}

impl EmissionEncoder {
    /// Create the layers under `vb`, initialising any variables it lacks.
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let embedding = embedding(config.vocab_size, config.embedding_dim, vb.pp("embedding"))?;
        let direction_size = config.hidden_size / 2;
        let lstm_forward = lstm(
            config.embedding_dim,
            direction_size,
            LSTMConfig::default(),
            vb.pp("lstm_forward"),
        )?;
        let lstm_backward = lstm(
            config.embedding_dim,
            direction_size,
            LSTMConfig::default(),
            vb.pp("lstm_backward"),
        )?;
        let emission = linear(2 * direction_size, config.num_tags, vb.pp("emission"))?;

        Ok(Self {
            embedding,
            lstm_forward,
            lstm_backward,
            emission,
            device,
            config,
        })
    }

    pub fn config(&self) -> EncoderConfig {
        self.config
    }

    /// `batch x max_len` token id tensor of a padded batch.
    pub fn token_tensor(&self, batch: &PaddedBatch) -> Result<Tensor> {
        let ids: Vec<u32> = batch
            .token_ids
            .iter()
            .flatten()
            .map(|&id| id as u32)
            .collect();
        Tensor::from_vec(ids, (batch.len(), batch.max_len()), &self.device)
    }

    /// Emission scores for `token_ids` (`batch x seq_len`), shaped
    /// `batch x seq_len x num_tags`. `lengths` holds the unpadded length of
    /// every row.
    pub fn forward(&self, token_ids: &Tensor, lengths: &[usize]) -> Result<Tensor> {
        let embedded = self.embedding.forward(token_ids)?;
        let (batch, seq_len, _) = embedded.dims3()?;
        let reversal = self.reversal_index(lengths, batch, seq_len)?;

        let states = self.lstm_forward.seq(&embedded)?;
        let forward = self.lstm_forward.states_to_tensor(&states)?;

        let reversed = reverse_rows(&embedded, &reversal)?;
        let states = self.lstm_backward.seq(&reversed)?;
        let backward = reverse_rows(&self.lstm_backward.states_to_tensor(&states)?, &reversal)?;

        let hidden = Tensor::cat(&[&forward, &backward], 2)?;
        self.emission.forward(&hidden)
    }

    /// Flat `batch * seq_len` gather index reversing each row's first
    /// `lengths[b]` positions and leaving its padding in place.
    fn reversal_index(&self, lengths: &[usize], batch: usize, seq_len: usize) -> Result<Tensor> {
        if lengths.len() != batch {
            return Err(candle_core::Error::Msg(format!(
                "{} row lengths for a batch of {batch}",
                lengths.len()
            )));
        }
        let mut index = Vec::with_capacity(batch * seq_len);
        for (row, &length) in lengths.iter().enumerate() {
            let length = length.min(seq_len);
            let offset = row * seq_len;
            index.extend((0..seq_len).map(|t| {
                let source = if t < length { length - 1 - t } else { t };
                (offset + source) as u32
            }));
        }
        Tensor::from_vec(index, batch * seq_len, &self.device)
    }

    /// Surrogate objective whose gradient w.r.t. the emissions is `grads`.
    ///
    /// `grads` is `batch x seq_len x num_tags`, as returned by the CRF loss.
    pub fn surrogate_loss(&self, emissions: &Tensor, grads: &[Vec<Vec<f32>>]) -> Result<Tensor> {
        let flat: Vec<f32> = grads.iter().flatten().flatten().copied().collect();
        let grads = Tensor::from_vec(flat, emissions.dims3()?, &self.device)?;
        emissions.mul(&grads)?.sum_all()
    }
}

impl EmissionSource for EmissionEncoder {
    type Error = candle_core::Error;

    fn emissions(&self, batch: &PaddedBatch) -> Result<Vec<Vec<Vec<f32>>>> {
        if batch.is_empty() || batch.max_len() == 0 {
            return Ok(vec![Vec::new(); batch.len()]);
        }
        let token_ids = self.token_tensor(batch)?;
        self.forward(&token_ids, &batch.lengths)?.to_vec3::<f32>()
    }
}

fn reverse_rows(xs: &Tensor, index: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, dim) = xs.dims3()?;
    xs.reshape((batch * seq_len, dim))?
        .index_select(index, 0)?
        .reshape((batch, seq_len, dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Optimizer, VarMap, SGD};
    use seqlabel_core::{BatcherConfig, SequenceBatcher, SequenceExample};

    fn setup(varmap: &VarMap) -> EmissionEncoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let config = EncoderConfig {
            vocab_size: 10,
            embedding_dim: 4,
            hidden_size: 6,
            num_tags: 5,
        };
        EmissionEncoder::new(config, vb).unwrap()
    }

    fn pad(tokens: &[&[usize]], max_len: usize) -> PaddedBatch {
        let examples: Vec<SequenceExample> = tokens
            .iter()
            .map(|t| SequenceExample::new(t.to_vec(), vec![0; t.len()], 0).unwrap())
            .collect();
        SequenceBatcher::new(BatcherConfig::new(1).with_max_len(Some(max_len)))
            .pad(&examples)
            .unwrap()
    }

    fn batch() -> PaddedBatch {
        pad(&[&[1, 2, 3], &[4]], 4)
    }

    #[test]
    fn test_emission_shape() {
        let varmap = VarMap::new();
        let encoder = setup(&varmap);
        let emissions = encoder.emissions(&batch()).unwrap();

        assert_eq!(emissions.len(), 2);
        assert!(emissions.iter().all(|rows| rows.len() == 4));
        assert!(emissions.iter().flatten().all(|row| row.len() == 5));
    }

    #[test]
    fn test_first_emission_sees_later_tokens() {
        let varmap = VarMap::new();
        let encoder = setup(&varmap);
        let emissions = encoder.emissions(&pad(&[&[1, 2, 3], &[1, 2, 7]], 3)).unwrap();

        let changed = emissions[0][0]
            .iter()
            .zip(&emissions[1][0])
            .any(|(a, b)| (a - b).abs() > 1e-6);
        assert!(changed, "position 0 ignored a change at position 2");
    }

    #[test]
    fn test_padding_does_not_reach_real_positions() {
        let varmap = VarMap::new();
        let encoder = setup(&varmap);
        let short = encoder.emissions(&pad(&[&[1, 2, 3]], 3)).unwrap();
        let long = encoder.emissions(&pad(&[&[1, 2, 3]], 7)).unwrap();

        for t in 0..3 {
            for (a, b) in short[0][t].iter().zip(&long[0][t]) {
                assert!((a - b).abs() < 1e-5, "position {t}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_row_lengths_must_match_batch() {
        let varmap = VarMap::new();
        let encoder = setup(&varmap);
        let batch = batch();
        let token_ids = encoder.token_tensor(&batch).unwrap();
        assert!(encoder.forward(&token_ids, &[3]).is_err());
    }

    #[test]
    fn test_surrogate_step_follows_gradient() {
        let varmap = VarMap::new();
        let encoder = setup(&varmap);
        let batch = batch();
        let token_ids = encoder.token_tensor(&batch).unwrap();

        // Push the score of tag 2 up everywhere.
        let grads = vec![vec![vec![0.0, 0.0, -1.0, 0.0, 0.0]; 4]; 2];
        let before = encoder.forward(&token_ids, &batch.lengths).unwrap().to_vec3::<f32>().unwrap();

        let mut sgd = SGD::new(varmap.all_vars(), 0.1).unwrap();
        let emissions = encoder.forward(&token_ids, &batch.lengths).unwrap();
        let loss = encoder.surrogate_loss(&emissions, &grads).unwrap();
        sgd.backward_step(&loss).unwrap();

        let after = encoder.forward(&token_ids, &batch.lengths).unwrap().to_vec3::<f32>().unwrap();
        let total = |e: &Vec<Vec<Vec<f32>>>| e.iter().flatten().map(|row| row[2]).sum::<f32>();
        assert!(total(&after) > total(&before));
    }
}
