//! # Sequence Batching
//!
//! Right-pads token and tag id sequences to a fixed length and expands intent
//! ids into one-hot vectors.

use crate::error::{Result, SeqLabelError};

/// One preprocessed corpus record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceExample {
    token_ids: Vec<usize>,
    tag_ids: Vec<usize>,
    intent_id: usize,
}

impl SequenceExample {
    /// Token and tag sequences must have the same length.
    pub fn new(token_ids: Vec<usize>, tag_ids: Vec<usize>, intent_id: usize) -> Result<Self> {
        if token_ids.len() != tag_ids.len() {
            return Err(SeqLabelError::LengthMismatch {
                left: "token ids",
                left_len: token_ids.len(),
                right: "tag ids",
                right_len: tag_ids.len(),
            });
        }
        Ok(Self {
            token_ids,
            tag_ids,
            intent_id,
        })
    }

    pub fn token_ids(&self) -> &[usize] {
        &self.token_ids
    }

    pub fn tag_ids(&self) -> &[usize] {
        &self.tag_ids
    }

    pub fn intent_id(&self) -> usize {
        self.intent_id
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }
}

/// Fixed-length, right-padded batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    /// `batch x max_len` token ids
    pub token_ids: Vec<Vec<usize>>,
    /// `batch x max_len` tag ids; positions at or beyond `lengths[i]` are padding
    pub tag_ids: Vec<Vec<usize>>,
    /// `batch x num_intents`
    pub intent_one_hot: Vec<Vec<f32>>,
    /// True (possibly truncated) length of each row
    pub lengths: Vec<usize>,
    /// Intent id of each row
    pub intent_ids: Vec<usize>,
}

impl PaddedBatch {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    /// Padded width of every row.
    pub fn max_len(&self) -> usize {
        self.token_ids.first().map_or(0, Vec::len)
    }

    /// Gold tags of row `i` without padding.
    pub fn gold_tags(&self, i: usize) -> &[usize] {
        &self.tag_ids[i][..self.lengths[i]]
    }
}

/// Configuration for [`SequenceBatcher`].
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Pad/truncate to this length; `None` pads to the longest sequence
    pub max_len: Option<usize>,
    /// Token pad value (the token vocabulary's unknown id)
    pub token_pad_id: usize,
    /// Tag pad value; never scored because loss and decoding stop at `lengths`
    pub tag_pad_id: usize,
    /// Width of the one-hot intent vectors
    pub num_intents: usize,
    /// Tag ids that leave a span open (`B-*`, `I-*`); truncation never cuts
    /// right after one of them
    pub open_tag_ids: Vec<usize>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_len: Some(25),
            token_pad_id: 0,
            tag_pad_id: 0,
            num_intents: 1,
            open_tag_ids: Vec::new(),
        }
    }
}

impl BatcherConfig {
    pub fn new(num_intents: usize) -> Self {
        Self {
            num_intents,
            ..Self::default()
        }
    }

    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_token_pad_id(mut self, id: usize) -> Self {
        self.token_pad_id = id;
        self
    }

    pub fn with_tag_pad_id(mut self, id: usize) -> Self {
        self.tag_pad_id = id;
        self
    }

    pub fn with_open_tag_ids(mut self, ids: impl IntoIterator<Item = usize>) -> Self {
        self.open_tag_ids = ids.into_iter().collect();
        self
    }
}

/// One-hot vector of width `num_classes` with a 1 at `id`.
pub fn one_hot(id: usize, num_classes: usize) -> Result<Vec<f32>> {
    if id >= num_classes {
        return Err(SeqLabelError::InvalidIntent(format!(
            "intent id {id} out of range for {num_classes} intents"
        )));
    }
    let mut v = vec![0.0; num_classes];
    v[id] = 1.0;
    Ok(v)
}

/// Pads example sequences into [`PaddedBatch`]es.
#[derive(Debug, Clone, Default)]
pub struct SequenceBatcher {
    config: BatcherConfig,
}

impl SequenceBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Pad one batch. Sequences longer than `max_len` keep their first
    /// `max_len` positions, pulled back to the last span boundary so a span is
    /// never cut in half.
    pub fn pad(&self, examples: &[SequenceExample]) -> Result<PaddedBatch> {
        let width = match self.config.max_len {
            Some(max_len) => max_len,
            None => examples.iter().map(SequenceExample::len).max().unwrap_or(0),
        };

        let mut batch = PaddedBatch {
            token_ids: Vec::with_capacity(examples.len()),
            tag_ids: Vec::with_capacity(examples.len()),
            intent_one_hot: Vec::with_capacity(examples.len()),
            lengths: Vec::with_capacity(examples.len()),
            intent_ids: Vec::with_capacity(examples.len()),
        };

        for example in examples {
            let length = self.truncated_len(example, width);
            batch
                .token_ids
                .push(pad_row(&example.token_ids[..length], width, self.config.token_pad_id));
            batch
                .tag_ids
                .push(pad_row(&example.tag_ids[..length], width, self.config.tag_pad_id));
            batch
                .intent_one_hot
                .push(one_hot(example.intent_id, self.config.num_intents)?);
            batch.lengths.push(length);
            batch.intent_ids.push(example.intent_id);
        }

        Ok(batch)
    }

    fn truncated_len(&self, example: &SequenceExample, width: usize) -> usize {
        if example.len() <= width {
            return example.len();
        }
        let mut length = width;
        while length > 0 && self.config.open_tag_ids.contains(&example.tag_ids[length - 1]) {
            length -= 1;
        }
        length
    }

    /// Split `examples` into padded batches of at most `batch_size` rows.
    pub fn batches<'a>(
        &'a self,
        examples: &'a [SequenceExample],
        batch_size: usize,
    ) -> impl Iterator<Item = Result<PaddedBatch>> + 'a {
        examples
            .chunks(batch_size.max(1))
            .map(move |chunk| self.pad(chunk))
    }
}

fn pad_row(ids: &[usize], width: usize, pad: usize) -> Vec<usize> {
    let mut row = Vec::with_capacity(width);
    row.extend_from_slice(ids);
    row.resize(width, pad);
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(tokens: &[usize], tags: &[usize], intent: usize) -> SequenceExample {
        SequenceExample::new(tokens.to_vec(), tags.to_vec(), intent).unwrap()
    }

    #[test]
    fn test_example_length_mismatch() {
        assert!(SequenceExample::new(vec![1, 2], vec![0], 0).is_err());
    }

    #[test]
    fn test_pad_to_fixed_length() {
        let batcher = SequenceBatcher::new(
            BatcherConfig::new(3)
                .with_max_len(Some(4))
                .with_token_pad_id(0)
                .with_tag_pad_id(7),
        );
        let batch = batcher
            .pad(&[example(&[5, 6], &[1, 2], 2), example(&[1, 2, 3, 4, 5], &[1, 1, 1, 1, 1], 0)])
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.max_len(), 4);
        assert_eq!(batch.token_ids[0], vec![5, 6, 0, 0]);
        assert_eq!(batch.tag_ids[0], vec![1, 2, 7, 7]);
        assert_eq!(batch.token_ids[1], vec![1, 2, 3, 4]);
        assert_eq!(batch.lengths, vec![2, 4]);
        assert_eq!(batch.gold_tags(0), &[1, 2]);
        assert_eq!(batch.intent_one_hot[0], vec![0.0, 0.0, 1.0]);
        assert_eq!(batch.intent_one_hot[1], vec![1.0, 0.0, 0.0]);
        assert_eq!(batch.intent_ids, vec![2, 0]);
    }

    #[test]
    fn test_truncation_stops_at_span_boundary() {
        // Tags: 0 = O, 1 = B, 2 = I, 3 = L.
        let batcher = SequenceBatcher::new(
            BatcherConfig::new(1)
                .with_max_len(Some(4))
                .with_open_tag_ids([1, 2]),
        );
        let batch = batcher
            .pad(&[
                example(&[1, 2, 3, 4, 5, 6], &[0, 1, 2, 2, 3, 0], 0),
                example(&[1, 2, 3, 4, 5], &[1, 3, 0, 0, 0], 0),
                example(&[1, 2, 3, 4, 5], &[1, 2, 2, 2, 3], 0),
            ])
            .unwrap();

        assert_eq!(batch.lengths, vec![1, 4, 0]);
        assert_eq!(batch.gold_tags(0), &[0]);
        assert_eq!(batch.token_ids[0], vec![1, 0, 0, 0]);
        assert_eq!(batch.gold_tags(1), &[1, 3, 0, 0]);
    }

    #[test]
    fn test_pad_to_longest() {
        let batcher = SequenceBatcher::new(BatcherConfig::new(1).with_max_len(None));
        let batch = batcher
            .pad(&[example(&[1], &[1], 0), example(&[1, 2, 3], &[1, 2, 3], 0)])
            .unwrap();
        assert_eq!(batch.max_len(), 3);
        assert_eq!(batch.token_ids[0], vec![1, 0, 0]);
    }

    #[test]
    fn test_intent_out_of_range() {
        let batcher = SequenceBatcher::new(BatcherConfig::new(2));
        assert!(batcher.pad(&[example(&[1], &[1], 2)]).is_err());
    }

    #[test]
    fn test_batches_chunking() {
        let examples: Vec<_> = (0..5).map(|i| example(&[i], &[0], 0)).collect();
        let batcher = SequenceBatcher::new(BatcherConfig::new(1));
        let sizes: Vec<usize> = batcher
            .batches(&examples, 2)
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
