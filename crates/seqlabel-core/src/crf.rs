//! # Domain-Constrained Linear-Chain CRF
//!
//! A CRF with a single learned transition matrix whose entries are masked per
//! example by the transition mask of that example's intent. A disallowed
//! transition is not scored at all: it is represented as `None` and skipped by
//! both log-sum-exp and Viterbi, so sequences using it carry exactly zero
//! probability and can never be decoded.
//!
//! Emission scores come from any [`EmissionSource`] as `positions x tags`
//! matrices. The `<start>` and `<end>` tags only take part through the first
//! and last transition.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use crate::batch::PaddedBatch;
use crate::constraint::{DomainMasks, TransitionMask};
use crate::error::{Result, SeqLabelError};
use crate::tags::TagSet;

/// Anything that produces per-position, per-tag emission scores for a batch.
pub trait EmissionSource {
    type Error;

    /// One `max_len x num_tags` matrix per batch row.
    fn emissions(&self, batch: &PaddedBatch) -> std::result::Result<Vec<Vec<Vec<f32>>>, Self::Error>;
}

/// Log-space score where `None` means "impossible".
type LogScore = Option<f32>;

fn add(a: LogScore, b: LogScore) -> LogScore {
    Some(a? + b?)
}

/// Max-subtracted log-sum-exp over the possible entries of `scores`.
///
/// Returns `None` when every entry is impossible, so an empty set of paths is
/// an exact zero rather than an underflowed one. The exponentials are summed
/// in `f64`.
pub fn log_sum_exp(scores: &[LogScore]) -> LogScore {
    let max = scores.iter().flatten().copied().reduce(f32::max)?;
    if max.is_infinite() {
        return Some(max);
    }
    let sum: f64 = scores
        .iter()
        .flatten()
        .map(|&s| f64::from(s - max).exp())
        .sum();
    Some(max + sum.ln() as f32)
}

/// NLL loss and its gradients for one example.
#[derive(Debug, Clone, PartialEq)]
pub struct CrfGradients {
    pub loss: f32,
    /// `positions x num_tags`, d loss / d emission
    pub emissions: Vec<Vec<f32>>,
    /// Row-major `num_tags x num_tags`, d loss / d transition
    pub transitions: Vec<f32>,
}

/// Aggregated loss over a padded batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLoss {
    /// Mean loss over the scored rows
    pub loss: f32,
    /// Per-row loss; `None` for skipped rows
    pub per_example: Vec<Option<f32>>,
    /// `batch x max_len x num_tags`, averaged over scored rows, zero on padding
    pub emission_grads: Vec<Vec<Vec<f32>>>,
    /// Averaged transition gradient, row-major
    pub transition_grad: Vec<f32>,
    /// Rows whose gold path is illegal under their domain
    pub skipped: Vec<usize>,
}

impl BatchLoss {
    /// Number of rows that contributed to the loss.
    pub fn scored(&self) -> usize {
        self.per_example.len() - self.skipped.len()
    }
}

/// Linear-chain CRF with per-intent transition masking.
#[derive(Debug, Clone)]
pub struct ConstrainedCrf {
    num_tags: usize,
    start_id: usize,
    end_id: usize,
    transitions: Vec<f32>,
    masks: Arc<DomainMasks>,
}

impl ConstrainedCrf {
    /// Create a CRF with zero transition scores.
    ///
    /// Fails when the masks were compiled for a different tag set size.
    pub fn new(tags: &TagSet, masks: Arc<DomainMasks>) -> Result<Self> {
        if masks.num_tags() != tags.len() {
            return Err(SeqLabelError::DimensionMismatch {
                what: "domain mask tag dimension",
                expected: tags.len(),
                actual: masks.num_tags(),
            });
        }
        let num_tags = tags.len();
        Ok(Self {
            num_tags,
            start_id: tags.start_id(),
            end_id: tags.end_id(),
            transitions: vec![0.0; num_tags * num_tags],
            masks,
        })
    }

    /// Replace the transition scores with a row-major `num_tags x num_tags` matrix.
    pub fn with_transitions(mut self, transitions: Vec<f32>) -> Result<Self> {
        self.set_transitions(transitions)?;
        Ok(self)
    }

    /// In-place form of [`ConstrainedCrf::with_transitions`].
    pub fn set_transitions(&mut self, transitions: Vec<f32>) -> Result<()> {
        let expected = self.num_tags * self.num_tags;
        if transitions.len() != expected {
            return Err(SeqLabelError::DimensionMismatch {
                what: "transition matrix",
                expected,
                actual: transitions.len(),
            });
        }
        self.transitions = transitions;
        Ok(())
    }

    /// Size of the tag set, pseudo-tags included.
    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Row-major transition scores, unmasked.
    pub fn transitions(&self) -> &[f32] {
        &self.transitions
    }

    /// Learned score of `from -> to`, whether or not any mask allows it.
    pub fn transition(&self, from: usize, to: usize) -> f32 {
        self.transitions[from * self.num_tags + to]
    }

    /// Per-intent masks applied to every score.
    pub fn masks(&self) -> &DomainMasks {
        &self.masks
    }

    /// Apply one gradient-descent step to the transition scores.
    pub fn apply_gradients(&mut self, grad: &[f32], learning_rate: f32) -> Result<()> {
        if grad.len() != self.transitions.len() {
            return Err(SeqLabelError::DimensionMismatch {
                what: "transition gradient",
                expected: self.transitions.len(),
                actual: grad.len(),
            });
        }
        for (weight, g) in self.transitions.iter_mut().zip(grad) {
            *weight -= learning_rate * g;
        }
        Ok(())
    }

    fn masked(&self, mask: &TransitionMask, from: usize, to: usize) -> LogScore {
        mask.allows(from, to).then(|| self.transition(from, to))
    }

    fn check_emissions(&self, emissions: &[Vec<f32>]) -> Result<()> {
        match emissions.iter().find(|row| row.len() != self.num_tags) {
            Some(row) => Err(SeqLabelError::DimensionMismatch {
                what: "emission row",
                expected: self.num_tags,
                actual: row.len(),
            }),
            None => Ok(()),
        }
    }

    fn check_tags(&self, emissions: &[Vec<f32>], tags: &[usize]) -> Result<()> {
        if emissions.len() != tags.len() {
            return Err(SeqLabelError::LengthMismatch {
                left: "emissions",
                left_len: emissions.len(),
                right: "tags",
                right_len: tags.len(),
            });
        }
        match tags.iter().find(|&&tag| tag >= self.num_tags) {
            Some(&tag) => Err(SeqLabelError::DimensionMismatch {
                what: "tag id",
                expected: self.num_tags,
                actual: tag,
            }),
            None => Ok(()),
        }
    }

    /// Unnormalized score of a tag path, or the first disallowed transition
    /// as `(position, from, to)`.
    fn path_score(
        &self,
        emissions: &[Vec<f32>],
        tags: &[usize],
        mask: &TransitionMask,
    ) -> std::result::Result<f32, (usize, usize, usize)> {
        let mut prev = self.start_id;
        let mut score = 0.0;
        for (position, (&tag, row)) in tags.iter().zip(emissions).enumerate() {
            let transition = self.masked(mask, prev, tag).ok_or((position, prev, tag))?;
            score += transition + row[tag];
            prev = tag;
        }
        let last = self
            .masked(mask, prev, self.end_id)
            .ok_or((tags.len(), prev, self.end_id))?;
        Ok(score + last)
    }

    /// Forward variables: `alpha[t][j]` is the log-sum of all legal prefixes
    /// ending in tag `j` at position `t`.
    fn forward(&self, emissions: &[Vec<f32>], mask: &TransitionMask) -> Vec<Vec<LogScore>> {
        let k = self.num_tags;
        let mut alpha: Vec<Vec<LogScore>> = Vec::with_capacity(emissions.len());
        let mut terms = vec![None; k];

        for (t, row) in emissions.iter().enumerate() {
            let column: Vec<LogScore> = (0..k)
                .map(|j| {
                    let incoming = if t == 0 {
                        self.masked(mask, self.start_id, j)
                    } else {
                        for (i, term) in terms.iter_mut().enumerate() {
                            *term = add(alpha[t - 1][i], self.masked(mask, i, j));
                        }
                        log_sum_exp(&terms)
                    };
                    add(incoming, Some(row[j]))
                })
                .collect();
            alpha.push(column);
        }
        alpha
    }

    /// Backward variables: `beta[t][i]` is the log-sum of all legal suffixes
    /// after tag `i` at position `t`, the final `<end>` transition included.
    fn backward(&self, emissions: &[Vec<f32>], mask: &TransitionMask) -> Vec<Vec<LogScore>> {
        let k = self.num_tags;
        let n = emissions.len();
        let mut beta: Vec<Vec<LogScore>> = vec![vec![None; k]; n];
        let mut terms = vec![None; k];

        for t in (0..n).rev() {
            for i in 0..k {
                beta[t][i] = if t + 1 == n {
                    self.masked(mask, i, self.end_id)
                } else {
                    for (j, term) in terms.iter_mut().enumerate() {
                        *term = add(
                            add(self.masked(mask, i, j), Some(emissions[t + 1][j])),
                            beta[t + 1][j],
                        );
                    }
                    log_sum_exp(&terms)
                };
            }
        }
        beta
    }

    fn log_partition(&self, alpha: &[Vec<LogScore>], mask: &TransitionMask) -> LogScore {
        let last = alpha.last()?;
        let terms: Vec<LogScore> = last
            .iter()
            .enumerate()
            .map(|(i, &a)| add(a, self.masked(mask, i, self.end_id)))
            .collect();
        log_sum_exp(&terms)
    }

    /// Probability of `tags` given the emissions under intent `intent`.
    ///
    /// Exactly `0.0` when the path uses a transition the intent's mask forbids.
    /// The empty sequence has probability `1.0`, matching its zero loss.
    pub fn sequence_probability(
        &self,
        emissions: &[Vec<f32>],
        tags: &[usize],
        intent: usize,
    ) -> Result<f32> {
        let mask = self.masks.get(intent)?;
        self.check_emissions(emissions)?;
        self.check_tags(emissions, tags)?;
        if tags.is_empty() {
            return Ok(1.0);
        }

        let Ok(score) = self.path_score(emissions, tags, mask) else {
            return Ok(0.0);
        };
        let alpha = self.forward(emissions, mask);
        let log_z = self
            .log_partition(&alpha, mask)
            .ok_or(SeqLabelError::NoLegalPath(emissions.len()))?;
        // Rounding can put a dominant path a hair above log Z.
        let log_p = score - log_z;
        Ok(if log_p > 0.0 { 1.0 } else { log_p.exp() })
    }

    /// Negative log-likelihood of the gold path under intent `intent`.
    pub fn neg_log_likelihood(
        &self,
        emissions: &[Vec<f32>],
        gold: &[usize],
        intent: usize,
    ) -> Result<f32> {
        let mask = self.masks.get(intent)?;
        self.check_emissions(emissions)?;
        self.check_tags(emissions, gold)?;
        if gold.is_empty() {
            return Ok(0.0);
        }

        let score = self
            .path_score(emissions, gold, mask)
            .map_err(|(position, from, to)| SeqLabelError::IllegalGoldPath { position, from, to })?;
        let alpha = self.forward(emissions, mask);
        let log_z = self
            .log_partition(&alpha, mask)
            .ok_or(SeqLabelError::NoLegalPath(emissions.len()))?;
        finite(log_z - score)
    }

    /// Loss together with its gradients, from forward-backward marginals.
    pub fn loss_and_gradients(
        &self,
        emissions: &[Vec<f32>],
        gold: &[usize],
        intent: usize,
    ) -> Result<CrfGradients> {
        let mask = self.masks.get(intent)?;
        self.check_emissions(emissions)?;
        self.check_tags(emissions, gold)?;

        let k = self.num_tags;
        let n = emissions.len();
        let mut grads = CrfGradients {
            loss: 0.0,
            emissions: vec![vec![0.0; k]; n],
            transitions: vec![0.0; k * k],
        };
        if n == 0 {
            return Ok(grads);
        }

        let score = self
            .path_score(emissions, gold, mask)
            .map_err(|(position, from, to)| SeqLabelError::IllegalGoldPath { position, from, to })?;
        let alpha = self.forward(emissions, mask);
        let beta = self.backward(emissions, mask);
        let log_z = self
            .log_partition(&alpha, mask)
            .ok_or(SeqLabelError::NoLegalPath(n))?;
        grads.loss = finite(log_z - score)?;

        let prob = |log_score: LogScore| log_score.map_or(0.0, |s| (s - log_z).exp());

        // Expected counts.
        for t in 0..n {
            for j in 0..k {
                let marginal = prob(add(alpha[t][j], beta[t][j]));
                grads.emissions[t][j] = marginal;
                if t == 0 {
                    grads.transitions[self.start_id * k + j] += marginal;
                }
                if t + 1 == n {
                    grads.transitions[j * k + self.end_id] += marginal;
                }
            }
            if t > 0 {
                for i in 0..k {
                    for j in 0..k {
                        let pair = add(
                            add(alpha[t - 1][i], self.masked(mask, i, j)),
                            add(Some(emissions[t][j]), beta[t][j]),
                        );
                        grads.transitions[i * k + j] += prob(pair);
                    }
                }
            }
        }

        // Observed counts.
        let mut prev = self.start_id;
        for (t, &tag) in gold.iter().enumerate() {
            grads.emissions[t][tag] -= 1.0;
            grads.transitions[prev * k + tag] -= 1.0;
            prev = tag;
        }
        grads.transitions[prev * k + self.end_id] -= 1.0;

        Ok(grads)
    }

    /// Most likely legal tag path under intent `intent`.
    ///
    /// Ties are broken towards the lowest tag id.
    pub fn decode(&self, emissions: &[Vec<f32>], intent: usize) -> Result<Vec<usize>> {
        let mask = self.masks.get(intent)?;
        self.check_emissions(emissions)?;

        let seq_len = emissions.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }
        let k = self.num_tags;

        let mut dp: Vec<LogScore> = (0..k)
            .map(|j| add(self.masked(mask, self.start_id, j), Some(emissions[0][j])))
            .collect();
        let mut backptr: Vec<Vec<usize>> = Vec::with_capacity(seq_len - 1);

        for row in &emissions[1..] {
            let mut next = vec![None; k];
            let mut pointers = vec![0; k];

            for curr_tag in 0..k {
                let mut best: Option<(f32, usize)> = None;
                for prev_tag in 0..k {
                    let Some(score) = add(dp[prev_tag], self.masked(mask, prev_tag, curr_tag))
                    else {
                        continue;
                    };
                    if best.is_none_or(|(best_score, _)| score > best_score) {
                        best = Some((score, prev_tag));
                    }
                }
                if let Some((score, prev_tag)) = best {
                    next[curr_tag] = Some(score + row[curr_tag]);
                    pointers[curr_tag] = prev_tag;
                }
            }

            dp = next;
            backptr.push(pointers);
        }

        let mut best_final: Option<(f32, usize)> = None;
        for (tag, &score) in dp.iter().enumerate() {
            if let Some(score) = add(score, self.masked(mask, tag, self.end_id)) {
                if best_final.is_none_or(|(best_score, _)| score > best_score) {
                    best_final = Some((score, tag));
                }
            }
        }
        let (_, mut curr_tag) = best_final.ok_or(SeqLabelError::NoLegalPath(seq_len))?;

        let mut path = Vec::with_capacity(seq_len);
        path.push(curr_tag);
        for pointers in backptr.iter().rev() {
            curr_tag = pointers[curr_tag];
            path.push(curr_tag);
        }
        path.reverse();
        Ok(path)
    }

    /// Decode with the intent given as a one-hot vector.
    pub fn decode_one_hot(&self, emissions: &[Vec<f32>], intent_one_hot: &[f32]) -> Result<Vec<usize>> {
        let intent = self.masks.intent_from_one_hot(intent_one_hot)?;
        self.decode(emissions, intent)
    }

    /// Loss and gradients for every row of a padded batch, computed in parallel.
    ///
    /// `emissions[i]` may be padded; only its first `batch.lengths[i]` rows are
    /// used. Rows whose gold path is illegal are skipped and reported.
    pub fn batch_loss(&self, batch: &PaddedBatch, emissions: &[Vec<Vec<f32>>]) -> Result<BatchLoss> {
        self.check_batch(batch, emissions)?;

        let k = self.num_tags;
        let results: Vec<Result<Option<CrfGradients>>> = (0..batch.len())
            .into_par_iter()
            .map(|i| {
                let intent = self.masks.intent_from_one_hot(&batch.intent_one_hot[i])?;
                let length = batch.lengths[i];
                match self.loss_and_gradients(&emissions[i][..length], batch.gold_tags(i), intent) {
                    Ok(grads) => Ok(Some(grads)),
                    Err(SeqLabelError::IllegalGoldPath { position, from, to }) => {
                        debug!(row = i, position, from, to, "skipping row with illegal gold path");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .collect();

        let mut out = BatchLoss {
            loss: 0.0,
            per_example: Vec::with_capacity(batch.len()),
            emission_grads: Vec::with_capacity(batch.len()),
            transition_grad: vec![0.0; k * k],
            skipped: Vec::new(),
        };

        for (i, result) in results.into_iter().enumerate() {
            let width = emissions[i].len();
            match result? {
                Some(grads) => {
                    out.loss += grads.loss;
                    out.per_example.push(Some(grads.loss));
                    for (total, g) in out.transition_grad.iter_mut().zip(&grads.transitions) {
                        *total += g;
                    }
                    let mut rows = grads.emissions;
                    rows.resize(width, vec![0.0; k]);
                    out.emission_grads.push(rows);
                }
                None => {
                    out.per_example.push(None);
                    out.emission_grads.push(vec![vec![0.0; k]; width]);
                    out.skipped.push(i);
                }
            }
        }

        let scored = out.scored();
        if scored > 0 {
            let scale = 1.0 / scored as f32;
            out.loss *= scale;
            out.transition_grad.iter_mut().for_each(|g| *g *= scale);
            for row in out.emission_grads.iter_mut().flatten() {
                row.iter_mut().for_each(|g| *g *= scale);
            }
        }
        Ok(out)
    }

    /// Decode every row of a padded batch in parallel (padding excluded).
    pub fn decode_batch(&self, batch: &PaddedBatch, emissions: &[Vec<Vec<f32>>]) -> Result<Vec<Vec<usize>>> {
        self.check_batch(batch, emissions)?;

        (0..batch.len())
            .into_par_iter()
            .map(|i| {
                let length = batch.lengths[i];
                self.decode_one_hot(&emissions[i][..length], &batch.intent_one_hot[i])
            })
            .collect()
    }

    fn check_batch(&self, batch: &PaddedBatch, emissions: &[Vec<Vec<f32>>]) -> Result<()> {
        if emissions.len() != batch.len() {
            return Err(SeqLabelError::LengthMismatch {
                left: "emission batch",
                left_len: emissions.len(),
                right: "padded batch",
                right_len: batch.len(),
            });
        }
        for (rows, &length) in emissions.iter().zip(&batch.lengths) {
            if rows.len() < length {
                return Err(SeqLabelError::LengthMismatch {
                    left: "emission rows",
                    left_len: rows.len(),
                    right: "sequence",
                    right_len: length,
                });
            }
        }
        Ok(())
    }
}

/// Rejects NaN and infinite losses and clamps rounding noise below zero.
fn finite(loss: f32) -> Result<f32> {
    if loss.is_finite() {
        Ok(loss.max(0.0))
    } else {
        Err(SeqLabelError::NonFiniteLoss(loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{ConstraintCompiler, ConstraintSpec};
    use crate::vocab::{Vocabulary, UNKNOWN_SYMBOL};

    /// Tags of `{X, Y}`; intents: 0 `<UNK>`, 1 `Y-only`, 2 `X-only`.
    fn setup() -> (TagSet, ConstrainedCrf) {
        let tags = TagSet::from_entities(["X", "Y"]);
        let intents = Vocabulary::build(["Y-only", "X-only"], UNKNOWN_SYMBOL);
        let spec = ConstraintSpec::new()
            .allow("Y-only", ["Y"])
            .allow("X-only", ["X"]);
        let masks = ConstraintCompiler::default().compile(&spec, &tags, &intents);
        let crf = ConstrainedCrf::new(&tags, Arc::new(masks)).unwrap();
        (tags, crf)
    }

    fn ids(tags: &TagSet, symbols: &[&str]) -> Vec<usize> {
        symbols.iter().map(|s| tags.lookup(s)).collect()
    }

    fn emissions_from(seed: u32, seq_len: usize, num_tags: usize) -> Vec<Vec<f32>> {
        (0..seq_len)
            .map(|t| {
                (0..num_tags)
                    .map(|j| (((seed as usize + 7 * t + 3 * j) % 11) as f32 - 5.0) * 0.4)
                    .collect()
            })
            .collect()
    }

    /// Sum of exp(score) over every legal path by enumeration.
    fn brute_force_log_z(crf: &ConstrainedCrf, emissions: &[Vec<f32>], intent: usize) -> f32 {
        let k = crf.num_tags();
        let n = emissions.len();
        let mask = crf.masks().get(intent).unwrap();
        let mut total = 0.0f64;
        let mut path = vec![0usize; n];
        loop {
            if let Ok(score) = crf.path_score(emissions, &path, mask) {
                total += (score as f64).exp();
            }
            let mut pos = 0;
            loop {
                if pos == n {
                    return total.ln() as f32;
                }
                path[pos] += 1;
                if path[pos] < k {
                    break;
                }
                path[pos] = 0;
                pos += 1;
            }
        }
    }

    #[test]
    fn test_log_sum_exp() {
        assert_eq!(log_sum_exp(&[None, None]), None);
        assert_eq!(log_sum_exp(&[]), None);
        let v = log_sum_exp(&[Some(0.0), None, Some(0.0)]).unwrap();
        assert!((v - 2.0f32.ln()).abs() < 1e-6);
        let big = log_sum_exp(&[Some(1000.0), Some(1000.0)]).unwrap();
        assert!((big - (1000.0 + 2.0f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_mask_dimension_mismatch() {
        let (_, crf) = setup();
        let other = TagSet::from_entities(["X"]);
        let masks = Arc::new(crf.masks().clone());
        assert!(matches!(
            ConstrainedCrf::new(&other, masks),
            Err(SeqLabelError::DimensionMismatch { .. })
        ));
        assert!(crf.clone().with_transitions(vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_partition_matches_enumeration() {
        let (tags, crf) = setup();
        let crf = crf
            .with_transitions((0..121).map(|i| ((i % 7) as f32 - 3.0) * 0.3).collect())
            .unwrap();
        let emissions = emissions_from(2, 4, tags.len());

        for intent in 0..3 {
            let mask = crf.masks().get(intent).unwrap();
            let log_z = crf.log_partition(&crf.forward(&emissions, mask), mask).unwrap();
            let expected = brute_force_log_z(&crf, &emissions, intent);
            assert!((log_z - expected).abs() < 1e-3, "intent {intent}: {log_z} vs {expected}");
        }
    }

    #[test]
    fn test_forbidden_sequence_has_zero_probability() {
        let (tags, crf) = setup();
        let emissions = emissions_from(1, 3, tags.len());
        let y_only = 1;

        let forbidden = ids(&tags, &["O", "U-X", "O"]);
        assert_eq!(crf.sequence_probability(&emissions, &forbidden, y_only).unwrap(), 0.0);

        let legal = ids(&tags, &["O", "U-Y", "O"]);
        let p = crf.sequence_probability(&emissions, &legal, y_only).unwrap();
        assert!(p > 0.0 && p < 1.0);

        let unterminated = ids(&tags, &["O", "O", "B-Y"]);
        assert_eq!(crf.sequence_probability(&emissions, &unterminated, y_only).unwrap(), 0.0);
    }

    #[test]
    fn test_forbidden_mass_is_exact_even_with_huge_scores() {
        let (tags, crf) = setup();
        // Illegal transitions get enormous scores; they must not leak any mass.
        let mut transitions = vec![0.0; tags.len() * tags.len()];
        let u_x = tags.lookup("U-X");
        for from in 0..tags.len() {
            transitions[from * tags.len() + u_x] = 1.0e4;
        }
        let crf = crf.with_transitions(transitions).unwrap();
        let emissions = vec![vec![0.0; tags.len()]; 2];

        let total: f32 = [["O", "O"], ["O", "U-Y"], ["U-Y", "O"], ["U-Y", "U-Y"], ["B-Y", "L-Y"]]
            .iter()
            .map(|path| crf.sequence_probability(&emissions, &ids(&tags, path), 1).unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-5, "legal paths sum to {total}");
    }

    #[test]
    fn test_nll_matches_probability() {
        let (tags, crf) = setup();
        let emissions = emissions_from(5, 4, tags.len());
        let gold = ids(&tags, &["B-X", "I-X", "L-X", "O"]);

        let nll = crf.neg_log_likelihood(&emissions, &gold, 2).unwrap();
        let p = crf.sequence_probability(&emissions, &gold, 2).unwrap();
        assert!((nll + p.ln()).abs() < 1e-4);
        assert!(nll > 0.0);
    }

    #[test]
    fn test_empty_sequence_is_certain() {
        let (_, crf) = setup();
        assert_eq!(crf.sequence_probability(&[], &[], 1).unwrap(), 1.0);
        assert_eq!(crf.neg_log_likelihood(&[], &[], 1).unwrap(), 0.0);
        assert_eq!(crf.loss_and_gradients(&[], &[], 1).unwrap().loss, 0.0);
    }

    #[test]
    fn test_large_scores_stay_normalized() {
        let (tags, crf) = setup();
        let crf = crf
            .with_transitions((0..121).map(|i| ((i * 37 % 201) as f32 - 100.0)).collect())
            .unwrap();

        for seed in 0..40 {
            let emissions: Vec<Vec<f32>> = emissions_from(seed, 1 + seed as usize % 7, tags.len())
                .into_iter()
                .map(|row| row.into_iter().map(|e| e * 50.0).collect())
                .collect();
            for intent in 0..3 {
                let path = crf.decode(&emissions, intent).unwrap();
                let p = crf.sequence_probability(&emissions, &path, intent).unwrap();
                let nll = crf.neg_log_likelihood(&emissions, &path, intent).unwrap();
                assert!(p > 0.0 && p <= 1.0, "seed {seed} intent {intent}: p = {p}");
                assert!(nll >= 0.0, "seed {seed} intent {intent}: nll = {nll}");
            }
        }
    }

    #[test]
    fn test_illegal_gold_path_is_error() {
        let (tags, crf) = setup();
        let emissions = emissions_from(0, 2, tags.len());
        let gold = ids(&tags, &["U-X", "O"]);
        let err = crf.neg_log_likelihood(&emissions, &gold, 1).unwrap_err();
        assert!(matches!(err, SeqLabelError::IllegalGoldPath { position: 0, .. }));
    }

    #[test]
    fn test_non_finite_emissions_are_rejected() {
        let (tags, crf) = setup();
        let mut emissions = emissions_from(0, 2, tags.len());
        emissions[1][tags.outside_id()] = f32::NAN;
        let gold = ids(&tags, &["O", "O"]);
        assert!(matches!(
            crf.neg_log_likelihood(&emissions, &gold, 1),
            Err(SeqLabelError::NonFiniteLoss(_))
        ));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let (tags, crf) = setup();
        let crf = crf
            .with_transitions((0..121).map(|i| ((i % 5) as f32 - 2.0) * 0.2).collect())
            .unwrap();
        let emissions = emissions_from(3, 3, tags.len());
        let gold = ids(&tags, &["U-Y", "B-Y", "L-Y"]);
        let grads = crf.loss_and_gradients(&emissions, &gold, 1).unwrap();

        let eps = 1e-2;
        for (t, j) in [(0, tags.lookup("U-Y")), (1, tags.lookup("B-Y")), (2, tags.lookup("O"))] {
            let mut plus = emissions.clone();
            plus[t][j] += eps;
            let mut minus = emissions.clone();
            minus[t][j] -= eps;
            let numeric = (crf.neg_log_likelihood(&plus, &gold, 1).unwrap()
                - crf.neg_log_likelihood(&minus, &gold, 1).unwrap())
                / (2.0 * eps);
            assert!((numeric - grads.emissions[t][j]).abs() < 1e-2);
        }

        let (from, to) = (tags.lookup("B-Y"), tags.lookup("L-Y"));
        let bump = |delta: f32| {
            let mut transitions = crf.transitions().to_vec();
            transitions[from * tags.len() + to] += delta;
            let shifted = crf.clone().with_transitions(transitions).unwrap();
            shifted.neg_log_likelihood(&emissions, &gold, 1).unwrap()
        };
        let numeric = (bump(eps) - bump(-eps)) / (2.0 * eps);
        assert!((numeric - grads.transitions[from * tags.len() + to]).abs() < 1e-2);

        // Disallowed transitions never receive gradient.
        let u_x = tags.lookup("U-X");
        assert_eq!(grads.transitions[tags.outside_id() * tags.len() + u_x], 0.0);
    }

    #[test]
    fn test_decode_never_emits_forbidden_entities() {
        let (tags, crf) = setup();
        let k = tags.len();
        let mut transitions = vec![-1.0; k * k];
        for x in ["B-X", "I-X", "L-X", "U-X"] {
            let id = tags.lookup(x);
            for other in 0..k {
                transitions[other * k + id] = 50.0;
                transitions[id * k + other] = 50.0;
            }
        }
        let crf = crf.with_transitions(transitions).unwrap();

        for seed in 0..20 {
            let mut emissions = emissions_from(seed, 1 + seed as usize % 6, k);
            for row in &mut emissions {
                row[tags.lookup("U-X")] += 100.0;
            }
            let path = crf.decode(&emissions, 1).unwrap();
            let mask = crf.masks().get(1).unwrap();

            let mut prev = tags.start_id();
            for &tag in &path {
                assert!(tags.tag(tag).unwrap().entity_type() != Some("X"));
                assert!(mask.allows(prev, tag));
                prev = tag;
            }
            assert!(mask.allows(prev, tags.end_id()));
        }
    }

    #[test]
    fn test_decode_finds_best_legal_path() {
        let (tags, crf) = setup();
        let k = tags.len();
        let mut emissions = vec![vec![0.0; k]; 3];
        emissions[0][tags.lookup("B-X")] = 3.0;
        emissions[1][tags.lookup("I-X")] = 3.0;
        emissions[2][tags.lookup("L-X")] = 3.0;

        assert_eq!(crf.decode(&emissions, 2).unwrap(), ids(&tags, &["B-X", "I-X", "L-X"]));
        assert_eq!(crf.decode(&emissions, 1).unwrap(), ids(&tags, &["O", "O", "O"]));
        assert_eq!(
            crf.decode_one_hot(&emissions, &[0.0, 0.0, 1.0]).unwrap(),
            ids(&tags, &["B-X", "I-X", "L-X"])
        );
    }

    #[test]
    fn test_decode_tie_breaks_to_lowest_id() {
        let (tags, crf) = setup();
        let emissions = vec![vec![0.0; tags.len()]; 2];
        // With all-zero scores every legal path ties; O has the lowest id.
        assert_eq!(crf.decode(&emissions, 2).unwrap(), ids(&tags, &["O", "O"]));
    }

    #[test]
    fn test_decode_empty_and_bad_width() {
        let (_, crf) = setup();
        assert!(crf.decode(&[], 1).unwrap().is_empty());
        assert!(crf.decode(&[vec![0.0; 3]], 1).is_err());
        assert!(crf.decode(&[], 9).is_err());
    }

    #[test]
    fn test_apply_gradients() {
        let (tags, mut crf) = setup();
        let k = tags.len();
        let mut grad = vec![0.0; k * k];
        grad[1] = 2.0;
        crf.apply_gradients(&grad, 0.5).unwrap();
        assert_eq!(crf.transition(0, 1), -1.0);
        assert!(crf.apply_gradients(&[1.0], 0.1).is_err());
    }
}
