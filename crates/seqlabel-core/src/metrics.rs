//! # Evaluation Metrics
//!
//! Compares decoded tag sequences against gold sequences (padding already
//! stripped): per-tag precision/recall/F1 from a confusion count, token
//! accuracy, exact sequence match rate and exact-match span scores.

use std::fmt;

use crate::biluo::Span;
use crate::error::{Result, SeqLabelError};
use crate::tags::{Tag, TagSet};

/// Precision/recall/F1 row for one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TagScore {
    pub label: String,
    pub recall: f32,
    pub precision: f32,
    pub f1: f32,
    pub support: u64,
}

/// Per-tag scores plus a support-weighted average.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationReport {
    pub rows: Vec<TagScore>,
    pub average: TagScore,
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<15}{:>10}{:>10}{:>10}{:>10}",
            "", "recall", "precision", "f1-score", "support"
        )?;
        writeln!(f)?;
        for row in self.rows.iter().chain(std::iter::once(&self.average)) {
            writeln!(
                f,
                "{:<15}{:>10.2}{:>10.2}{:>10.2}{:>10}",
                row.label, row.recall, row.precision, row.f1, row.support
            )?;
        }
        Ok(())
    }
}

/// Exact-match span counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanScores {
    pub gold: u64,
    pub predicted: u64,
    pub correct: u64,
}

impl SpanScores {
    pub fn precision(&self) -> f32 {
        ratio(self.correct, self.predicted)
    }

    pub fn recall(&self) -> f32 {
        ratio(self.correct, self.gold)
    }

    pub fn f1(&self) -> f32 {
        harmonic(self.precision(), self.recall())
    }

    /// Matched spans over the union of gold and predicted spans.
    ///
    /// `1.0` when there are no spans on either side.
    pub fn accuracy(&self) -> f32 {
        let union = self.gold + self.predicted - self.correct;
        if union == 0 {
            1.0
        } else {
            self.correct as f32 / union as f32
        }
    }
}

fn ratio(num: u64, den: u64) -> f32 {
    num as f32 / den.max(1) as f32
}

fn harmonic(p: f32, r: f32) -> f32 {
    2.0 * p * r / (p + r).max(1e-9)
}

/// Collect the complete entity spans of a tag sequence.
///
/// A span is a `U` tag or a `B I* L` run of one entity type; fragments (for
/// example a span cut off by truncation) are ignored.
pub fn extract_spans(tags: &[Tag]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut open: Option<(usize, &str)> = None;

    for (position, tag) in tags.iter().enumerate() {
        match tag {
            Tag::Unit(e) => {
                spans.push(Span::new(position, position + 1, e.as_str()));
                open = None;
            }
            Tag::Begin(e) => open = Some((position, e.as_str())),
            Tag::Inside(e) => {
                if open.is_some_and(|(_, current)| current != e) {
                    open = None;
                }
            }
            Tag::Last(e) => {
                if let Some((start, current)) = open {
                    if current == e {
                        spans.push(Span::new(start, position + 1, current));
                    }
                }
                open = None;
            }
            Tag::Outside | Tag::Start | Tag::End => open = None,
        }
    }
    spans
}

/// Streaming accumulator over (gold, predicted) tag-id sequences.
#[derive(Debug, Clone)]
pub struct SequenceMetrics {
    num_tags: usize,
    confusion: Vec<u64>,
    sequences: u64,
    exact: u64,
    spans: SpanScores,
}

impl SequenceMetrics {
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            confusion: vec![0; num_tags * num_tags],
            sequences: 0,
            exact: 0,
            spans: SpanScores::default(),
        }
    }

    /// Count one sequence pair.
    pub fn update(&mut self, tags: &TagSet, gold: &[usize], predicted: &[usize]) -> Result<()> {
        if gold.len() != predicted.len() {
            return Err(SeqLabelError::LengthMismatch {
                left: "gold tags",
                left_len: gold.len(),
                right: "predicted tags",
                right_len: predicted.len(),
            });
        }
        if tags.len() != self.num_tags {
            return Err(SeqLabelError::DimensionMismatch {
                what: "metrics tag set",
                expected: self.num_tags,
                actual: tags.len(),
            });
        }

        let gold_tags = tags.resolve(gold)?;
        let predicted_tags = tags.resolve(predicted)?;

        for (&g, &p) in gold.iter().zip(predicted) {
            self.confusion[g * self.num_tags + p] += 1;
        }
        self.sequences += 1;
        if gold == predicted {
            self.exact += 1;
        }

        let gold_spans = extract_spans(&gold_tags);
        let predicted_spans = extract_spans(&predicted_tags);
        self.spans.gold += gold_spans.len() as u64;
        self.spans.predicted += predicted_spans.len() as u64;
        self.spans.correct += predicted_spans
            .iter()
            .filter(|span| gold_spans.contains(span))
            .count() as u64;
        Ok(())
    }

    /// Times gold tag `gold` was predicted as `predicted`.
    pub fn confusion(&self, gold: usize, predicted: usize) -> u64 {
        self.confusion[gold * self.num_tags + predicted]
    }

    /// Token-level accuracy over non-padding positions.
    pub fn tag_accuracy(&self) -> f32 {
        let total: u64 = self.confusion.iter().sum();
        let correct: u64 = (0..self.num_tags).map(|i| self.confusion(i, i)).sum();
        ratio(correct, total)
    }

    /// Fraction of sequences decoded without a single tag error.
    pub fn sequence_accuracy(&self) -> f32 {
        ratio(self.exact, self.sequences)
    }

    pub fn spans(&self) -> SpanScores {
        self.spans
    }

    pub fn sequences(&self) -> u64 {
        self.sequences
    }

    /// Per-tag report over the emittable tags of `tags`.
    pub fn report(&self, tags: &TagSet) -> ClassificationReport {
        let k = self.num_tags;
        let total: u64 = self.confusion.iter().sum();

        let rows: Vec<TagScore> = tags
            .iter()
            .filter(|(_, tag)| tag.is_emittable())
            .map(|(id, tag)| {
                let correct = self.confusion(id, id);
                let support: u64 = (0..k).map(|p| self.confusion(id, p)).sum();
                let predicted: u64 = (0..k).map(|g| self.confusion(g, id)).sum();
                let recall = ratio(correct, support);
                let precision = ratio(correct, predicted);
                TagScore {
                    label: tag.to_string(),
                    recall,
                    precision,
                    f1: harmonic(precision, recall),
                    support,
                }
            })
            .collect();

        let weighted = |field: fn(&TagScore) -> f32| {
            rows.iter()
                .map(|row| field(row) * row.support as f32)
                .sum::<f32>()
                / total.max(1) as f32
        };
        let average = TagScore {
            label: "avg / total".to_string(),
            recall: weighted(|r| r.recall),
            precision: weighted(|r| r.precision),
            f1: weighted(|r| r.f1),
            support: total,
        };

        ClassificationReport { rows, average }
    }
}
