//! # BILUO Span Encoding
//!
//! Converts labeled spans over a sequence of units (characters or tokens)
//! into a per-position BILUO tag sequence and back.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqLabelError};
use crate::tags::Tag;

/// A labeled half-open range `[start, end)` of unit offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub entity: String,
}

impl Span {
    pub fn new(start: usize, end: usize, entity: impl Into<String>) -> Self {
        Self {
            start,
            end,
            entity: entity.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

fn invalid(span: &Span, reason: impl Into<String>) -> SeqLabelError {
    SeqLabelError::InvalidSpan {
        start: span.start,
        end: span.end,
        entity: span.entity.clone(),
        reason: reason.into(),
    }
}

/// Encode `spans` over `num_units` positions as BILUO tags.
///
/// Spans may be given in any order but must be non-empty, lie inside
/// `0..num_units` and must not overlap.
///
/// # Examples
/// ```
/// use seqlabel_core::biluo::{encode_biluo, Span};
///
/// let tags = encode_biluo(4, &[Span::new(1, 3, "X")]).unwrap();
/// let symbols: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
/// assert_eq!(symbols, ["O", "B-X", "L-X", "O"]);
/// ```
pub fn encode_biluo(num_units: usize, spans: &[Span]) -> Result<Vec<Tag>> {
    let mut ordered: Vec<&Span> = spans.iter().collect();
    ordered.sort_by_key(|span| (span.start, span.end));

    let mut tags = vec![Tag::Outside; num_units];
    let mut covered_until = 0;

    for span in ordered {
        if span.is_empty() {
            return Err(invalid(span, "empty span"));
        }
        if span.end > num_units {
            return Err(invalid(
                span,
                format!("out of range for {num_units} units"),
            ));
        }
        if span.start < covered_until {
            return Err(invalid(span, "overlaps a preceding span"));
        }

        let entity = &span.entity;
        if span.len() == 1 {
            tags[span.start] = Tag::Unit(entity.clone());
        } else {
            tags[span.start] = Tag::Begin(entity.clone());
            for tag in &mut tags[span.start + 1..span.end - 1] {
                *tag = Tag::Inside(entity.clone());
            }
            tags[span.end - 1] = Tag::Last(entity.clone());
        }
        covered_until = span.end;
    }

    Ok(tags)
}

/// Encode spans over the characters of `text`.
pub fn encode_text(text: &str, spans: &[Span]) -> Result<Vec<Tag>> {
    encode_biluo(text.chars().count(), spans)
}

/// Recover spans (sorted by start) from a well-formed BILUO sequence.
///
/// Pseudo-tags, dangling `I`/`L` tags and unterminated `B` tags are reported
/// as [`SeqLabelError::InvalidTagSequence`].
pub fn decode_spans(tags: &[Tag]) -> Result<Vec<Span>> {
    let mut spans = Vec::new();
    let mut open: Option<(usize, &str)> = None;

    let malformed = |position: usize, reason: String| SeqLabelError::InvalidTagSequence {
        position,
        reason,
    };

    for (position, tag) in tags.iter().enumerate() {
        match (tag, open) {
            (Tag::Inside(e), Some((_, current))) if e == current => {}
            (Tag::Last(e), Some((start, current))) if e == current => {
                spans.push(Span::new(start, position + 1, e.as_str()));
                open = None;
            }
            (_, Some((_, current))) => {
                return Err(malformed(
                    position,
                    format!("span of {current} interrupted by {tag}"),
                ));
            }
            (Tag::Outside, None) => {}
            (Tag::Unit(e), None) => spans.push(Span::new(position, position + 1, e.as_str())),
            (Tag::Begin(e), None) => open = Some((position, e.as_str())),
            (Tag::Inside(_) | Tag::Last(_), None) => {
                return Err(malformed(position, format!("{tag} without a preceding B tag")));
            }
            (Tag::Start | Tag::End, None) => {
                return Err(malformed(position, format!("pseudo-tag {tag} at a real position")));
            }
        }
    }

    if let Some((start, current)) = open {
        return Err(malformed(
            tags.len(),
            format!("span of {current} opened at {start} never closed"),
        ));
    }

    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(tags: &[Tag]) -> Vec<String> {
        tags.iter().map(Tag::to_string).collect()
    }

    #[test]
    fn test_encode_two_unit_span() {
        let tags = encode_biluo(4, &[Span::new(1, 3, "X")]).unwrap();
        assert_eq!(symbols(&tags), ["O", "B-X", "L-X", "O"]);
    }

    #[test]
    fn test_encode_unit_and_long_spans() {
        let spans = [Span::new(5, 6, "Y"), Span::new(0, 4, "X")];
        let tags = encode_biluo(7, &spans).unwrap();
        assert_eq!(
            symbols(&tags),
            ["B-X", "I-X", "I-X", "L-X", "O", "U-Y", "O"]
        );
    }

    #[test]
    fn test_encode_text_counts_chars() {
        let tags = encode_text("北京天气", &[Span::new(0, 2, "city")]).unwrap();
        assert_eq!(symbols(&tags), ["B-city", "L-city", "O", "O"]);
    }

    #[test]
    fn test_encode_rejects_overlap() {
        let spans = [Span::new(0, 3, "X"), Span::new(2, 4, "Y")];
        let err = encode_biluo(5, &spans).unwrap_err();
        assert!(matches!(err, SeqLabelError::InvalidSpan { start: 2, .. }));
    }

    #[test]
    fn test_encode_rejects_out_of_range_and_empty() {
        assert!(encode_biluo(3, &[Span::new(1, 4, "X")]).is_err());
        assert!(encode_biluo(3, &[Span::new(2, 2, "X")]).is_err());
    }

    #[test]
    fn test_adjacent_spans_are_not_overlapping() {
        let spans = vec![Span::new(0, 2, "X"), Span::new(2, 3, "X")];
        let tags = encode_biluo(3, &spans).unwrap();
        assert_eq!(symbols(&tags), ["B-X", "L-X", "U-X"]);
        assert_eq!(decode_spans(&tags).unwrap(), spans);
    }

    #[test]
    fn test_decode_roundtrip() {
        let spans = vec![
            Span::new(0, 1, "A"),
            Span::new(2, 5, "B"),
            Span::new(5, 7, "A"),
            Span::new(9, 10, "C"),
        ];
        let tags = encode_biluo(10, &spans).unwrap();
        assert_eq!(decode_spans(&tags).unwrap(), spans);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let parse = |s: &[&str]| s.iter().map(|t| Tag::parse(t).unwrap()).collect::<Vec<_>>();

        assert!(decode_spans(&parse(&["O", "I-X"])).is_err());
        assert!(decode_spans(&parse(&["B-X", "O"])).is_err());
        assert!(decode_spans(&parse(&["B-X", "L-Y"])).is_err());
        assert!(decode_spans(&parse(&["B-X", "I-X"])).is_err());
        assert!(decode_spans(&parse(&["<start>"])).is_err());
    }
}
