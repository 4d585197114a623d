//! # BILUO Tags
//!
//! Defines the tag alphabet for sequence labeling under the BILUO
//! (Begin-Inside-Last-Unit-Outside) scheme, the domain-independent transition
//! grammar between tags, and [`TagSet`], the dense id assignment used by the
//! CRF.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SeqLabelError};
use crate::vocab::Vocabulary;

/// Symbol of the outside tag.
pub const OUTSIDE_SYMBOL: &str = "O";
/// Symbol of the pseudo-tag preceding the first position.
pub const START_SYMBOL: &str = "<start>";
/// Symbol of the pseudo-tag following the last position.
pub const END_SYMBOL: &str = "<end>";

/// A BILUO tag, or one of the two boundary pseudo-tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    Outside,
    Begin(String),
    Inside(String),
    Last(String),
    Unit(String),
    /// Only appears as the source of the first transition.
    Start,
    /// Only appears as the target of the last transition.
    End,
}

impl Tag {
    /// Parse a tag symbol such as `B-PER`, `O` or `<start>`.
    pub fn parse(symbol: &str) -> Result<Self> {
        match symbol {
            OUTSIDE_SYMBOL => return Ok(Tag::Outside),
            START_SYMBOL => return Ok(Tag::Start),
            END_SYMBOL => return Ok(Tag::End),
            _ => {}
        }

        let (prefix, entity) = symbol
            .split_once('-')
            .ok_or_else(|| SeqLabelError::InvalidTag(symbol.to_string()))?;
        if entity.is_empty() {
            return Err(SeqLabelError::InvalidTag(symbol.to_string()));
        }

        let entity = entity.to_string();
        match prefix {
            "B" => Ok(Tag::Begin(entity)),
            "I" => Ok(Tag::Inside(entity)),
            "L" => Ok(Tag::Last(entity)),
            "U" => Ok(Tag::Unit(entity)),
            _ => Err(SeqLabelError::InvalidTag(symbol.to_string())),
        }
    }

    /// Entity type carried by this tag, with the BILUO prefix stripped.
    pub fn entity_type(&self) -> Option<&str> {
        match self {
            Tag::Begin(e) | Tag::Inside(e) | Tag::Last(e) | Tag::Unit(e) => Some(e),
            Tag::Outside | Tag::Start | Tag::End => None,
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, Tag::Begin(_))
    }

    pub fn is_inside(&self) -> bool {
        matches!(self, Tag::Inside(_))
    }

    pub fn is_last(&self) -> bool {
        matches!(self, Tag::Last(_))
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Tag::Unit(_))
    }

    /// Whether the tag can label a real position (everything but the pseudo-tags).
    pub fn is_emittable(&self) -> bool {
        !matches!(self, Tag::Start | Tag::End)
    }

    /// Check if transitioning from `from` tag to `to` tag is legal under BILUO.
    ///
    /// Entity constraints are not considered here; see
    /// [`crate::constraint`] for the per-domain restriction.
    pub fn is_valid_transition(from: &Tag, to: &Tag) -> bool {
        match from {
            Tag::Start => matches!(to, Tag::Outside | Tag::Begin(_) | Tag::Unit(_)),
            Tag::Outside | Tag::Last(_) | Tag::Unit(_) => {
                matches!(to, Tag::Outside | Tag::Begin(_) | Tag::Unit(_) | Tag::End)
            }
            Tag::Begin(entity) | Tag::Inside(entity) => {
                matches!(to, Tag::Inside(next) | Tag::Last(next) if next == entity)
            }
            Tag::End => false,
        }
    }
}

impl FromStr for Tag {
    type Err = SeqLabelError;

    fn from_str(s: &str) -> Result<Self> {
        Tag::parse(s)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Outside => write!(f, "{OUTSIDE_SYMBOL}"),
            Tag::Begin(e) => write!(f, "B-{e}"),
            Tag::Inside(e) => write!(f, "I-{e}"),
            Tag::Last(e) => write!(f, "L-{e}"),
            Tag::Unit(e) => write!(f, "U-{e}"),
            Tag::Start => write!(f, "{START_SYMBOL}"),
            Tag::End => write!(f, "{END_SYMBOL}"),
        }
    }
}

/// The concrete tags of a corpus with dense ids `0..len()`.
#[derive(Debug, Clone)]
pub struct TagSet {
    vocab: Vocabulary,
    tags: Vec<Tag>,
    outside_id: usize,
    start_id: usize,
    end_id: usize,
}

impl TagSet {
    /// Generate the full BILUO tag set for the given entity names.
    ///
    /// Ordering is `O`, then every `B-*`, `I-*`, `L-*`, `U-*` over the sorted
    /// entity names, then `<start>` and `<end>`.
    ///
    /// # Examples
    /// ```
    /// use seqlabel_core::tags::TagSet;
    ///
    /// let tags = TagSet::from_entities(["Y", "X"]);
    /// let symbols: Vec<_> = tags.vocabulary().symbols().collect();
    /// assert_eq!(
    ///     symbols,
    ///     ["O", "B-X", "B-Y", "I-X", "I-Y", "L-X", "L-Y", "U-X", "U-Y", "<start>", "<end>"]
    /// );
    /// ```
    pub fn from_entities<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entities: BTreeSet<String> = entities
            .into_iter()
            .map(|e| e.as_ref().to_string())
            .collect();

        let mut tags = vec![Tag::Outside];
        let prefixed: [fn(String) -> Tag; 4] = [Tag::Begin, Tag::Inside, Tag::Last, Tag::Unit];
        for make in prefixed {
            tags.extend(entities.iter().cloned().map(make));
        }
        tags.push(Tag::Start);
        tags.push(Tag::End);

        let vocab = Vocabulary::build(tags.iter().map(Tag::to_string), OUTSIDE_SYMBOL);
        Self {
            vocab,
            outside_id: 0,
            start_id: tags.len() - 2,
            end_id: tags.len() - 1,
            tags,
        }
    }

    /// Interpret an existing tag vocabulary (e.g. one restored from disk).
    ///
    /// Every symbol must parse as a tag and `O`, `<start>` and `<end>` must
    /// all be present.
    pub fn from_vocabulary(vocab: Vocabulary) -> Result<Self> {
        let tags = vocab
            .symbols()
            .map(Tag::parse)
            .collect::<Result<Vec<_>>>()?;

        let require = |symbol: &str| {
            vocab
                .get(symbol)
                .ok_or_else(|| SeqLabelError::InvalidTag(format!("tag set lacks {symbol}")))
        };
        let outside_id = require(OUTSIDE_SYMBOL)?;
        let start_id = require(START_SYMBOL)?;
        let end_id = require(END_SYMBOL)?;

        Ok(Self {
            vocab,
            tags,
            outside_id,
            start_id,
            end_id,
        })
    }

    /// Number of tags, pseudo-tags included.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tag(&self, id: usize) -> Option<&Tag> {
        self.tags.get(id)
    }

    pub fn id(&self, tag: &Tag) -> Option<usize> {
        self.vocab.get(&tag.to_string())
    }

    /// Id of a tag symbol; unknown symbols resolve to the vocabulary's unknown id.
    pub fn lookup(&self, symbol: &str) -> usize {
        self.vocab.lookup(symbol)
    }

    pub fn outside_id(&self) -> usize {
        self.outside_id
    }

    pub fn start_id(&self) -> usize {
        self.start_id
    }

    pub fn end_id(&self) -> usize {
        self.end_id
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Tags paired with their ids, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Tag)> {
        self.tags.iter().enumerate()
    }

    /// Base entity types present in the tag set.
    pub fn entity_types(&self) -> BTreeSet<&str> {
        self.tags.iter().filter_map(Tag::entity_type).collect()
    }

    /// Ids of `B-*` and `I-*` tags, after which a span is still open.
    pub fn open_span_ids(&self) -> Vec<usize> {
        self.iter()
            .filter(|(_, tag)| tag.is_begin() || tag.is_inside())
            .map(|(id, _)| id)
            .collect()
    }

    /// Resolve a sequence of tag ids to tags.
    pub fn resolve(&self, ids: &[usize]) -> Result<Vec<Tag>> {
        ids.iter()
            .map(|&id| {
                self.tag(id).cloned().ok_or(SeqLabelError::DimensionMismatch {
                    what: "tag id",
                    expected: self.len(),
                    actual: id,
                })
            })
            .collect()
    }
}
