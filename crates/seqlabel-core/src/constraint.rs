//! # Domain Constraint Compilation
//!
//! Turns a human-authored `domain -> [entity, ...]` document into one boolean
//! transition-legality matrix per intent id. A transition is legal for a
//! domain when the BILUO grammar allows it and every entity type it touches is
//! permitted in that domain.
//!
//! Compilation happens once at setup; the resulting [`DomainMasks`] is shared
//! read-only by the CRF.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SeqLabelError};
use crate::tags::{Tag, TagSet};
use crate::vocab::Vocabulary;

/// Raw constraint document: allowed entity types per domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintSpec {
    domains: BTreeMap<String, BTreeSet<String>>,
}

impl ConstraintSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `entities` inside `domain` (merging with earlier entries).
    pub fn allow<I, S>(mut self, domain: &str, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .extend(entities.into_iter().map(Into::into));
        self
    }

    /// Parse a JSON mapping of domain name to entity list.
    ///
    /// # Examples
    /// ```
    /// use seqlabel_core::constraint::ConstraintSpec;
    ///
    /// let spec = ConstraintSpec::from_json_str(r#"{"weather": ["city", "date"]}"#).unwrap();
    /// assert!(spec.allowed("weather").unwrap().contains("city"));
    /// assert!(ConstraintSpec::from_json_str(r#"["city"]"#).is_err());
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SeqLabelError::ConstraintParse(e.to_string()))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn allowed(&self, domain: &str) -> Option<&BTreeSet<String>> {
        self.domains.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.domains.iter().map(|(d, e)| (d.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Keep only domains known to `intents` and entity types present in `tags`.
    pub fn filter(&self, tags: &TagSet, intents: &Vocabulary) -> Self {
        let known_entities = tags.entity_types();
        let mut domains = BTreeMap::new();

        for (domain, entities) in &self.domains {
            if !intents.contains(domain) {
                debug!(domain = %domain, "dropping constraint for unseen intent");
                continue;
            }

            let kept: BTreeSet<String> = entities
                .iter()
                .filter(|entity| {
                    let known = known_entities.contains(entity.as_str());
                    if !known {
                        debug!(domain = %domain, entity = %entity, "dropping entity without tags");
                    }
                    known
                })
                .cloned()
                .collect();
            domains.insert(domain.clone(), kept);
        }

        Self { domains }
    }
}

/// What intents without a constraint entry are allowed to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// No entity at all: only the all-`O` sequence is legal.
    #[default]
    OutsideOnly,
    /// Every entity of the tag set, i.e. the bare BILUO grammar.
    AllEntities,
}

/// Configuration for the constraint compiler.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    /// Policy for intents the constraint document does not mention
    pub fallback: FallbackPolicy,
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }
}

/// Boolean `num_tags x num_tags` legality matrix, row = from, column = to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionMask {
    num_tags: usize,
    cells: Vec<bool>,
}

impl TransitionMask {
    /// A mask with every transition disallowed.
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            cells: vec![false; num_tags * num_tags],
        }
    }

    /// Build a mask from nested rows; every row must have `rows.len()` cells.
    pub fn from_rows(rows: &[Vec<bool>]) -> Result<Self> {
        let num_tags = rows.len();
        let mut mask = Self::new(num_tags);
        for (from, row) in rows.iter().enumerate() {
            if row.len() != num_tags {
                return Err(SeqLabelError::DimensionMismatch {
                    what: "transition mask row",
                    expected: num_tags,
                    actual: row.len(),
                });
            }
            mask.cells[from * num_tags..(from + 1) * num_tags].copy_from_slice(row);
        }
        Ok(mask)
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn allows(&self, from: usize, to: usize) -> bool {
        self.cells[from * self.num_tags + to]
    }

    pub fn set(&mut self, from: usize, to: usize, allowed: bool) {
        self.cells[from * self.num_tags + to] = allowed;
    }

    pub fn row(&self, from: usize) -> &[bool] {
        &self.cells[from * self.num_tags..(from + 1) * self.num_tags]
    }

    /// Number of legal successors of `from`.
    pub fn row_count(&self, from: usize) -> usize {
        self.row(from).iter().filter(|&&allowed| allowed).count()
    }

    /// Number of legal transitions overall.
    pub fn count_allowed(&self) -> usize {
        self.cells.iter().filter(|&&allowed| allowed).count()
    }
}

/// Per-intent transition masks stacked in intent-id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMasks {
    num_tags: usize,
    masks: Vec<TransitionMask>,
}

impl DomainMasks {
    /// Stack masks; all must share the same size.
    pub fn new(masks: Vec<TransitionMask>) -> Result<Self> {
        let num_tags = masks.first().map_or(0, TransitionMask::num_tags);
        if let Some(bad) = masks.iter().find(|m| m.num_tags() != num_tags) {
            return Err(SeqLabelError::DimensionMismatch {
                what: "stacked transition mask",
                expected: num_tags,
                actual: bad.num_tags(),
            });
        }
        Ok(Self { num_tags, masks })
    }

    /// Number of intents (stacked masks).
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Mask for intent id `intent`.
    pub fn get(&self, intent: usize) -> Result<&TransitionMask> {
        self.masks.get(intent).ok_or_else(|| {
            SeqLabelError::InvalidIntent(format!(
                "intent id {intent} out of range for {} domains",
                self.masks.len()
            ))
        })
    }

    /// Intent id encoded by a one-hot vector.
    pub fn intent_from_one_hot(&self, one_hot: &[f32]) -> Result<usize> {
        if one_hot.len() != self.masks.len() {
            return Err(SeqLabelError::DimensionMismatch {
                what: "intent one-hot vector",
                expected: self.masks.len(),
                actual: one_hot.len(),
            });
        }

        let mut selected = None;
        for (id, &value) in one_hot.iter().enumerate() {
            if value == 1.0 {
                if selected.is_some() {
                    return Err(SeqLabelError::InvalidIntent(
                        "one-hot vector selects more than one intent".into(),
                    ));
                }
                selected = Some(id);
            } else if value != 0.0 {
                return Err(SeqLabelError::InvalidIntent(format!(
                    "one-hot vector holds {value} at position {id}"
                )));
            }
        }

        selected.ok_or_else(|| SeqLabelError::InvalidIntent("one-hot vector is all zeros".into()))
    }

    /// Mask selected by a one-hot intent vector.
    pub fn select(&self, one_hot: &[f32]) -> Result<&TransitionMask> {
        self.get(self.intent_from_one_hot(one_hot)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransitionMask> {
        self.masks.iter()
    }
}

/// Compiles constraint documents into [`DomainMasks`].
#[derive(Debug, Clone, Default)]
pub struct ConstraintCompiler {
    config: CompilerConfig,
}

impl ConstraintCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Filter, order and generate the per-intent masks.
    pub fn compile(&self, raw: &ConstraintSpec, tags: &TagSet, intents: &Vocabulary) -> DomainMasks {
        let filtered = raw.filter(tags, intents);
        let ordered = self.order(&filtered, tags, intents);

        let masks: Vec<TransitionMask> = ordered
            .iter()
            .map(|(_, allowed)| generate_mask(allowed, tags))
            .collect();

        info!(
            domains = filtered.len(),
            intents = intents.size(),
            tags = tags.len(),
            "compiled domain transition masks"
        );

        DomainMasks {
            num_tags: tags.len(),
            masks,
        }
    }

    /// One `(intent_id, allowed_entities)` entry per intent id, ascending.
    pub fn order(
        &self,
        filtered: &ConstraintSpec,
        tags: &TagSet,
        intents: &Vocabulary,
    ) -> Vec<(usize, BTreeSet<String>)> {
        (0..intents.size())
            .map(|id| {
                let domain = intents.inverse(id).unwrap_or_default();
                let allowed = match filtered.allowed(domain) {
                    Some(entities) => entities.clone(),
                    None => {
                        debug!(domain = %domain, policy = ?self.config.fallback, "intent has no constraint entry");
                        match self.config.fallback {
                            FallbackPolicy::OutsideOnly => BTreeSet::new(),
                            FallbackPolicy::AllEntities => tags
                                .entity_types()
                                .into_iter()
                                .map(str::to_string)
                                .collect(),
                        }
                    }
                };
                (id, allowed)
            })
            .collect()
    }
}

/// Legality matrix for one domain over `tags`.
pub fn generate_mask(allowed: &BTreeSet<String>, tags: &TagSet) -> TransitionMask {
    let permitted = |tag: &Tag| tag.entity_type().is_none_or(|e| allowed.contains(e));

    let mut mask = TransitionMask::new(tags.len());
    for (from_id, from) in tags.iter() {
        if !permitted(from) {
            continue;
        }
        for (to_id, to) in tags.iter() {
            if permitted(to) && Tag::is_valid_transition(from, to) {
                mask.set(from_id, to_id, true);
            }
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::UNKNOWN_SYMBOL;

    fn fixtures() -> (TagSet, Vocabulary, ConstraintSpec) {
        let tags = TagSet::from_entities(["X", "Y"]);
        let intents = Vocabulary::build(["Y-domain", "X-domain"], UNKNOWN_SYMBOL);
        let spec = ConstraintSpec::new()
            .allow("Y-domain", ["Y"])
            .allow("X-domain", ["X", "Z"])
            .allow("retired-domain", ["X"]);
        (tags, intents, spec)
    }

    #[test]
    fn test_filter_drops_unknown_domains_and_entities() {
        let (tags, intents, spec) = fixtures();
        let filtered = spec.filter(&tags, &intents);

        assert_eq!(filtered.len(), 2);
        assert!(filtered.allowed("retired-domain").is_none());
        let x: Vec<_> = filtered.allowed("X-domain").unwrap().iter().collect();
        assert_eq!(x, ["X"]);
    }

    #[test]
    fn test_order_follows_intent_ids() {
        let (tags, intents, spec) = fixtures();
        let compiler = ConstraintCompiler::default();
        let ordered = compiler.order(&spec.filter(&tags, &intents), &tags, &intents);

        let ids: Vec<usize> = ordered.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [0, 1, 2]);
        assert!(ordered[0].1.is_empty());
        assert!(ordered[1].1.contains("Y"));
        assert!(ordered[2].1.contains("X"));
    }

    #[test]
    fn test_y_only_matrix() {
        let (tags, intents, spec) = fixtures();
        let masks = ConstraintCompiler::default().compile(&spec, &tags, &intents);
        let y_only = masks.get(intents.lookup("Y-domain")).unwrap();

        let id = |s: &str| tags.lookup(s);
        assert!(y_only.allows(id("O"), id("B-Y")));
        assert!(y_only.allows(id("B-Y"), id("I-Y")));
        assert!(y_only.allows(id("I-Y"), id("L-Y")));
        assert!(y_only.allows(id("L-Y"), id("U-Y")));
        assert!(y_only.allows(id("U-Y"), id("<end>")));
        assert!(y_only.allows(id("<start>"), id("O")));

        for x in ["B-X", "I-X", "L-X", "U-X"] {
            assert_eq!(y_only.row_count(id(x)), 0, "{x} must have no successors");
            for from in 0..tags.len() {
                assert!(!y_only.allows(from, id(x)), "{x} must be unreachable");
            }
        }
        assert!(!y_only.allows(id("B-Y"), id("O")));
        assert!(!y_only.allows(id("<start>"), id("<end>")));
    }

    #[test]
    fn test_start_row_counts() {
        let (tags, intents, spec) = fixtures();
        let compiler = ConstraintCompiler::new(CompilerConfig::new());
        let masks = compiler.compile(&spec, &tags, &intents);

        // <UNK> has no entry: only O; Y-domain: O, B-Y, U-Y; X-domain: O, B-X, U-X.
        let expected = [1, 3, 3];
        for (intent, mask) in masks.iter().enumerate() {
            assert_eq!(mask.row_count(tags.start_id()), expected[intent]);
        }
    }

    #[test]
    fn test_empty_domain_keeps_outside_path() {
        let tags = TagSet::from_entities(["X"]);
        let intents = Vocabulary::build(["quiet"], UNKNOWN_SYMBOL);
        let spec = ConstraintSpec::new().allow("quiet", Vec::<String>::new());
        let masks = ConstraintCompiler::default().compile(&spec, &tags, &intents);
        let quiet = masks.get(intents.lookup("quiet")).unwrap();

        let (o, start, end) = (tags.outside_id(), tags.start_id(), tags.end_id());
        assert!(quiet.allows(start, o));
        assert!(quiet.allows(o, o));
        assert!(quiet.allows(o, end));
        assert_eq!(quiet.count_allowed(), 3);
    }

    #[test]
    fn test_all_entities_fallback() {
        let tags = TagSet::from_entities(["X", "Y"]);
        let intents = Vocabulary::build(["free"], UNKNOWN_SYMBOL);
        let compiler =
            ConstraintCompiler::new(CompilerConfig::new().with_fallback(FallbackPolicy::AllEntities));
        let masks = compiler.compile(&ConstraintSpec::new(), &tags, &intents);

        assert_eq!(masks.len(), 2);
        assert_eq!(masks.get(1).unwrap().row_count(tags.start_id()), 5);
    }

    #[test]
    fn test_matrix_is_directed() {
        let (tags, intents, spec) = fixtures();
        let masks = ConstraintCompiler::default().compile(&spec, &tags, &intents);
        let x_only = masks.get(intents.lookup("X-domain")).unwrap();
        let (b, i) = (tags.lookup("B-X"), tags.lookup("I-X"));
        assert!(x_only.allows(b, i));
        assert!(!x_only.allows(i, b));
    }

    #[test]
    fn test_select_by_one_hot() {
        let (tags, intents, spec) = fixtures();
        let masks = ConstraintCompiler::default().compile(&spec, &tags, &intents);

        let selected = masks.select(&[0.0, 0.0, 1.0]).unwrap();
        assert_eq!(selected, masks.get(2).unwrap());
        assert!(masks.select(&[0.0, 1.0]).is_err());
        assert!(masks.select(&[0.0, 1.0, 1.0]).is_err());
        assert!(masks.select(&[0.0, 0.0, 0.0]).is_err());
        assert!(masks.select(&[0.0, 0.5, 0.5]).is_err());
        assert!(masks.get(3).is_err());
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            ConstraintSpec::from_json_str(r#"{"weather": "city"}"#),
            Err(SeqLabelError::ConstraintParse(_))
        ));
        assert!(ConstraintSpec::from_json_str("not json").is_err());
    }

    #[test]
    fn test_from_rows_validates_width() {
        assert!(TransitionMask::from_rows(&[vec![true, false], vec![true]]).is_err());
        let mask = TransitionMask::from_rows(&[vec![true, false], vec![false, true]]).unwrap();
        assert!(mask.allows(1, 1));
        assert!(!mask.allows(0, 1));
        assert!(DomainMasks::new(vec![mask, TransitionMask::new(3)]).is_err());
    }
}
