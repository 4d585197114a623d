//! Corpus loading and preprocessing.
//!
//! A corpus is a JSON-lines file; every record carries the raw `text`, its
//! character-offset entity `spans` and an intent label under a configurable
//! field. Preprocessing turns records into id sequences over the character
//! vocabulary, the BILUO tag set and the intent vocabulary.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context};
use seqlabel_core::{
    encode_text, BatcherConfig, SequenceBatcher, SequenceExample, Span, TagSet, Vocabulary,
    UNKNOWN_SYMBOL,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

/// One annotated utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedRecord {
    pub text: String,
    pub spans: Vec<Span>,
    pub intent: String,
}

impl AnnotatedRecord {
    /// Read a record from its JSON object, taking the intent from `intent_field`.
    pub fn from_json(value: &Value, intent_field: &str) -> anyhow::Result<Self> {
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("record has no string field \"text\""))?
            .to_string();
        let spans = match value.get("spans") {
            Some(spans) => Vec::<Span>::deserialize(spans).context("malformed \"spans\"")?,
            None => Vec::new(),
        };
        let intent = value
            .get(intent_field)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("record has no string field {intent_field:?}"))?
            .to_string();
        Ok(Self {
            text,
            spans,
            intent,
        })
    }
}

/// Load a JSON-lines corpus. Blank lines and lines starting with `#` are skipped.
pub fn load_corpus<P: AsRef<Path>>(
    path: P,
    intent_field: &str,
) -> anyhow::Result<Vec<AnnotatedRecord>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("failed to open corpus {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), number + 1))?;
        let record = AnnotatedRecord::from_json(&value, intent_field)
            .with_context(|| format!("{}:{}", path.display(), number + 1))?;
        records.push(record);
    }

    info!(path = %path.display(), records = records.len(), "loaded corpus");
    Ok(records)
}

/// Vocabularies and tag set shared by training, evaluation and inference.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    tags: TagSet,
    chars: Vocabulary,
    intents: Vocabulary,
}

impl Preprocessor {
    /// Derive the tag set and intent vocabulary from a training corpus.
    ///
    /// Without a `chars` vocabulary, one is built from the characters of the
    /// corpus texts.
    pub fn fit(records: &[AnnotatedRecord], chars: Option<Vocabulary>) -> Self {
        let tags = TagSet::from_entities(
            records
                .iter()
                .flat_map(|r| r.spans.iter().map(|s| s.entity.as_str())),
        );
        let chars = chars.unwrap_or_else(|| {
            Vocabulary::build(
                records.iter().flat_map(|r| r.text.chars().map(String::from)),
                UNKNOWN_SYMBOL,
            )
        });
        let intents = Vocabulary::build(records.iter().map(|r| r.intent.as_str()), UNKNOWN_SYMBOL);

        info!(
            tags = tags.len(),
            chars = chars.size(),
            intents = intents.size(),
            "fitted preprocessor"
        );
        Self {
            tags,
            chars,
            intents,
        }
    }

    pub fn from_parts(tags: TagSet, chars: Vocabulary, intents: Vocabulary) -> Self {
        Self {
            tags,
            chars,
            intents,
        }
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn chars(&self) -> &Vocabulary {
        &self.chars
    }

    pub fn intents(&self) -> &Vocabulary {
        &self.intents
    }

    /// Character ids of `text`.
    pub fn encode_text(&self, text: &str) -> Vec<usize> {
        text.chars().map(|c| self.chars.lookup(&c.to_string())).collect()
    }

    /// Encode one record. Entities and intents outside the fitted
    /// vocabularies fall back to `O` and the unknown intent.
    pub fn encode(&self, record: &AnnotatedRecord) -> seqlabel_core::Result<SequenceExample> {
        let tag_ids = encode_text(&record.text, &record.spans)?
            .iter()
            .map(|tag| self.tags.lookup(&tag.to_string()))
            .collect();
        SequenceExample::new(
            self.encode_text(&record.text),
            tag_ids,
            self.intents.lookup(&record.intent),
        )
    }

    /// Encode every record; records with malformed spans are dropped.
    pub fn encode_all(&self, records: &[AnnotatedRecord]) -> Vec<SequenceExample> {
        records
            .iter()
            .enumerate()
            .filter_map(|(i, record)| match self.encode(record) {
                Ok(example) => Some(example),
                Err(e) => {
                    debug!(record = i, error = %e, "dropping record");
                    None
                }
            })
            .collect()
    }

    /// Batcher padding tokens with the unknown character and tags with `O`.
    /// Truncation backs off to the last span boundary.
    pub fn batcher(&self, max_len: usize) -> SequenceBatcher {
        SequenceBatcher::new(
            BatcherConfig::new(self.intents.size())
                .with_max_len(Some(max_len))
                .with_token_pad_id(self.chars.unknown_id())
                .with_tag_pad_id(self.tags.outside_id())
                .with_open_tag_ids(self.tags.open_span_ids()),
        )
    }
}
