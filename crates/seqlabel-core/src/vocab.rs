//! # Vocabulary
//!
//! Bidirectional symbol <-> id mapping used for input tokens, tag symbols and
//! intents. Lookup is total: a symbol the vocabulary has never seen resolves to
//! the unknown id, which is an ordinary entry of the vocabulary.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqLabelError};

/// Default unknown symbol for token and intent vocabularies.
pub const UNKNOWN_SYMBOL: &str = "<UNK>";

/// Frozen symbol table with first-seen id assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    symbols: Vec<String>,
    index: HashMap<String, usize>,
    unknown_id: usize,
}

/// On-disk layout: position in `symbols` is the id.
#[derive(Debug, Serialize, Deserialize)]
struct VocabularyFile {
    unknown_id: usize,
    symbols: Vec<String>,
}

impl Vocabulary {
    /// Build a vocabulary from symbols in first-seen order.
    ///
    /// The unknown symbol always receives id 0; later occurrences of it (and
    /// any other duplicate) keep their first id.
    ///
    /// # Examples
    /// ```
    /// use seqlabel_core::vocab::Vocabulary;
    ///
    /// let vocab = Vocabulary::build(["O", "B-X", "I-X"], "<UNK>");
    /// assert_eq!(vocab.lookup("B-X"), 2);
    /// assert_eq!(vocab.lookup("never-seen"), vocab.unknown_id());
    /// ```
    pub fn build<I, S>(symbols: I, unknown: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vocab = Self {
            symbols: Vec::new(),
            index: HashMap::new(),
            unknown_id: 0,
        };
        vocab.insert(unknown);
        for symbol in symbols {
            vocab.insert(symbol.as_ref());
        }
        vocab
    }

    fn insert(&mut self, symbol: &str) {
        if !self.index.contains_key(symbol) {
            self.index.insert(symbol.to_string(), self.symbols.len());
            self.symbols.push(symbol.to_string());
        }
    }

    /// Rebuild a vocabulary whose ids are exactly the positions in `symbols`.
    fn from_listing(symbols: Vec<String>, unknown_id: usize) -> Result<Self> {
        if unknown_id >= symbols.len() {
            return Err(SeqLabelError::DimensionMismatch {
                what: "vocabulary unknown id",
                expected: symbols.len(),
                actual: unknown_id,
            });
        }

        let mut index = HashMap::with_capacity(symbols.len());
        for (id, symbol) in symbols.iter().enumerate() {
            if index.insert(symbol.clone(), id).is_some() {
                return Err(SeqLabelError::InvalidTag(format!(
                    "duplicate vocabulary symbol {symbol:?}"
                )));
            }
        }

        Ok(Self {
            symbols,
            index,
            unknown_id,
        })
    }

    /// Id of `symbol`, or the unknown id when absent.
    pub fn lookup(&self, symbol: &str) -> usize {
        self.index.get(symbol).copied().unwrap_or(self.unknown_id)
    }

    /// Id of `symbol` only if it was part of the vocabulary.
    pub fn get(&self, symbol: &str) -> Option<usize> {
        self.index.get(symbol).copied()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.index.contains_key(symbol)
    }

    /// Symbol assigned to `id`.
    pub fn inverse(&self, id: usize) -> Option<&str> {
        self.symbols.get(id).map(String::as_str)
    }

    /// Number of distinct ids, the unknown id included.
    pub fn size(&self) -> usize {
        self.symbols.len()
    }

    pub fn unknown_id(&self) -> usize {
        self.unknown_id
    }

    /// Symbols in id order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    /// Persist the vocabulary as an ordered JSON listing.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = VocabularyFile {
            unknown_id: self.unknown_id,
            symbols: self.symbols.clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Restore a vocabulary written by [`Vocabulary::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let file: VocabularyFile = serde_json::from_str(&content)?;
        Self::from_listing(file.symbols, file.unknown_id)
    }

    /// Read a plain listing with one symbol per line (empty lines skipped).
    ///
    /// Ids follow line order; `unknown` gets id 0 if the file does not list it.
    pub fn load_lines<P: AsRef<Path>>(path: P, unknown: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let lines = content
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty());

        let listed: Vec<&str> = lines.collect();
        if listed.contains(&unknown) {
            let mut vocab = Self {
                symbols: Vec::new(),
                index: HashMap::new(),
                unknown_id: 0,
            };
            for symbol in listed {
                vocab.insert(symbol);
            }
            vocab.unknown_id = vocab.lookup(unknown);
            Ok(vocab)
        } else {
            Ok(Self::build(listed, unknown))
        }
    }
}
