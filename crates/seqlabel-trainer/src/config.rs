//! Training configuration, read from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Hyperparameters and file locations for one training run.
///
/// Every field has a default, so a config file only needs the entries it
/// changes (in practice at least `train_file` and `constraint_file`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub embedding_dim: usize,
    /// Combined hidden size of the bidirectional LSTM; each direction gets half
    pub lstm_size: usize,
    /// Sequences are padded or truncated to this many characters
    pub max_len: usize,
    pub batch_size: usize,
    /// AdamW learning rate for the encoder
    pub learning_rate: f64,
    /// Plain gradient-descent step size for the CRF transitions
    pub transition_learning_rate: f32,
    /// JSON-lines training corpus
    pub train_file: PathBuf,
    /// Optional JSON-lines evaluation corpus
    pub eval_file: Option<PathBuf>,
    /// JSON `domain -> [entity, ...]` document
    pub constraint_file: PathBuf,
    /// One-symbol-per-line character list; built from the corpus when absent
    pub vocabulary_file: Option<PathBuf>,
    /// Record field holding the intent label
    pub intent_field: String,
    pub model_dir: PathBuf,
    /// Continue from the newest checkpoint under `model_dir/checkpoints`
    pub resume: bool,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            embedding_dim: 64,
            lstm_size: 64,
            max_len: 25,
            batch_size: 32,
            learning_rate: 1e-3,
            transition_learning_rate: 0.1,
            train_file: PathBuf::from("data/train.jsonl"),
            eval_file: None,
            constraint_file: PathBuf::from("data/constraint.json"),
            vocabulary_file: None,
            intent_field: "domain".to_string(),
            model_dir: PathBuf::from("models"),
            resume: true,
            seed: 42,
        }
    }
}

impl TrainerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_model_dir(mut self, model_dir: impl Into<PathBuf>) -> Self {
        self.model_dir = model_dir.into();
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_len > 0, "max_len must be positive");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(self.embedding_dim > 0, "embedding_dim must be positive");
        anyhow::ensure!(
            self.lstm_size >= 2 && self.lstm_size % 2 == 0,
            "lstm_size must be a positive even number, got {}",
            self.lstm_size
        );
        anyhow::ensure!(!self.intent_field.is_empty(), "intent_field must not be empty");
        Ok(())
    }
}
