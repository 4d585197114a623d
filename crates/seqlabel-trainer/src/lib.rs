//! # seqlabel Trainer
//!
//! Trains an intent-aware entity tagger: a character-level candle encoder
//! produces emission scores and the domain-constrained CRF from
//! `seqlabel-core` supplies the loss, its gradients and decoding.

pub mod config;
pub mod data;
pub mod model;
pub mod trainer;

pub use config::TrainerConfig;
pub use data::{load_corpus, AnnotatedRecord, Preprocessor};
pub use model::{EmissionEncoder, EncoderConfig};
pub use trainer::{run_training, EpochStats, Trainer};
