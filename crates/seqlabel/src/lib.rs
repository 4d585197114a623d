//! # seqlabel
//!
//! Intent-aware named entity tagging. Entity tags follow the BILUO scheme and
//! decoding is restricted, per intent, to the entity types that intent's
//! domain allows.
//!
//! - [`seqlabel_core`]: vocabularies, BILUO encoding, constraint compilation, the
//!   masked CRF and evaluation metrics.
//! - [`seqlabel_trainer`]: corpus loading, the character-level emission encoder and
//!   the training loop.

pub use seqlabel_core;
pub use seqlabel_trainer;

pub use seqlabel_core::{
    ConstrainedCrf, ConstraintCompiler, ConstraintSpec, Result, SeqLabelError, Span, Tag, TagSet,
    Vocabulary,
};
pub use seqlabel_trainer::{Trainer, TrainerConfig};
