//! # seqlabel Core
//!
//! Entity tagging under a linear-chain CRF whose tag transitions are
//! restricted per intent (domain). Provides the vocabulary and BILUO tag
//! machinery, the compiler that turns `domain -> allowed entities` documents
//! into transition masks, and the masked CRF loss and Viterbi decoder.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use seqlabel_core::{ConstrainedCrf, ConstraintCompiler, ConstraintSpec, TagSet, Vocabulary};
//!
//! let tags = TagSet::from_entities(["X", "Y"]);
//! let intents = Vocabulary::build(["Y-only"], "<UNK>");
//! let spec = ConstraintSpec::from_json_str(r#"{"Y-only": ["Y"]}"#).unwrap();
//! let masks = ConstraintCompiler::default().compile(&spec, &tags, &intents);
//!
//! let crf = ConstrainedCrf::new(&tags, Arc::new(masks)).unwrap();
//! let mut emissions = vec![vec![0.0; tags.len()]; 2];
//! emissions[0][tags.lookup("U-X")] = 10.0;
//!
//! let path = crf.decode(&emissions, intents.lookup("Y-only")).unwrap();
//! assert!(path.iter().all(|&id| id != tags.lookup("U-X")));
//! ```
pub mod batch;
pub mod biluo;
pub mod constraint;
pub mod crf;
pub mod error;
pub mod metrics;
pub mod tags;
pub mod vocab;

// Re-export primary API
pub use batch::{BatcherConfig, PaddedBatch, SequenceBatcher, SequenceExample};
pub use biluo::{decode_spans, encode_biluo, encode_text, Span};
pub use constraint::{
    CompilerConfig, ConstraintCompiler, ConstraintSpec, DomainMasks, FallbackPolicy,
    TransitionMask,
};
pub use crf::{BatchLoss, ConstrainedCrf, CrfGradients, EmissionSource};
pub use error::{Result, SeqLabelError};
pub use metrics::{ClassificationReport, SequenceMetrics, SpanScores, TagScore};
pub use tags::{Tag, TagSet};
pub use vocab::{Vocabulary, UNKNOWN_SYMBOL};
