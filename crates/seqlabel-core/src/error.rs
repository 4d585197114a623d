use thiserror::Error;

/// Errors that can occur during seqlabel core operations.
#[derive(Debug, Error)]
pub enum SeqLabelError {
    /// A labeled span is empty, out of range, or overlaps another span.
    #[error("invalid span {start}..{end} ({entity}): {reason}")]
    InvalidSpan {
        start: usize,
        end: usize,
        entity: String,
        reason: String,
    },

    /// A tag sequence does not follow the BILUO grammar.
    #[error("invalid tag sequence at position {position}: {reason}")]
    InvalidTagSequence { position: usize, reason: String },

    /// A tag symbol could not be parsed.
    #[error("invalid tag symbol: {0:?}")]
    InvalidTag(String),

    /// The constraint document is not a mapping of domain to entity list.
    #[error("malformed constraint document: {0}")]
    ConstraintParse(String),

    /// Two structures that must agree on a dimension do not.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Parallel sequences (tokens and tags, emissions and tags) differ in length.
    #[error("length mismatch: {left} has {left_len} items, {right} has {right_len}")]
    LengthMismatch {
        left: &'static str,
        left_len: usize,
        right: &'static str,
        right_len: usize,
    },

    /// An intent id or one-hot vector does not select exactly one domain mask.
    #[error("invalid intent selection: {0}")]
    InvalidIntent(String),

    /// The gold tag sequence uses a transition its domain forbids.
    #[error("gold path uses a disallowed transition {from} -> {to} at position {position}")]
    IllegalGoldPath {
        position: usize,
        from: usize,
        to: usize,
    },

    /// No tag sequence is legal under the selected mask.
    #[error("no legal tag path for a sequence of length {0}")]
    NoLegalPath(usize),

    /// The loss became NaN or infinite.
    #[error("non-finite loss: {0}")]
    NonFiniteLoss(f32),

    /// Filesystem failure while reading or writing persisted state.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for seqlabel operations.
pub type Result<T> = std::result::Result<T, SeqLabelError>;
