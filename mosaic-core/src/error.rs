use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown identifier, revision, or a required file the source does not have.
    #[error("cannot resolve model `{identifier}`: {reason}")]
    Resolution { identifier: String, reason: String },

    /// Shape/precision mismatch or allocation failure while building replicas.
    #[error("cannot load model `{identifier}`: {source}")]
    Load {
        identifier: String,
        #[source]
        source: BoxError,
    },

    #[error("generation failed on device {replica}: {source}")]
    Generation {
        replica: usize,
        #[source]
        source: BoxError,
    },

    #[error("decoding failed on device {replica}: {source}")]
    Decode {
        replica: usize,
        #[source]
        source: BoxError,
    },

    #[error("scoring failed: {0}")]
    Score(#[source] BoxError),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The generator output does not carry exactly one leading control token.
    #[error("expected {expected} tokens per sample, found {found}")]
    TokenLength { expected: usize, found: usize },

    /// A backend returned a batch whose size differs from the prompt rows.
    #[error("expected {expected} samples per device, found {found}")]
    BatchSize { expected: usize, found: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn resolution(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn load(identifier: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Load {
            identifier: identifier.into(),
            source: source.into(),
        }
    }
}

/// Converts a backend `anyhow::Error` into a boxed std error, keeping its context chain.
pub(crate) fn boxed(err: anyhow::Error) -> BoxError {
    err.into()
}
