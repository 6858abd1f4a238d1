use thiserror::Error;

/// Failure kinds surfaced by the labeling core.
///
/// Empty inputs (no CUSUM events, every event filtered by the minimum
/// return floor) are not errors; they flow through as empty results.
#[derive(Debug, Error)]
pub enum LabelError {
    /// Invalid run parameters, raised before any computation starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The price series (or an aligned input) violates the ingestion contract.
    #[error("data error: {0}")]
    Data(String),

    /// A molecule failed inside the parallel executor. The whole call is
    /// aborted and no partial output is returned.
    #[error("worker failure in molecule {molecule}: {reason}")]
    WorkerFailure { molecule: usize, reason: String },

    /// A degenerate division was about to produce an infinite or undefined value.
    #[error("numeric domain error: {0}")]
    NumericDomain(String),
}

impl LabelError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        Self::NumericDomain(message.into())
    }
}

pub type LabelResult<T> = Result<T, LabelError>;
