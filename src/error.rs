use thiserror::Error;

/// Typed errors surfaced by the pricing core.
///
/// None of these are fatal to the hosting process: `InvalidInput` and
/// `RegionIneligible` are recoverable by fixing the call, `Conflict` is
/// retried internally before it ever reaches a caller, and `Degraded`
/// signals that a cached or "try again" response is the right answer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("region {region} ineligible: {reason}")]
    RegionIneligible { region: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("write conflict on {key} after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    #[error("backing store degraded: {0}")]
    Degraded(String),

    #[error(transparent)]
    Storage(#[from] duckdb::Error),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn ineligible(region: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RegionIneligible {
            region: region.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
