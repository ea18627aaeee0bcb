use std::time::Duration;
use thiserror::Error;

/// Failures reported by the external collaborators (coordinator, factory,
/// sponsor, registry, operator wallet).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Execution reverted: {0}")]
    Reverted(String),
    #[error("Timed out waiting for receipt of {0}")]
    ReceiptTimeout(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Error taxonomy of the anchoring pipeline plus the service-level errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnchorError {
    #[error("Resolution error: {0}")]
    Resolution(String),
    #[error("Build error: {0}")]
    Build(String),
    #[error("Signature error: {0}")]
    Signature(String),
    #[error("Validation failure: {0}")]
    Validation(String),
    #[error("Sponsor failure: {0}")]
    Sponsor(String),
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Outcome uncertain: {0}")]
    TimeoutUncertain(String),
    #[error("Permanent failure: {0}")]
    Permanent(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid content: {0}")]
    InvalidContent(String),
    #[error("Illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

impl AnchorError {
    /// Transient failures are retried in place by the submission pipeline.
    pub fn is_transient(&self) -> bool {
        matches!(self, AnchorError::Network(_) | AnchorError::RateLimited { .. })
    }

    /// The on-chain effect may or may not have happened; only a registry
    /// lookup can settle it.
    pub fn is_uncertain(&self) -> bool {
        matches!(
            self,
            AnchorError::TimeoutUncertain(_)
                | AnchorError::Network(_)
                | AnchorError::RateLimited { .. }
        )
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnchorError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Maps a collaborator failure during submission onto the pipeline taxonomy.
/// Reverts mentioning the sponsor (ERC-4337 `AA3x` codes or paymaster text)
/// are sponsor failures; every other revert is a validation failure.
impl From<ChainError> for AnchorError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Network(msg) => AnchorError::Network(msg),
            ChainError::RateLimited { retry_after } => AnchorError::RateLimited { retry_after },
            ChainError::ReceiptTimeout(msg) => AnchorError::TimeoutUncertain(msg),
            ChainError::Malformed(msg) => AnchorError::Network(msg),
            ChainError::Reverted(reason) => {
                if is_sponsor_revert(&reason) {
                    AnchorError::Sponsor(reason)
                } else {
                    AnchorError::Validation(reason)
                }
            }
        }
    }
}

fn is_sponsor_revert(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    if lower.contains("paymaster") || lower.contains("sponsor") {
        return true;
    }
    // AA30..AA39 are the paymaster-side validation codes
    reason
        .match_indices("AA3")
        .any(|(i, _)| reason[i + 3..].chars().next().map_or(false, |c| c.is_ascii_digit()))
}
