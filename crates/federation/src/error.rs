use thiserror::Error;

/// Everything that can go wrong between fetching federation metadata and validating a token.
///
/// The enum is `Clone` because a failed bootstrap hands the very same error to every caller
/// that asks for the validation parameters afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FederationError {
    /// Network level failure talking to the metadata endpoint (connect, timeout, bad status).
    #[error("federation metadata unreachable: {0}")]
    MetadataUnreachable(String),
    /// The metadata endpoint answered but the document could not be understood.
    #[error("federation metadata malformed: {0}")]
    MetadataMalformed(String),
    /// Missing realm/metadata address, or trust parameters that never finished initializing.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A single token was rejected. Never affects any other request.
    #[error("token validation failed: {0}")]
    ValidationFailure(String),
}

impl FederationError {
    /// Only network failures are worth trying again without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FederationError::MetadataUnreachable(_))
    }
}

pub type FederationResult<T> = Result<T, FederationError>;
