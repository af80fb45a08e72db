//! Error types for filter chain configuration.

use portcullis_networking::NetworkError;
use thiserror::Error;

/// Errors that reject a whole filter chain batch.
///
/// Any of these leaves the currently active generation untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two chains in the batch carry structurally equal match criteria.
    #[error("error adding listener '{listener}': multiple filter chains with the same matching rules are defined")]
    DuplicateMatchRule { listener: String },

    /// Two chains expand onto the same final match slot.
    #[error("error adding listener '{listener}': multiple filter chains with overlapping matching rules are defined")]
    OverlappingMatchRule { listener: String },

    /// A destination or source range failed to parse.
    #[error("error adding listener '{listener}': {source}")]
    InvalidCidr {
        listener: String,
        #[source]
        source: NetworkError,
    },

    /// A server name uses a wildcard other than a single leading `*.`.
    #[error("error adding listener '{listener}': partial wildcards are not supported in \"server_names\" ({server_name})")]
    UnsupportedWildcard {
        listener: String,
        server_name: String,
    },

    /// A match field that is accepted by the schema but not implemented.
    #[error("error adding listener '{listener}': contains filter chains with unimplemented fields ({field})")]
    UnimplementedField {
        listener: String,
        field: &'static str,
    },

    /// The chain builder refused a descriptor.
    #[error("error adding listener '{listener}': failed to build filter chain '{chain}': {reason}")]
    ChainBuild {
        listener: String,
        chain: String,
        reason: String,
    },

    /// A transport socket, network filter or listener filter name is not registered.
    #[error("unknown {kind} factory '{name}'")]
    UnknownFactory { kind: &'static str, name: String },
}

impl ConfigError {
    /// Returns true for errors caused by the match criteria themselves rather
    /// than by the chain contents.
    pub fn is_match_error(&self) -> bool {
        !matches!(
            self,
            ConfigError::ChainBuild { .. } | ConfigError::UnknownFactory { .. }
        )
    }
}

/// Result alias for configuration operations.
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
