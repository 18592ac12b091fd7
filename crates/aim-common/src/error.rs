//! Centralized error types for AIM.
//!
//! Every surfaced error carries a category (`api`, `crypto`, `storage`,
//! `network`). The category decides retry policy in the dispatch loop, the
//! RPC error-code band, and which observability counter is bumped. Unknown
//! inputs normalize to `api`.

use serde::{Deserialize, Serialize};

/// Error category attached to every [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Malformed input, validation failure, not-found.
    Api,
    /// Signature, pin, decrypt, or key-material failure.
    Crypto,
    /// State envelope / repository failure.
    Storage,
    /// Transport publish/subscribe failure. The only retryable category.
    Network,
}

impl ErrorCategory {
    /// Stable lowercase name, used in logs and notification payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Crypto => "crypto",
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }

    /// Only network failures drive exponential backoff in the dispatch loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core application error type used across all AIM crates.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // === Validation / lookup ===
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("invalid group wire payload")]
    InvalidGroupWirePayload,

    // === Message ownership ===
    #[error("only outbound messages can be edited")]
    NotOutbound,

    #[error("message does not belong to contact")]
    WrongContact,

    #[error("failed to allocate unique message id")]
    MessageIdExhausted,

    // === Backup consent ===
    #[error("backup export requires explicit consent token")]
    ConsentRequired,

    #[error("backup password is required")]
    BackupPasswordRequired,

    // === Trust / crypto ===
    #[error("contact public key does not match pinned key")]
    ContactKeyMismatch,

    #[error("sender is not verified and supplied no contact card")]
    UnverifiedSenderMissingCard,

    #[error("crypto failure: {message}")]
    Crypto { message: String },

    // === Infrastructure ===
    #[error("storage failure: {message}")]
    Storage { message: String },

    #[error("network failure: {message}")]
    Network { message: String },

    #[error("capability not supported: {capability}")]
    NotSupported { capability: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Shorthand constructors, mirroring how call sites read.
    pub fn api(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto { message: message.into() }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Map error to its category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. }
            | Self::NotFound { .. }
            | Self::InvalidGroupWirePayload
            | Self::NotOutbound
            | Self::WrongContact
            | Self::ConsentRequired
            | Self::BackupPasswordRequired
            | Self::NotSupported { .. }
            | Self::Internal(_) => ErrorCategory::Api,
            Self::ContactKeyMismatch
            | Self::UnverifiedSenderMissingCard
            | Self::Crypto { .. } => ErrorCategory::Crypto,
            Self::MessageIdExhausted | Self::Storage { .. } => ErrorCategory::Storage,
            Self::Network { .. } => ErrorCategory::Network,
        }
    }
}

/// Convenience type alias for Results using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

/// Observability sink: record a categorized error.
///
/// Emits a structured tracing event; a metrics layer can subscribe on the
/// `aim::error` target and count per category.
pub fn record_error(category: ErrorCategory, err: &dyn std::fmt::Display) {
    tracing::warn!(target: "aim::error", category = category.as_str(), error = %err, "recorded error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_drive_retry_policy() {
        assert!(ErrorCategory::Network.is_retryable());
        assert!(!ErrorCategory::Crypto.is_retryable());
        assert!(!ErrorCategory::Api.is_retryable());
        assert!(!ErrorCategory::Storage.is_retryable());
    }

    #[test]
    fn sentinel_messages_are_stable() {
        assert_eq!(
            CoreError::NotOutbound.to_string(),
            "only outbound messages can be edited"
        );
        assert_eq!(
            CoreError::WrongContact.to_string(),
            "message does not belong to contact"
        );
        assert_eq!(
            CoreError::MessageIdExhausted.to_string(),
            "failed to allocate unique message id"
        );
        assert_eq!(
            CoreError::ConsentRequired.to_string(),
            "backup export requires explicit consent token"
        );
        assert_eq!(
            CoreError::InvalidGroupWirePayload.to_string(),
            "invalid group wire payload"
        );
    }

    #[test]
    fn key_mismatch_is_crypto() {
        assert_eq!(CoreError::ContactKeyMismatch.category(), ErrorCategory::Crypto);
        assert_eq!(
            CoreError::api("bad input").category(),
            ErrorCategory::Api
        );
    }
}
