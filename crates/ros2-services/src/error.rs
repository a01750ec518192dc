// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for service operations.

use crate::identity::SampleIdentity;
use thiserror::Error;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors that can occur while issuing or serving requests.
///
/// `Clone` so that one failure (engine close, channel error) can be handed
/// to every pending request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Identity metadata has the wrong length
    #[error("malformed sample identity: expected 24 bytes, got {len}")]
    MalformedIdentity { len: usize },

    /// Legacy and standard identity slots disagree
    #[error("mismatch between legacy identity {legacy:?} and related identity {standard:?}")]
    IdentityMismatch {
        legacy: SampleIdentity,
        standard: SampleIdentity,
    },

    /// Request id registered twice
    #[error("request id {0} is already pending")]
    DuplicateId(u64),

    /// Engine closed while the request was pending
    #[error("service closed before a response arrived")]
    ServiceClosed,

    /// Operation attempted after close
    #[error("service already closed")]
    AlreadyClosed,

    /// Operation requires a started engine
    #[error("service not started")]
    NotStarted,

    /// No tokio runtime to run handlers on
    #[error("no tokio runtime available for handler execution")]
    NoRuntime,

    /// Transport collaborator failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload encode/decode failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ServiceError {
    /// Protocol-integrity violations that poison a client engine.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Self::IdentityMismatch { .. })
    }
}

/// Errors reported by the pub/sub transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("topic '{topic}' is bound to type '{existing}', not '{requested}'")]
    TypeMismatch {
        topic: String,
        existing: String,
        requested: String,
    },

    #[error("publication on '{0}' is closed")]
    PublicationClosed(String),

    #[error("channel '{topic}' failed: {reason}")]
    Channel { topic: String, reason: String },

    #[error("transport is shut down")]
    Shutdown,
}

/// Errors reported by a payload codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of payload: need {needed} bytes, have {available}")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("invalid payload: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;

    #[test]
    fn error_display() {
        let err = ServiceError::MalformedIdentity { len: 3 };
        assert!(err.to_string().contains("got 3"));

        let err = ServiceError::DuplicateId(9);
        assert!(err.to_string().contains('9'));

        let err: ServiceError = TransportError::Shutdown.into();
        assert!(err.to_string().contains("shut down"));
    }

    #[test]
    fn mismatch_is_protocol_fault() {
        let err = ServiceError::IdentityMismatch {
            legacy: SampleIdentity::new(Guid::zero(), 1),
            standard: SampleIdentity::new(Guid::zero(), 2),
        };
        assert!(err.is_protocol_fault());
        assert!(!ServiceError::ServiceClosed.is_protocol_fault());
    }
}
