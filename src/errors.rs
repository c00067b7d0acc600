//! Service error kinds and their wire representation.
//!
//! # Purpose
//! Centralizes the error classification used at the HTTP boundary so every
//! handler produces the same `{"error":"<kind>","msg":"..."}` shape.
use serde::Serialize;

/// Fixed client-facing text for unclassified errors. The real cause is
/// logged server-side and never leaks to the client.
pub const INTERNAL_MSG: &str = "Ups, something went wrong!";

pub type Result<T> = std::result::Result<T, IccError>;

#[derive(Debug, thiserror::Error)]
pub enum IccError {
    /// Malformed input: bad JSON, missing required field, channel-id/user
    /// mismatch, non-integer query value.
    #[error("{0}")]
    Invalid(String),

    /// The caller is not allowed to perform the operation (anonymous where
    /// a user is required, not a meeting member, applause disabled).
    #[error("{0}")]
    NotAllowed(String),

    /// Authentication failed (bad or expired credentials).
    #[error("{0}")]
    Auth(String),

    /// Everything else: backend I/O, marshalling, unexpected states.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IccError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn not_allowed(msg: impl Into<String>) -> Self {
        Self::NotAllowed(msg.into())
    }

    /// Wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::NotAllowed(_) => "not-allowed",
            Self::Auth(_) => "auth",
            Self::Internal(_) => "internal",
        }
    }

    /// Message that may be sent to the client. Internal details stay out.
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => INTERNAL_MSG.to_string(),
            other => other.to_string(),
        }
    }

    /// JSON error envelope as sent in HTTP bodies.
    pub fn envelope(&self) -> String {
        let body = Envelope {
            error: self.kind(),
            msg: self.public_message(),
        };
        // A struct of two strings cannot fail to serialize.
        serde_json::to_string(&body).expect("serialize error envelope")
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: &'a str,
    msg: String,
}
