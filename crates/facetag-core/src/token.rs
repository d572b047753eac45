//! Reply-context tokens: correlate an asynchronous chat reply with the
//! artifact the earlier outbound message was about.
//!
//! The token travels as part of the outbound message payload and is echoed
//! back by the chat transport on the user's reply. No server-side session
//! state is kept.

use crate::types::FaceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const FACE_PREFIX: &str = "face";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("reply context is missing")]
    Missing,
    #[error("unknown reply context kind: {0}")]
    UnknownKind(String),
    #[error("malformed reply context: {0}")]
    Malformed(String),
}

/// What an outbound message was about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyContext {
    /// A face offered for naming.
    Face { face_id: FaceId },
}

impl ReplyContext {
    pub fn face(face_id: FaceId) -> Self {
        Self::Face { face_id }
    }

    /// Compact wire form, e.g. `face:3f2a…`.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse an optional echoed token; absence is an error of its own.
    pub fn from_echo(echo: Option<&str>) -> Result<Self, TokenError> {
        match echo {
            Some(raw) => raw.parse(),
            None => Err(TokenError::Missing),
        }
    }
}

impl fmt::Display for ReplyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Face { face_id } => write!(f, "{FACE_PREFIX}:{face_id}"),
        }
    }
}

impl FromStr for ReplyContext {
    type Err = TokenError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Missing);
        }
        let (kind, value) = raw
            .split_once(':')
            .ok_or_else(|| TokenError::Malformed(raw.to_string()))?;
        match kind {
            FACE_PREFIX => FaceId::parse(value)
                .map(Self::face)
                .ok_or_else(|| TokenError::Malformed(raw.to_string())),
            other => Err(TokenError::UnknownKind(other.to_string())),
        }
    }
}
