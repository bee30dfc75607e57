//! Error types for Arbor

use crate::types::{Key, LocationId, Role};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown key {key} on location {location}")]
    UnknownKey { key: Key, location: LocationId },

    #[error("node {key} missing on location {location}")]
    MissingNode { key: Key, location: LocationId },

    #[error("slot for key {key} holds a {role} node, expected a placeholder")]
    InvalidPlaceholder { key: Key, role: Role },

    #[error("{context}: node {key} has unexpected role {role}")]
    UnexpectedRole {
        key: Key,
        role: Role,
        context: &'static str,
    },

    #[error("key {key} is not below {ancestor}")]
    NotDescendant { ancestor: Key, key: Key },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn unknown_key(key: Key, location: LocationId) -> Self {
        Self::UnknownKey { key, location }
    }

    pub fn missing_node(key: Key, location: LocationId) -> Self {
        Self::MissingNode { key, location }
    }

    pub fn invalid_placeholder(key: Key, role: Role) -> Self {
        Self::InvalidPlaceholder { key, role }
    }

    pub fn unexpected_role(key: Key, role: Role, context: &'static str) -> Self {
        Self::UnexpectedRole { key, role, context }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Protocol violations imply build or cache corruption and are never retried.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownKey { .. }
                | Self::MissingNode { .. }
                | Self::InvalidPlaceholder { .. }
                | Self::UnexpectedRole { .. }
                | Self::NotDescendant { .. }
        )
    }
}
