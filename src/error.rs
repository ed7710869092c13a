//! Error handling module
//!
//! Defines custom error types for the world icon server.

use std::io;

use thiserror::Error;

use crate::marker::{IconTypeId, MarkerId};
use crate::net::directory::ClientId;

/// Main error type for the world icon server
#[derive(Error, Debug)]
pub enum WorldIconError {
    /// Marker registry errors
    #[error("Marker error: {0}")]
    Marker(#[from] MarkerError),

    /// Client session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Marker registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarkerError {
    /// The icon type is not registered in the type catalog
    #[error("Unknown icon type: {0}")]
    UnknownType(IconTypeId),

    /// The marker's position source could not be resolved at creation
    #[error("Marker of type {0} has no live position source")]
    DeadOnArrival(IconTypeId),

    /// A caller-supplied scope predicate failed
    #[error("Scope predicate failed for marker {marker}: {source}")]
    Predicate {
        marker: MarkerId,
        #[source]
        source: PredicateError,
    },

    #[error("Marker not found: {0}")]
    NotFound(MarkerId),
}

/// Client directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Client {0} is already connected")]
    AlreadyConnected(ClientId),

    #[error("Client directory is full ({0} clients)")]
    DirectoryFull(usize),

    #[error("Client {0} is not connected")]
    NotConnected(ClientId),
}

/// Error raised by a caller-supplied scope predicate.
///
/// This always indicates a bug in gameplay code and is surfaced to the caller
/// of the registry operation that evaluated the predicate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PredicateError {
    pub message: String,
}

impl PredicateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result type alias for world icon operations
pub type Result<T> = std::result::Result<T, WorldIconError>;
