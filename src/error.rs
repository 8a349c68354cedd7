//! Error types shared across the crate.

use std::io;
use thiserror::Error;

/// Error covering everything that can go wrong inside the endpoint.
///
/// Parse and routing failures are handled locally by the connection (the
/// offending frame is answered or dropped); they only surface here when the
/// caller invokes a parsing entry point directly. Transport errors feed the
/// reconnect state machine before they reach the application through the
/// disconnect event.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, header or URI.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A frame other than a SEND body exceeded the parse buffer capacity.
    #[error("message exceeds buffer capacity")]
    BufferExhausted,

    /// Socket level I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The To-Path target or Message-ID is not known to this connection.
    #[error("no route for frame: {0}")]
    Routing(String),

    /// The peer violated the MSRP protocol (e.g. SEND without Message-ID).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An operation was attempted in a state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// A specialized `Result` for MSRP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable syntax errors.
///
/// These are hit during normal operation whenever a peer sends something the
/// grammar rejects, so they carry enough context to log and move on rather
/// than tear the connection down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid MSRP URI: {0}")]
    Uri(String),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("header {name}: {reason}")]
    Header { name: &'static str, reason: String },

    #[error("missing header {0}")]
    MissingHeader(&'static str),
}
