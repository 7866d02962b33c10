//! Public error type.
//!
//! Every fallible public operation returns [`Error`]. Protocol faults that
//! terminate a [`crate::Connection`] (see `connection.rs`) are carried as
//! [`Error::ProtocolFault`] and are the only kind ever stored as a
//! Connection's `fault` reason.

/// Errors produced by wiremux's public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An inbound `rpcreq` named a function with no registered handler.
    #[error("unknown rpc function called")]
    UnknownFunction,

    /// A second `read()` was attempted on a channel while one was already in flight.
    #[error("concurrent reading not allowed")]
    ConcurrentReadingNotAllowed,

    /// A second `write()` was attempted on a channel while one was already in flight.
    #[error("concurrent writing not allowed")]
    ConcurrentWritingNotAllowed,

    /// The Connection (or one of its channels/calls) reached end-of-stream via graceful close.
    #[error("connection closed")]
    ConnectionClosedEof,

    /// A malformed frame, unknown envelope type, unknown correlation id, or
    /// ACK/packet-id mismatch. Always terminates the owning Connection.
    #[error("protocol fault: {0}")]
    ProtocolFault(String),

    /// A call or registration used a value outside the transportable type set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `close()` called on an endpoint that was already closed.
    #[error("already closed")]
    AlreadyClosed,

    /// `register()` called twice with the same handler name.
    #[error("function already registered: {0}")]
    AlreadyRegistered(String),

    /// Joining a listener name with no registered listener.
    #[error("{0}")]
    NotAccepted(String),

    /// Transport I/O failure below the framing layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps a wire-carried `rpcres.error` string back to a known kind where possible.
    ///
    /// Unrecognized strings fall back to [`Error::InvalidArgument`], carrying
    /// the original message through unchanged.
    #[must_use]
    pub fn from_wire_message(message: &str) -> Self {
        match message {
            "unknown rpc function called" => Self::UnknownFunction,
            "concurrent reading not allowed" => Self::ConcurrentReadingNotAllowed,
            "concurrent writing not allowed" => Self::ConcurrentWritingNotAllowed,
            other => Self::InvalidArgument(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
