// ABOUTME: Error types for the connection core, covering transport, codec, and connection failures
// ABOUTME: Uses thiserror so callers can match on failure kind instead of parsing strings

use std::io;
use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A frame body was too short to contain even the fixed
    /// `endpoint_magic`/`message_id` prefix.
    #[error("frame body too short: {0} bytes")]
    ShortBody(usize),

    /// A `LargeMessageWrapper` wrapped another `LargeMessageWrapper` or an
    /// `Acknowledgement`; neither control message may nest inside a wrapper.
    #[error("wrapped message must not itself be a control message")]
    NestedControlMessage,

    /// The wrapped or application payload failed application-level decode.
    #[error("message decode failed: {0}")]
    DecodeFailed(String),
}

/// Errors surfaced by a [`crate::transport::Transport`] implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The peer closed its end of the connection.
    #[error("peer closed the connection")]
    Eof,
}

/// Errors surfaced by the connection facade.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// `post_message` was called after `shutdown`.
    #[error("post_message called after shutdown")]
    ShutdownInProgress,

    /// The sender thread failed to write a frame. Logged and non-fatal; the
    /// connection recovers via the receiver's EOF path or keeps retrying.
    #[error("failed to transfer frame to peer: {0}")]
    TransferFailed(#[from] TransportError),

    /// A frame failed to decode during a receiver drain; framing invariants
    /// say the parse loop stops, not that the connection tears down.
    #[error("failed to decode frame: {0}")]
    DecodeFailed(#[from] CodecError),

    /// Residual bytes existed across two consecutive drains, violating the
    /// "at most one residual buffer" invariant. Fatal.
    #[error("unprocessed byte residue survived two drains")]
    ResidualConflict,

    /// The peer closed the transport.
    #[error("peer reached end of file")]
    PeerEof,

    /// The stub's `handle` returned an error for one message. Logged and
    /// non-fatal; the connection continues with the next message.
    #[error("stub handler failed: {0}")]
    HandlerError(#[source] Box<dyn std::error::Error + Send + Sync>),
}
