// ABOUTME: Transport adapter trait abstracting the byte-stream socket plus its out-of-band
// ABOUTME: descriptor side channel; `unix` supplies the default Unix-socket backend

use std::os::fd::{OwnedFd, RawFd};

use bytes::Bytes;

use crate::error::TransportError;
use crate::message::MessageBuffer;

pub mod unix;

/// Socket-buffer threshold `T` above which a message is fragmented into a
/// `LargeMessageWrapper`. 32 KiB.
pub const SOCKET_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes and descriptors drained from the transport in one non-blocking read.
pub struct ReadResult {
    pub bytes: Bytes,
    pub fds: Vec<OwnedFd>,
    pub eof: bool,
}

/// Wraps a byte-stream socket with a side channel for descriptors. The
/// connection core depends only on this trait; `unix::UnixTransport` is the
/// default, runnable implementation.
///
/// Implementations must uphold a strict split-ownership discipline: reads
/// happen only from the event-loop thread, writes only from the sender
/// thread. `close` may race with an in-flight `write_frame`; that race must
/// resolve to a logged, non-fatal error on the writer's side.
pub trait Transport: Send + Sync {
    /// The descriptor the event loop should poll for readability, so the
    /// connection facade can wire up a readable callback via
    /// `EventLoopHandle::on_readable` without the transport depending on any
    /// particular event-loop implementation.
    fn raw_fd(&self) -> RawFd;

    /// Whether the transport is still open.
    fn is_open(&self) -> bool;

    /// Close the transport. Idempotent.
    fn close(&self);

    /// Block the calling thread until bytes (or EOF) may be available.
    fn wait_until_readable(&self) -> Result<(), TransportError>;

    /// Read as much as is immediately available without blocking. Returns
    /// whatever bytes and descriptors arrived; `eof` is set once the peer has
    /// closed its end and no more data will arrive.
    fn read_nonblocking(&self) -> Result<ReadResult, TransportError>;

    /// Write one length-prefixed frame, looping internally until the whole
    /// frame is delivered or a write fails. The underlying socket may
    /// short-write at any point, particularly for large payloads.
    fn write_frame(&self, buffer: &MessageBuffer) -> Result<(), TransportError>;
}
