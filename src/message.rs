// ABOUTME: Wire-level message types shared by the codec, queues, and connection facade.
// ABOUTME: Typed application payloads are decoded by the Stub the caller supplies; this layer
// ABOUTME: only sees endpoint_magic/message_id/payload/fds and leaves codegen to the caller

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::OwnedFd;

use bytes::Bytes;

/// Identifies one side of a typed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointMagic(pub u32);

/// Identifies a message within an endpoint's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u32);

/// Reserved message ID for the `Acknowledgement` control message.
pub const ACK_ID: MessageId = MessageId(0);

/// Reserved message ID for the `LargeMessageWrapper` control message.
pub const LARGE_WRAPPER_ID: MessageId = MessageId(1);

/// A fully parsed, not-yet-typed message taken off the wire: the fixed
/// `endpoint_magic`/`message_id` prefix plus an opaque payload. Turning
/// `payload` into an application type is the external stub's job.
pub struct RawMessage {
    pub endpoint_magic: EndpointMagic,
    pub message_id: MessageId,
    pub payload: Bytes,
    pub fds: Vec<OwnedFd>,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("endpoint_magic", &self.endpoint_magic)
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

impl RawMessage {
    /// Encode this message's wire body: `endpoint_magic`, `message_id`, then
    /// `fd_count` (all little-endian `u32`), followed by `payload`.
    /// `fd_count` is embedded here because typed message codegen lives
    /// outside this crate: with no generated schema to consult, the only way
    /// this layer can know how many descriptors belong to an arbitrary
    /// application message is to self-describe the count in the one header
    /// it owns. The payload past `message_id` stays otherwise opaque to this
    /// layer; this just fixes what its first four bytes mean.
    pub fn encode_body(&self) -> Bytes {
        let mut buf = Vec::with_capacity(12 + self.payload.len());
        buf.extend_from_slice(&self.endpoint_magic.0.to_le_bytes());
        buf.extend_from_slice(&self.message_id.0.to_le_bytes());
        buf.extend_from_slice(&(self.fds.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Take ownership of this message's body as a [`MessageBuffer`], ready
    /// to be queued on a [`crate::queue::SendQueue`].
    pub fn into_buffer(self) -> MessageBuffer {
        let data = self.encode_body();
        MessageBuffer { data, fds: self.fds }
    }

    /// Decode a wire body into its fixed prefix and remaining payload,
    /// draining exactly `fd_count` descriptors from the front of `fds` in
    /// FIFO order.
    pub fn decode_body(body: &[u8], fds: &mut VecDeque<OwnedFd>) -> Result<Self, crate::error::CodecError> {
        if body.len() < 12 {
            return Err(crate::error::CodecError::ShortBody(body.len()));
        }
        let endpoint_magic = EndpointMagic(u32::from_le_bytes([body[0], body[1], body[2], body[3]]));
        let message_id = MessageId(u32::from_le_bytes([body[4], body[5], body[6], body[7]]));
        let fd_count = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
        let payload = Bytes::copy_from_slice(&body[12..]);

        let mut taken = Vec::with_capacity(fd_count);
        for _ in 0..fd_count {
            match fds.pop_front() {
                Some(fd) => taken.push(fd),
                None => {
                    return Err(crate::error::CodecError::DecodeFailed(format!(
                        "message declared {fd_count} fds but only {} were available",
                        taken.len()
                    )));
                }
            }
        }

        Ok(RawMessage { endpoint_magic, message_id, payload, fds: taken })
    }
}

/// The result of encoding a [`RawMessage`]: raw bytes plus the descriptors
/// that ride alongside them out-of-band.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    pub data: Bytes,
    pub fds: Vec<OwnedFd>,
}

/// Application-supplied decoder/dispatcher for the local endpoint.
///
/// `handle` is called once per dispatched message from the event-loop
/// thread. Returning `Ok(Some(reply))` posts `reply` back on the local
/// endpoint magic with `needs_ack = true`; returning `Err` is logged and does
/// not terminate the connection.
pub trait Stub: Send + Sync {
    /// Handle one message addressed to this stub's endpoint magic.
    fn handle(
        &self,
        message: RawMessage,
    ) -> Result<Option<RawMessage>, Box<dyn std::error::Error + Send + Sync>>;
}
