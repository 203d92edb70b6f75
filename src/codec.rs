// ABOUTME: Length-prefixed frame codec: parses Acknowledgement and LargeMessageWrapper
// ABOUTME: envelopes and reassembles oversized messages from their wrapper

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::os::fd::OwnedFd;

use bytes::Bytes;

use crate::error::CodecError;
use crate::message::{EndpointMagic, RawMessage, ACK_ID, LARGE_WRAPPER_ID};

/// Result of classifying and decoding one frame body.
enum Classified {
    Ack { ack_count: u32 },
    /// An application message that arrived wrapped in a `LargeMessageWrapper`.
    Wrapped(RawMessage),
    Application(RawMessage),
}

/// Everything one `try_parse_messages` pass produced.
pub struct ParseOutcome {
    pub messages: Vec<RawMessage>,
    /// Incremented once per non-ack, non-wrapper message and once per
    /// message carried inside a wrapper — never for the wrapper envelope
    /// itself.
    pub pending_ack_count: u32,
    pub received_ack_count: u32,
    /// Bytes of `input` consumed by complete frames; the remainder is the
    /// drain's residue.
    pub consumed: usize,
}

/// Parse as many complete frames as `input` holds, classifying each as an
/// `Acknowledgement`, a `LargeMessageWrapper` (recursed into its wrapped
/// message), or an ordinary application message.
///
/// Stops at the first incomplete frame (fewer than 4 header bytes, a
/// zero-length frame, or a short body) or the first decode failure; a decode
/// failure is logged with a hex dump and treated the same as "no complete
/// frame yet" for the purposes of this drain.
#[tracing::instrument(skip(input, fds), fields(input_len = input.len()))]
pub fn try_parse_messages(input: &[u8], fds: &mut VecDeque<OwnedFd>, local_magic: EndpointMagic) -> ParseOutcome {
    let mut index = 0usize;
    let mut pending_ack_count = 0u32;
    let mut received_ack_count = 0u32;
    let mut messages = Vec::new();

    while input.len() - index >= 4 {
        let length = u32::from_le_bytes([
            input[index],
            input[index + 1],
            input[index + 2],
            input[index + 3],
        ]) as usize;

        if length == 0 {
            break;
        }
        let body_start = index + 4;
        if input.len() - body_start < length {
            break;
        }
        let body = &input[body_start..body_start + length];

        match classify(body, fds, local_magic, false) {
            Ok(Classified::Ack { ack_count }) => {
                received_ack_count += ack_count;
            }
            Ok(Classified::Wrapped(message)) => {
                messages.push(message);
                pending_ack_count += 1;
            }
            Ok(Classified::Application(message)) => {
                messages.push(message);
                pending_ack_count += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, hex = %hex_dump(body), "frame decode failed, stopping drain");
                break;
            }
        }
        index = body_start + length;
    }

    ParseOutcome { messages, pending_ack_count, received_ack_count, consumed: index }
}

/// Decode one frame body and classify it. `nested` is true while decoding a
/// message carried inside a `LargeMessageWrapper`, where neither another
/// wrapper nor an `Acknowledgement` is legal.
fn classify(
    body: &[u8],
    fds: &mut VecDeque<OwnedFd>,
    local_magic: EndpointMagic,
    nested: bool,
) -> Result<Classified, CodecError> {
    let raw = RawMessage::decode_body(body, fds)?;

    if raw.message_id == ACK_ID {
        if nested {
            return Err(CodecError::NestedControlMessage);
        }
        if raw.endpoint_magic != local_magic {
            return Err(CodecError::DecodeFailed(format!(
                "ack addressed to {:?}, expected local magic {:?}",
                raw.endpoint_magic, local_magic
            )));
        }
        let ack_count = decode_ack_payload(&raw.payload)?;
        return Ok(Classified::Ack { ack_count });
    }

    if raw.message_id == LARGE_WRAPPER_ID {
        if nested {
            return Err(CodecError::NestedControlMessage);
        }
        // Replay the wrapper's fds to the front of the queue, in their
        // original order, so the wrapped message's own decode pops exactly
        // the descriptors it declares.
        for fd in raw.fds.into_iter().rev() {
            fds.push_front(fd);
        }
        return match classify(&raw.payload, fds, local_magic, true)? {
            Classified::Application(inner) => Ok(Classified::Wrapped(inner)),
            Classified::Ack { .. } | Classified::Wrapped(_) => Err(CodecError::NestedControlMessage),
        };
    }

    Ok(Classified::Application(raw))
}

fn decode_ack_payload(payload: &[u8]) -> Result<u32, CodecError> {
    if payload.len() < 4 {
        return Err(CodecError::DecodeFailed(format!("ack payload too short: {} bytes", payload.len())));
    }
    Ok(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

/// Build the `Acknowledgement` control message addressed to `target_magic`
/// (the peer's local magic).
pub fn encode_ack(ack_count: u32, target_magic: EndpointMagic) -> RawMessage {
    RawMessage {
        endpoint_magic: target_magic,
        message_id: ACK_ID,
        payload: Bytes::copy_from_slice(&ack_count.to_le_bytes()),
        fds: Vec::new(),
    }
}

/// Encode `message` for the wire, wrapping it in a `LargeMessageWrapper` if
/// its encoded size exceeds `threshold`. The wrapper carries the same fds as
/// the original message.
pub fn prepare_send_buffer(message: RawMessage, threshold: usize) -> crate::message::MessageBuffer {
    let body = message.encode_body();
    if body.len() <= threshold {
        return crate::message::MessageBuffer { data: body, fds: message.fds };
    }

    let wrapper = RawMessage {
        endpoint_magic: message.endpoint_magic,
        message_id: LARGE_WRAPPER_ID,
        payload: body,
        fds: message.fds,
    };
    wrapper.into_buffer()
}

/// Render `bytes` as a `hexdump`-ish string for decode-failure logging.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageId;

    fn frame_bytes(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn parses_a_single_ordinary_message() {
        let message = RawMessage {
            endpoint_magic: EndpointMagic(1),
            message_id: MessageId(42),
            payload: Bytes::from_static(b"hello"),
            fds: Vec::new(),
        };
        let body = message.encode_body();
        let wire = frame_bytes(&body);
        let mut fds = VecDeque::new();

        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(1));
        assert_eq!(outcome.consumed, wire.len());
        assert_eq!(outcome.pending_ack_count, 1);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn stops_on_incomplete_trailing_frame() {
        let message = RawMessage {
            endpoint_magic: EndpointMagic(1),
            message_id: MessageId(1),
            payload: Bytes::from_static(b"x"),
            fds: Vec::new(),
        };
        let mut wire = frame_bytes(&message.encode_body());
        wire.extend_from_slice(&50u32.to_le_bytes());
        wire.extend_from_slice(b"short");

        let mut fds = VecDeque::new();
        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(1));
        assert_eq!(outcome.messages.len(), 1);
        assert!(outcome.consumed < wire.len());
    }

    #[test]
    fn zero_length_frame_halts_parsing() {
        let wire = 0u32.to_le_bytes().to_vec();
        let mut fds = VecDeque::new();
        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(1));
        assert_eq!(outcome.consumed, 0);
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn ack_is_classified_and_not_returned_as_a_message() {
        let ack = encode_ack(3, EndpointMagic(7));
        let wire = frame_bytes(&ack.encode_body());
        let mut fds = VecDeque::new();

        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(7));
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.received_ack_count, 3);
        assert_eq!(outcome.pending_ack_count, 0);
    }

    #[test]
    fn ack_addressed_to_wrong_magic_is_a_decode_failure() {
        let ack = encode_ack(1, EndpointMagic(7));
        let wire = frame_bytes(&ack.encode_body());
        let mut fds = VecDeque::new();

        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(99));
        assert_eq!(outcome.consumed, 0);
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.received_ack_count, 0);
    }

    #[test]
    fn oversize_message_round_trips_through_large_wrapper() {
        let big_payload = vec![0xABu8; 100];
        let message = RawMessage {
            endpoint_magic: EndpointMagic(5),
            message_id: MessageId(9),
            payload: Bytes::from(big_payload.clone()),
            fds: Vec::new(),
        };
        let buffer = prepare_send_buffer(message, 16);
        let wire = frame_bytes(&buffer.data);

        let mut fds = VecDeque::new();
        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(5));
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].payload.as_ref(), big_payload.as_slice());
        assert_eq!(outcome.messages[0].message_id, MessageId(9));
    }

    #[test]
    fn small_message_is_not_wrapped() {
        let message = RawMessage {
            endpoint_magic: EndpointMagic(5),
            message_id: MessageId(9),
            payload: Bytes::from_static(b"tiny"),
            fds: Vec::new(),
        };
        let buffer = prepare_send_buffer(message, 16);
        // encode_body prefix is endpoint_magic+message_id+fd_count (12 bytes) + payload
        assert_eq!(buffer.data.len(), 12 + 4);
    }

    #[test]
    fn nested_wrapper_is_rejected() {
        let inner = RawMessage {
            endpoint_magic: EndpointMagic(1),
            message_id: LARGE_WRAPPER_ID,
            payload: Bytes::from_static(b"whatever"),
            fds: Vec::new(),
        };
        let outer = RawMessage {
            endpoint_magic: EndpointMagic(1),
            message_id: LARGE_WRAPPER_ID,
            payload: inner.encode_body(),
            fds: Vec::new(),
        };
        let wire = frame_bytes(&outer.encode_body());
        let mut fds = VecDeque::new();
        let outcome = try_parse_messages(&wire, &mut fds, EndpointMagic(1));
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.consumed, 0);
    }
}
