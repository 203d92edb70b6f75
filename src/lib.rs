// ABOUTME: Connection core for a bidirectional, message-oriented IPC subsystem: length-prefixed
// ABOUTME: framing, fd-passing, flow control, and liveness over a pluggable transport/event loop

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod message;
pub mod queue;
pub mod transport;
pub mod watchdog;

pub use codec::{ParseOutcome, encode_ack, prepare_send_buffer, try_parse_messages};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{CodecError, ConnectionError, TransportError};
pub use event_loop::{ConnectionHooks, EventLoopHandle, LocalEventLoop, TimerHandle};
pub use message::{ACK_ID, EndpointMagic, LARGE_WRAPPER_ID, MessageBuffer, MessageId, RawMessage, Stub};
pub use queue::{AckTracker, SendItem, SendQueue};
pub use transport::Transport;
pub use transport::unix::{UnixTransport, transport_pair};

/// Error type returned by fallible operations whose failure mode isn't worth
/// its own enum variant.
///
/// # Examples
///
/// A minimal echoing peer: two [`UnixTransport`]s connected in-process, each
/// driven by its own [`LocalEventLoop`], exchanging one message.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use ipc_core::{
///     Connection, ConnectionConfig, ConnectionHooks, EndpointMagic, LocalEventLoop, MessageId,
///     RawMessage, Stub, transport_pair,
/// };
///
/// struct EchoStub;
///
/// impl Stub for EchoStub {
///     fn handle(
///         &self,
///         message: RawMessage,
///     ) -> std::result::Result<Option<RawMessage>, Box<dyn std::error::Error + Send + Sync>> {
///         Ok(Some(message))
///     }
/// }
///
/// struct NoopHooks;
///
/// impl ConnectionHooks for NoopHooks {
///     fn die(&self) {}
/// }
///
/// fn main() -> std::io::Result<()> {
///     let (client_transport, server_transport) = transport_pair()?;
///     let client_loop = LocalEventLoop::new();
///     let server_loop = LocalEventLoop::new();
///
///     let client = Connection::new(
///         client_transport,
///         EndpointMagic(1),
///         EndpointMagic(2),
///         ConnectionConfig::default(),
///         client_loop.clone(),
///         Arc::new(NoopHooks),
///         Arc::new(EchoStub),
///     );
///     let _server = Connection::new(
///         server_transport,
///         EndpointMagic(2),
///         EndpointMagic(1),
///         ConnectionConfig::default(),
///         server_loop.clone(),
///         Arc::new(NoopHooks),
///         Arc::new(EchoStub),
///     );
///
///     client.post_message(RawMessage {
///         endpoint_magic: EndpointMagic(2),
///         message_id: MessageId(1),
///         payload: bytes::Bytes::from_static(b"hello"),
///         fds: Vec::new(),
///     })?;
///
///     Ok(())
/// }
/// ```
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for connection-core operations.
pub type Result<T> = std::result::Result<T, Error>;
