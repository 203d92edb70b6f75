// ABOUTME: Connection facade tying the transport, queues, codec, dispatcher, and watchdog
// ABOUTME: together into the one object an application holds for a bidirectional IPC link

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;

use crate::codec::{self, try_parse_messages};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::event_loop::{ConnectionHooks, EventLoopHandle};
use crate::message::{EndpointMagic, MessageId, RawMessage, Stub};
use crate::queue::{AckTracker, SendItem, SendQueue};
use crate::transport::Transport;
use crate::watchdog::ResponsivenessTimer;

/// Everything the receiver path owns between drains: the residual partial
/// frame (if any), descriptors not yet claimed by a message, and messages
/// already parsed but not yet dispatched.
struct ReceiverState {
    unprocessed_bytes: Option<BytesMut>,
    unprocessed_fds: VecDeque<OwnedFd>,
    unprocessed_messages: VecDeque<RawMessage>,
}

impl ReceiverState {
    fn new() -> Self {
        Self { unprocessed_bytes: None, unprocessed_fds: VecDeque::new(), unprocessed_messages: VecDeque::new() }
    }
}

/// One bidirectional, message-oriented IPC link to a single peer process.
///
/// Owns a sender thread (the only writer to `transport`) and a readable hook
/// installed on the host event loop (the only reader); application threads
/// only ever touch the send queue and the receiver's mutex, never the socket
/// directly. See the crate's module docs for the split-ownership rationale.
pub struct Connection<E: EventLoopHandle, T: Transport + 'static> {
    transport: Arc<T>,
    local_magic: EndpointMagic,
    peer_magic: EndpointMagic,
    config: ConnectionConfig,
    send_queue: Arc<SendQueue>,
    ack_tracker: Arc<AckTracker>,
    event_loop: E,
    hooks: Arc<dyn ConnectionHooks>,
    stub: Arc<dyn Stub>,
    watchdog: ResponsivenessTimer<E>,
    receiver: Mutex<ReceiverState>,
    sender_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    shutting_down: AtomicBool,
    self_weak: Weak<Connection<E, T>>,
}

impl<E: EventLoopHandle, T: Transport + 'static> Connection<E, T> {
    /// Build a connection over an already-connected `transport` and start it:
    /// spawn the sender thread and install the readable hook on `event_loop`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<T>,
        local_magic: EndpointMagic,
        peer_magic: EndpointMagic,
        config: ConnectionConfig,
        event_loop: E,
        hooks: Arc<dyn ConnectionHooks>,
        stub: Arc<dyn Stub>,
    ) -> Arc<Self> {
        let send_queue = Arc::new(SendQueue::new());
        let ack_tracker = Arc::new(AckTracker::new());
        let watchdog = ResponsivenessTimer::new(event_loop.clone(), config.responsiveness_period, hooks.clone());

        let connection = Arc::new_cyclic(|weak| Self {
            transport: transport.clone(),
            local_magic,
            peer_magic,
            config,
            send_queue: send_queue.clone(),
            ack_tracker: ack_tracker.clone(),
            event_loop: event_loop.clone(),
            hooks,
            stub,
            watchdog,
            receiver: Mutex::new(ReceiverState::new()),
            sender_thread: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            self_weak: weak.clone(),
        });

        let handle = std::thread::Builder::new()
            .name("ipc-core-sender".into())
            .spawn(move || sender_loop(transport, send_queue, ack_tracker))
            .expect("failed to spawn sender thread");
        *connection.sender_thread.lock().unwrap() = Some(handle);

        let readable = connection.clone();
        let raw_fd = connection.transport.raw_fd();
        connection.event_loop.on_readable(
            raw_fd,
            Arc::new(move || {
                let _ = readable.on_transport_readable();
            }),
        );

        connection
    }

    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("connection used after being dropped")
    }

    /// Whether the underlying transport is still open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Number of posted frames still awaiting the peer's acknowledgement.
    pub fn pending_ack_count(&self) -> usize {
        self.ack_tracker.len()
    }

    /// Post `message`, tracking it for acknowledgement and (re-)arming the
    /// liveness watchdog. Fails if the connection has already shut down.
    pub fn post_message(&self, message: RawMessage) -> Result<(), ConnectionError> {
        self.enqueue(message, true)
    }

    /// Post `message` without tracking it for acknowledgement. Used for
    /// control traffic the core itself generates, such as the synthesized
    /// `Acknowledgement`, where arming the watchdog on our own outbound
    /// reply to inbound traffic would be backwards.
    fn enqueue(&self, message: RawMessage, needs_ack: bool) -> Result<(), ConnectionError> {
        if self.shutting_down.load(Ordering::Acquire) || !self.transport.is_open() {
            return Err(ConnectionError::ShutdownInProgress);
        }
        let buffer = codec::prepare_send_buffer(message, self.config.socket_buffer_size);
        self.send_queue.push(SendItem { buffer, needs_ack });
        if needs_ack {
            self.watchdog.start();
        }
        Ok(())
    }

    /// Block the calling thread, draining the transport as needed, until a
    /// message addressed to `endpoint_magic` with id `message_id` arrives, or
    /// the peer disconnects (in which case `None` is returned).
    ///
    /// Must be called from the event-loop thread: it drives the same receive
    /// path the readable hook uses, just synchronously instead of via the
    /// installed callback.
    pub fn wait_for_specific_endpoint_message(
        &self,
        endpoint_magic: EndpointMagic,
        message_id: MessageId,
    ) -> Option<RawMessage> {
        loop {
            {
                let mut receiver = self.receiver.lock().unwrap();
                if let Some(pos) = receiver
                    .unprocessed_messages
                    .iter()
                    .position(|m| m.endpoint_magic == endpoint_magic && m.message_id == message_id)
                {
                    return receiver.unprocessed_messages.remove(pos);
                }
            }
            if !self.transport.is_open() {
                return None;
            }
            if self.transport.wait_until_readable().is_err() {
                return None;
            }
            if self.on_transport_readable().is_err() {
                return None;
            }
        }
    }

    /// Drain whatever the transport currently has ready: extend the
    /// descriptor queue, prepend any residual bytes from the previous drain,
    /// parse as many complete frames as possible, pop acknowledged sends,
    /// synthesize an outbound ack if anything is now awaiting one, and defer
    /// dispatch of newly parsed messages. If the peer has reached EOF, the
    /// drain still runs first against whatever bytes arrived alongside the
    /// EOF notification — a single non-blocking read can return a peer's
    /// final frame(s) and `eof: true` together — and `shutdown` is only
    /// scheduled, and `PeerEof` only returned, once that drain completes.
    fn on_transport_readable(&self) -> Result<(), ConnectionError> {
        let read = match self.transport.read_nonblocking() {
            Ok(read) => read,
            Err(_) => {
                self.schedule_shutdown();
                return Err(ConnectionError::PeerEof);
            }
        };

        let mut receiver = self.receiver.lock().unwrap();
        receiver.unprocessed_fds.extend(read.fds);

        if !read.bytes.is_empty() {
            self.watchdog.stop();
            self.hooks.did_become_responsive();
        }

        let previous_residue = receiver.unprocessed_bytes.take();
        let mut working = match previous_residue {
            Some(mut residue) => {
                residue.extend_from_slice(&read.bytes);
                residue
            }
            None => BytesMut::from(&read.bytes[..]),
        };

        let outcome = try_parse_messages(&working, &mut receiver.unprocessed_fds, self.local_magic);
        let tail = working.split_off(outcome.consumed);

        if !tail.is_empty() {
            if receiver.unprocessed_bytes.is_some() {
                drop(receiver);
                self.shutdown_with_error(ConnectionError::ResidualConflict);
                return Err(ConnectionError::ResidualConflict);
            }
            receiver.unprocessed_bytes = Some(tail);
        }

        receiver.unprocessed_messages.extend(outcome.messages);

        if outcome.received_ack_count > 0 {
            self.ack_tracker.pop_n(outcome.received_ack_count);
        }

        let has_messages = !receiver.unprocessed_messages.is_empty();
        drop(receiver);

        if outcome.pending_ack_count > 0 && self.transport.is_open() {
            let ack = codec::encode_ack(outcome.pending_ack_count, self.peer_magic);
            if let Err(err) = self.enqueue(ack, false) {
                tracing::debug!(error = %err, "dropped outbound ack, connection already shutting down");
            }
        }

        if has_messages {
            let connection = self.arc_self();
            self.event_loop.defer(Box::new(move || connection.handle_messages()));
        }

        if read.eof {
            self.schedule_shutdown();
            return Err(ConnectionError::PeerEof);
        }

        Ok(())
    }

    /// Dispatch every message parsed so far to the stub, from the event-loop
    /// thread, outside of `try_parse_messages`'s own call stack: if a handler
    /// itself called `wait_for_specific_endpoint_message` and re-entered the
    /// receive path, deferring here keeps that reentrant drain's parse loop
    /// from running underneath this one.
    fn handle_messages(self: Arc<Self>) {
        let messages: Vec<RawMessage> = {
            let mut receiver = self.receiver.lock().unwrap();
            std::mem::take(&mut receiver.unprocessed_messages).into()
        };

        for message in messages {
            if message.endpoint_magic != self.local_magic {
                tracing::debug!(
                    endpoint_magic = ?message.endpoint_magic,
                    message_id = ?message.message_id,
                    "dropping message addressed to a different endpoint magic"
                );
                continue;
            }

            let message_id = message.message_id;
            match self.stub.handle(message) {
                Ok(Some(reply)) => {
                    if let Err(err) = self.post_message(reply) {
                        tracing::warn!(error = %err, message_id = ?message_id, "failed to post reply");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, message_id = ?message_id, "stub handler failed");
                }
            }
        }
    }

    fn schedule_shutdown(&self) {
        let connection = self.arc_self();
        self.event_loop.defer(Box::new(move || connection.shutdown()));
    }

    /// Log `err` and tear the connection down.
    pub fn shutdown_with_error(&self, err: ConnectionError) {
        tracing::warn!(error = %err, "connection shutting down due to error");
        self.shutdown();
    }

    /// Tear the connection down: close the transport, disarm the watchdog,
    /// stop the send queue, detach the sender thread, and notify
    /// `ConnectionHooks::die`. Idempotent — safe to call more than once, or
    /// concurrently from more than one thread.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        self.watchdog.stop();
        self.send_queue.stop();
        if let Some(handle) = self.sender_thread.lock().unwrap().take() {
            // Detach rather than join: joining here could deadlock if this
            // is called from the sender thread's own callback path, and the
            // sender loop exits on its own once `send_queue.stop()` wakes it.
            drop(handle);
        }
        self.hooks.die();
    }
}

/// Body of the dedicated sender thread: the sole writer to `transport`.
/// Appends `needs_ack` frames to the tracker before transmitting, so a reply
/// arriving before `write_frame` returns can never find the tracker empty.
fn sender_loop<T: Transport>(transport: Arc<T>, send_queue: Arc<SendQueue>, ack_tracker: Arc<AckTracker>) {
    while let Some(item) = send_queue.pop_blocking() {
        if item.needs_ack {
            ack_tracker.append(item.buffer.data.clone());
        }
        if let Err(err) = transport.write_frame(&item.buffer) {
            tracing::warn!(error = %err, "failed to transfer frame to peer");
        }
    }
}
