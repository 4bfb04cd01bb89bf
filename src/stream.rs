//! The stream transport channel.
//!
//! One channel per remote endpoint, created on first send and torn down
//! again after its idle linger expires. Every message is preceded by a
//! 2-byte big-endian length; the prefix is prepended once when the write is
//! enqueued, and partial writes only advance a position within the buffer.
//! Reading runs a small state machine: fill the 2-byte prefix, decode the
//! length, fill an exact-size body buffer across as many read events as it
//! takes, deliver, reset.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::queries::Queries;
use crate::reactor::Events;
use crate::timeouts::TimeoutHandle;

//------------ StreamEvent ---------------------------------------------------

/// What a readiness poll of a stream channel produced.
pub(crate) enum StreamEvent {
    /// The nonblocking connect finished.
    Connected(io::Result<()>),

    /// The connected socket reported readiness.
    Io(Events),
}

//------------ Flow ----------------------------------------------------------

/// The outcome of running a channel handler.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Flow {
    /// At least one byte was read or written; resets the idle timer.
    pub activity: bool,

    /// The channel is broken or finished and must be removed.
    pub closed: bool,
}

//------------ PendingWrite --------------------------------------------------

/// One queued outbound message, length prefix already in place.
struct PendingWrite {
    /// The query this write belongs to.
    id: u16,

    /// Prefixed wire bytes.
    buf: Bytes,

    /// How much of `buf` has been written so far.
    pos: usize,
}

/// Builds the wire form of a message: 2-byte big-endian length, then body.
///
/// The caller has already verified that the length fits in 16 bits.
fn frame(msg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(msg.len() + 2);
    buf.put_u16(msg.len() as u16);
    buf.extend_from_slice(msg);
    buf.freeze()
}

//------------ ReadAssembly --------------------------------------------------

/// Reassembly state for length-prefixed messages.
struct ReadAssembly {
    /// The fixed-size length prefix.
    prefix: [u8; 2],

    /// How much of the prefix has been received.
    have: usize,

    /// The message body, once the prefix is complete.
    body: Option<Body>,
}

/// A partially received message body.
struct Body {
    /// Exact-size buffer allocated from the decoded length.
    buf: Vec<u8>,

    /// How much of `buf` has been received.
    have: usize,
}

impl ReadAssembly {
    /// Creates the state for a fresh connection.
    fn new() -> Self {
        ReadAssembly {
            prefix: [0; 2],
            have: 0,
            body: None,
        }
    }

    /// Returns the buffer space the next read should fill.
    ///
    /// Never empty: while the prefix is incomplete this is the rest of the
    /// prefix, afterwards the rest of the body.
    fn next_slice(&mut self) -> &mut [u8] {
        match &mut self.body {
            None => &mut self.prefix[self.have..],
            Some(body) => &mut body.buf[body.have..],
        }
    }

    /// Records that `count` bytes of the current slice were filled.
    ///
    /// Returns a completed message if this read finished one.
    fn advance(&mut self, count: usize) -> Option<Bytes> {
        match &mut self.body {
            None => {
                self.have += count;
                if self.have == 2 {
                    self.have = 0;
                    let len = usize::from(u16::from_be_bytes(self.prefix));
                    if len == 0 {
                        // A zero-length message completes right away.
                        return Some(Bytes::new());
                    }
                    self.body = Some(Body {
                        buf: vec![0; len],
                        have: 0,
                    });
                }
                None
            }
            Some(body) => {
                body.have += count;
                if body.have == body.buf.len() {
                    let body = self.body.take()?;
                    Some(Bytes::from(body.buf))
                } else {
                    None
                }
            }
        }
    }

    /// Returns whether a message is partially received.
    fn mid_message(&self) -> bool {
        self.have > 0 || self.body.is_some()
    }
}

//------------ StreamChannel -------------------------------------------------

/// Connection progress of a stream channel.
enum State {
    /// The nonblocking connect is still in flight.
    Connecting(Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>),

    /// The socket is connected.
    Connected(TcpStream),
}

/// A stream channel to one remote endpoint.
pub(crate) struct StreamChannel {
    /// The remote endpoint.
    peer: SocketAddr,

    /// Socket or pending connect.
    state: State,

    /// Outbound messages in submission order.
    queue: VecDeque<PendingWrite>,

    /// Inbound reassembly state.
    assembly: ReadAssembly,

    /// The current idle linger timer.
    idle: Option<TimeoutHandle>,

    /// Bumped on every activity; stale idle timers carry an old value.
    generation: u64,
}

impl StreamChannel {
    /// Creates a channel and starts its nonblocking connect.
    ///
    /// Must be called from within the reactor's runtime.
    pub fn new(peer: SocketAddr) -> Self {
        StreamChannel {
            peer,
            state: State::Connecting(Box::pin(TcpStream::connect(peer))),
            queue: VecDeque::new(),
            assembly: ReadAssembly::new(),
            idle: None,
            generation: 0,
        }
    }

    /// Enqueues one message, prepending its length prefix.
    pub fn send(&mut self, id: u16, msg: &[u8]) {
        self.queue.push_back(PendingWrite {
            id,
            buf: frame(msg),
            pos: 0,
        });
    }

    /// Returns the current timer generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancels the running idle timer and bumps the generation.
    ///
    /// The reactor schedules a fresh timer afterwards; a stale timer that
    /// fires anyway carries an outdated generation and is ignored.
    pub fn begin_activity(&mut self) -> u64 {
        if let Some(idle) = self.idle.take() {
            idle.cancel();
        }
        self.generation += 1;
        self.generation
    }

    /// Stores the handle of the freshly scheduled idle timer.
    pub fn set_idle_timer(&mut self, handle: TimeoutHandle) {
        self.idle = Some(handle);
    }

    /// Polls connect progress or socket readiness.
    pub fn poll_events(&mut self, cx: &mut Context<'_>) -> Poll<StreamEvent> {
        match &mut self.state {
            State::Connecting(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(sock)) => {
                    self.state = State::Connected(sock);
                    Poll::Ready(StreamEvent::Connected(Ok(())))
                }
                Poll::Ready(Err(err)) => {
                    Poll::Ready(StreamEvent::Connected(Err(err)))
                }
                Poll::Pending => Poll::Pending,
            },
            State::Connected(sock) => {
                let mut events = Events::default();
                if !self.queue.is_empty() {
                    if sock.poll_write_ready(cx).is_ready() {
                        // An error surfaces again in the write handler.
                        events.writable = true;
                    }
                }
                if sock.poll_read_ready(cx).is_ready() {
                    events.readable = true;
                }
                if events.any() {
                    Poll::Ready(StreamEvent::Io(events))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    /// Drains the write queue as far as the socket allows.
    ///
    /// Partial writes advance the buffer position; the prefix is never
    /// rebuilt.
    pub fn handle_write(&mut self, queries: &Queries) -> Flow {
        let mut flow = Flow::default();
        let mut broken = None;
        {
            let State::Connected(sock) = &self.state else {
                return flow;
            };
            loop {
                let Some(front) = self.queue.front_mut() else {
                    break;
                };
                match sock.try_write(&front.buf[front.pos..]) {
                    Ok(0) => {
                        broken = Some(Error::StreamWriteError(Arc::new(
                            io::ErrorKind::WriteZero.into(),
                        )));
                        break;
                    }
                    Ok(count) => {
                        flow.activity = true;
                        front.pos += count;
                        if front.pos == front.buf.len() {
                            trace!(
                                id = front.id,
                                peer = %self.peer,
                                "stream message written"
                            );
                            self.queue.pop_front();
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break;
                    }
                    Err(err) => {
                        warn!(
                            peer = %self.peer,
                            error = %err,
                            "stream write failed"
                        );
                        broken = Some(Error::StreamWriteError(Arc::new(err)));
                        break;
                    }
                }
            }
        }
        if let Some(error) = broken {
            self.fail_queued(queries, error);
            flow.closed = true;
        }
        flow
    }

    /// Reads as much as the socket allows through the reassembly state.
    pub fn handle_read(&mut self, queries: &Queries) -> Flow {
        let mut flow = Flow::default();
        let mut broken = None;
        {
            let State::Connected(sock) = &self.state else {
                return flow;
            };
            loop {
                match sock.try_read(self.assembly.next_slice()) {
                    Ok(0) => {
                        debug!(peer = %self.peer, "stream closed by peer");
                        broken = Some(if self.assembly.mid_message() {
                            Error::StreamUnexpectedEndOfData
                        } else {
                            Error::ConnectionClosed
                        });
                        break;
                    }
                    Ok(count) => {
                        flow.activity = true;
                        if let Some(msg) = self.assembly.advance(count) {
                            Self::deliver(self.peer, msg, queries);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break;
                    }
                    Err(err) => {
                        warn!(
                            peer = %self.peer,
                            error = %err,
                            "stream read failed"
                        );
                        broken = Some(Error::StreamReadError(Arc::new(err)));
                        break;
                    }
                }
            }
        }
        if let Some(error) = broken {
            self.fail_queued(queries, error);
            flow.closed = true;
        }
        flow
    }

    /// Correlates one completed message.
    fn deliver(peer: SocketAddr, msg: Bytes, queries: &Queries) {
        if msg.len() < 2 {
            debug!(%peer, len = msg.len(), "frame too short for an id; discarded");
            return;
        }
        let id = u16::from_be_bytes([msg[0], msg[1]]);
        trace!(id, %peer, len = msg.len(), "stream message received");
        // The socket is connected to the peer, so no source check is
        // needed here.
        queries.complete(id, None, msg);
    }

    /// Fails every queued write and cancels the idle timer.
    ///
    /// Dropping the channel afterwards closes the socket. Queries whose
    /// writes already went out are left to their own timeouts.
    pub fn fail_queued(&mut self, queries: &Queries, error: Error) {
        if let Some(idle) = self.idle.take() {
            idle.cancel();
        }
        for write in self.queue.drain(..) {
            queries.fail(write.id, error.clone());
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    /// Feeds `data` into the assembly in chunks of at most `step` bytes,
    /// collecting completed messages.
    fn feed(assembly: &mut ReadAssembly, data: &[u8], step: usize) -> Vec<Bytes> {
        let mut done = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let slice = assembly.next_slice();
            let count = step.min(slice.len()).min(rest.len());
            slice[..count].copy_from_slice(&rest[..count]);
            rest = &rest[count..];
            if let Some(msg) = assembly.advance(count) {
                done.push(msg);
            }
        }
        done
    }

    #[test]
    fn frame_prepends_big_endian_length() {
        let buf = frame(b"\x12\x34hello");
        assert_eq!(&buf[..2], &[0, 7]);
        assert_eq!(&buf[2..], b"\x12\x34hello");
    }

    #[test]
    fn reassembles_message_split_across_reads() {
        // Prefix arriving one byte at a time, then the body in one read.
        let mut assembly = ReadAssembly::new();
        assert!(feed(&mut assembly, &[0], 1).is_empty());
        assert!(feed(&mut assembly, &[5], 1).is_empty());
        let done = feed(&mut assembly, b"\x00\x01abc", 5);
        assert_eq!(done, [Bytes::from_static(b"\x00\x01abc")]);

        // Body split across two reads on the same assembly.
        assert!(feed(&mut assembly, &[0, 4], 2).is_empty());
        assert!(feed(&mut assembly, b"\x00\x02", 2).is_empty());
        let done = feed(&mut assembly, b"xy", 2);
        assert_eq!(done, [Bytes::from_static(b"\x00\x02xy")]);
    }

    #[test]
    fn reassembles_back_to_back_messages_bytewise() {
        let mut assembly = ReadAssembly::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame(b"\x00\x01aa"));
        wire.extend_from_slice(&frame(b"\x00\x02bbb"));
        let done = feed(&mut assembly, &wire, 1);
        assert_eq!(
            done,
            [
                Bytes::from_static(b"\x00\x01aa"),
                Bytes::from_static(b"\x00\x02bbb")
            ]
        );
        assert!(!assembly.mid_message());
    }

    #[test]
    fn zero_length_frame_completes_immediately() {
        let mut assembly = ReadAssembly::new();
        let done = feed(&mut assembly, &[0, 0], 2);
        assert_eq!(done, [Bytes::new()]);
        assert!(!assembly.mid_message());
    }

    #[test]
    fn mid_message_is_tracked() {
        let mut assembly = ReadAssembly::new();
        assert!(!assembly.mid_message());
        feed(&mut assembly, &[0], 1);
        assert!(assembly.mid_message());
        feed(&mut assembly, &[3, b'a'], 2);
        assert!(assembly.mid_message());
        feed(&mut assembly, b"bc", 2);
        assert!(!assembly.mid_message());
    }
}
