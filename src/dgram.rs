//! The datagram transport channel.
//!
//! One nonblocking UDP socket serves every remote endpoint, since datagram
//! sockets are connectionless. Outbound datagrams wait in a FIFO queue;
//! write readiness is only polled while the queue is non-empty. Each
//! readiness event is answered with exactly one nonblocking send or
//! receive, and each received datagram is one complete response.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::queries::Queries;
use crate::reactor::Events;

//------------ DgramChannel --------------------------------------------------

/// The engine's single datagram channel.
pub(crate) struct DgramChannel {
    /// The nonblocking socket.
    sock: UdpSocket,

    /// Outbound datagrams in submission order.
    queue: VecDeque<(u16, Bytes, SocketAddr)>,

    /// Reusable receive buffer.
    recv_buf: Vec<u8>,

    /// Set once the socket itself has failed; sends then fail immediately.
    dead: bool,
}

impl DgramChannel {
    /// Wraps an already bound, nonblocking socket.
    ///
    /// Must be called from within the reactor's runtime.
    pub fn new(
        sock: std::net::UdpSocket,
        recv_size: usize,
    ) -> Result<Self, Error> {
        let sock = UdpSocket::from_std(sock)
            .map_err(|err| Error::UdpBind(Arc::new(err)))?;
        Ok(DgramChannel {
            sock,
            queue: VecDeque::new(),
            recv_buf: vec![0; recv_size],
            dead: false,
        })
    }

    /// Enqueues one datagram for `peer`.
    ///
    /// On a dead channel the query is failed right away instead.
    pub fn send(
        &mut self,
        id: u16,
        msg: Bytes,
        peer: SocketAddr,
        queries: &Queries,
    ) {
        if self.dead {
            queries.fail(id, Error::ConnectionClosed);
            return;
        }
        self.queue.push_back((id, msg, peer));
    }

    /// Polls socket readiness.
    ///
    /// Write interest is implied by a non-empty queue; read interest is
    /// permanent. An error here means the socket itself is broken; it is
    /// wrapped for the side of the socket it came from.
    pub fn poll_events(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Events, Error>> {
        if self.dead {
            return Poll::Pending;
        }
        let mut events = Events::default();
        if !self.queue.is_empty() {
            if let Poll::Ready(res) = self.sock.poll_send_ready(cx) {
                if let Err(err) = res {
                    return Poll::Ready(Err(Error::UdpSend(Arc::new(err))));
                }
                events.writable = true;
            }
        }
        if let Poll::Ready(res) = self.sock.poll_recv_ready(cx) {
            if let Err(err) = res {
                return Poll::Ready(Err(Error::UdpReceive(Arc::new(err))));
            }
            events.readable = true;
        }
        if events.any() {
            Poll::Ready(Ok(events))
        } else {
            Poll::Pending
        }
    }

    /// Pops one datagram and performs one nonblocking send.
    pub fn handle_write(&mut self, queries: &Queries) {
        let Some((id, msg, peer)) = self.queue.pop_front() else {
            return;
        };
        match self.sock.try_send_to(&msg, peer) {
            Ok(sent) if sent == msg.len() => {
                trace!(id, %peer, len = sent, "datagram sent");
            }
            Ok(_) => {
                warn!(id, %peer, "partial datagram send");
                queries.fail(id, Error::UdpShortSend);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.queue.push_front((id, msg, peer));
            }
            Err(err) => {
                warn!(id, %peer, error = %err, "datagram send failed");
                queries.fail(id, Error::UdpSend(Arc::new(err)));
            }
        }
    }

    /// Performs one nonblocking receive and correlates the result.
    pub fn handle_read(&mut self, queries: &Queries) {
        match self.sock.try_recv_from(&mut self.recv_buf) {
            Ok((0, _)) => {
                // An actual empty datagram, not "no data". Nothing to
                // correlate.
            }
            Ok((len, from)) if len < 2 => {
                debug!(%from, len, "datagram too short for an id; discarded");
            }
            Ok((len, from)) => {
                let id =
                    u16::from_be_bytes([self.recv_buf[0], self.recv_buf[1]]);
                trace!(id, %from, len, "datagram received");
                let response = Bytes::copy_from_slice(&self.recv_buf[..len]);
                queries.complete(id, Some(from), response);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!(error = %err, "datagram receive failed");
            }
        }
    }

    /// Marks the channel dead and fails every queued write.
    pub fn fail_all(&mut self, queries: &Queries, error: Error) {
        self.dead = true;
        for (id, _, _) in self.queue.drain(..) {
            queries.fail(id, error.clone());
        }
    }
}

//============ Tests =========================================================
