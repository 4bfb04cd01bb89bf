//! The reactor loop.
//!
//! A single dedicated thread runs this loop and is the only code that
//! touches socket state, channel write queues, or timeout entries. Each
//! iteration awaits one readiness poll spanning the command channel, the
//! datagram channel, every stream channel, and the periodic timeout tick;
//! it then dispatches exactly one event. For a ready channel the write
//! handler runs before the read handler.
//!
//! Per-channel I/O errors are logged and fail only the affected operation
//! or channel; the loop keeps serving everything else. Only engine
//! shutdown stops the loop.

use std::collections::HashMap;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::dgram::DgramChannel;
use crate::error::Error;
use crate::queries::{Executor, Queries};
use crate::stream::{Flow, StreamChannel, StreamEvent};
use crate::timeouts::{Task, Timeouts};

//------------ Events --------------------------------------------------------

/// Readiness of one channel.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Events {
    /// The socket can be read.
    pub readable: bool,

    /// The socket can be written and the channel wants to write.
    pub writable: bool,
}

impl Events {
    /// Returns whether anything is ready.
    pub fn any(self) -> bool {
        self.readable || self.writable
    }
}

//------------ Command -------------------------------------------------------

/// A message into the reactor loop.
pub(crate) enum Command {
    /// Transmit a datagram query.
    SendDgram {
        /// Transaction id of the query.
        id: u16,
        /// The payload, id already patched in.
        msg: Bytes,
        /// The remote endpoint.
        peer: SocketAddr,
    },

    /// Transmit a stream query.
    SendStream {
        /// Transaction id of the query.
        id: u16,
        /// The unframed payload, id already patched in.
        msg: Bytes,
        /// The remote endpoint.
        peer: SocketAddr,
    },

    /// An idle linger timer fired for a stream channel.
    StreamIdle {
        /// The channel's endpoint.
        peer: SocketAddr,
        /// Timer generation; stale values are ignored.
        generation: u64,
    },

    /// Stop the loop and fail everything still pending.
    Shutdown,
}

//------------ Event ---------------------------------------------------------

/// What one readiness poll produced.
enum Event {
    /// A command arrived.
    Command(Command),

    /// All command senders are gone.
    Closed,

    /// The timeout check interval elapsed.
    Tick,

    /// The datagram channel is ready.
    Dgram(Events),

    /// The datagram socket itself is broken.
    DgramFailed(Error),

    /// A stream channel is ready or finished connecting.
    Stream(SocketAddr, StreamEvent),
}

//------------ Reactor -------------------------------------------------------

/// The engine's reactor.
pub(crate) struct Reactor {
    /// The receiving end of the command channel.
    commands: mpsc::UnboundedReceiver<Command>,

    /// Sender for commands the reactor posts to itself (idle timers).
    sender: mpsc::UnboundedSender<Command>,

    /// The shared datagram channel.
    dgram: DgramChannel,

    /// Stream channels by remote endpoint.
    streams: HashMap<SocketAddr, StreamChannel>,

    /// The timeout registry.
    timeouts: Timeouts,

    /// The query registry.
    queries: Arc<Queries>,

    /// Optional executor for fired timeout tasks.
    executor: Option<Executor>,

    /// How often to check the timeout registry.
    check_interval: Duration,

    /// How long a quiet stream channel lingers before closing.
    idle_linger: Duration,
}

impl Reactor {
    /// Creates a reactor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commands: mpsc::UnboundedReceiver<Command>,
        sender: mpsc::UnboundedSender<Command>,
        dgram: DgramChannel,
        queries: Arc<Queries>,
        executor: Option<Executor>,
        check_interval: Duration,
        idle_linger: Duration,
    ) -> Self {
        Reactor {
            commands,
            sender,
            dgram,
            streams: HashMap::new(),
            timeouts: Timeouts::new(),
            queries,
            executor,
            check_interval,
            idle_linger,
        }
    }

    /// Runs the loop until shutdown.
    pub async fn run(mut self) {
        debug!("reactor started");
        let mut tick = time::interval(self.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let event = poll_fn(|cx| self.poll_event(cx, &mut tick)).await;
            match event {
                Event::Command(Command::Shutdown) | Event::Closed => break,
                Event::Command(cmd) => self.handle_command(cmd),
                Event::Tick => self.check_timeouts(),
                Event::Dgram(events) => {
                    let queries = self.queries.clone();
                    if events.writable {
                        self.dgram.handle_write(&queries);
                    }
                    if events.readable {
                        self.dgram.handle_read(&queries);
                    }
                }
                Event::DgramFailed(error) => {
                    warn!(%error, "datagram socket failed; channel closed");
                    let queries = self.queries.clone();
                    self.dgram.fail_all(&queries, error);
                }
                Event::Stream(peer, event) => self.drive_stream(peer, event),
            }
        }
        self.teardown();
    }

    /// One readiness poll across everything the reactor owns.
    ///
    /// Commands are served first so submissions and idle events cannot be
    /// starved by busy sockets.
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
        tick: &mut Interval,
    ) -> Poll<Event> {
        if let Poll::Ready(cmd) = self.commands.poll_recv(cx) {
            return Poll::Ready(match cmd {
                Some(cmd) => Event::Command(cmd),
                None => Event::Closed,
            });
        }
        match self.dgram.poll_events(cx) {
            Poll::Ready(Ok(events)) => {
                return Poll::Ready(Event::Dgram(events))
            }
            Poll::Ready(Err(err)) => {
                return Poll::Ready(Event::DgramFailed(err))
            }
            Poll::Pending => {}
        }
        for (peer, chan) in self.streams.iter_mut() {
            if let Poll::Ready(event) = chan.poll_events(cx) {
                return Poll::Ready(Event::Stream(*peer, event));
            }
        }
        if tick.poll_tick(cx).is_ready() {
            return Poll::Ready(Event::Tick);
        }
        Poll::Pending
    }

    /// Handles one command.
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendDgram { id, msg, peer } => {
                if !self.arm_query_timer(id) {
                    return;
                }
                let queries = self.queries.clone();
                self.dgram.send(id, msg, peer, &queries);
            }
            Command::SendStream { id, msg, peer } => {
                if !self.arm_query_timer(id) {
                    return;
                }
                if !self.streams.contains_key(&peer) {
                    trace!(%peer, "opening stream channel");
                    self.streams.insert(peer, StreamChannel::new(peer));
                    self.touch_stream(peer);
                }
                if let Some(chan) = self.streams.get_mut(&peer) {
                    chan.send(id, &msg);
                }
            }
            Command::StreamIdle { peer, generation } => {
                let current = self
                    .streams
                    .get(&peer)
                    .map(|chan| chan.generation());
                if current != Some(generation) {
                    trace!(%peer, "stale idle timer ignored");
                    return;
                }
                debug!(%peer, "closing idle stream channel");
                if let Some(mut chan) = self.streams.remove(&peer) {
                    let queries = self.queries.clone();
                    chan.fail_queued(&queries, Error::StreamIdleTimeout);
                }
            }
            Command::Shutdown => {
                // Handled in the run loop.
            }
        }
    }

    /// Schedules the expiration timer for a freshly submitted query.
    ///
    /// Returns `false` if the query reached a terminal state before the
    /// command was processed; the send is then dropped.
    fn arm_query_timer(&mut self, id: u16) -> bool {
        let Some(deadline) = self.queries.deadline(id) else {
            trace!(id, "query gone before dispatch");
            return false;
        };
        let handle = self
            .timeouts
            .schedule_at(deadline, self.queries.expire_task(id));
        if !self.queries.set_timer(id, handle.clone()) {
            handle.cancel();
            return false;
        }
        true
    }

    /// Resets the idle linger timer of a stream channel.
    ///
    /// The old timer is cancelled and a fresh one created; its task posts
    /// an idle command carrying the new generation back into the loop.
    fn touch_stream(&mut self, peer: SocketAddr) {
        let Some(chan) = self.streams.get_mut(&peer) else {
            return;
        };
        let generation = chan.begin_activity();
        let sender = self.sender.clone();
        let task: Task = Box::new(move || {
            drop(sender.send(Command::StreamIdle { peer, generation }));
        });
        let handle =
            self.timeouts.schedule(Instant::now(), self.idle_linger, task);
        chan.set_idle_timer(handle);
    }

    /// Dispatches a stream channel event.
    fn drive_stream(&mut self, peer: SocketAddr, event: StreamEvent) {
        match event {
            StreamEvent::Connected(Ok(())) => {
                trace!(%peer, "stream connected");
                self.touch_stream(peer);
            }
            StreamEvent::Connected(Err(err)) => {
                warn!(%peer, error = %err, "stream connect failed");
                if let Some(mut chan) = self.streams.remove(&peer) {
                    let queries = self.queries.clone();
                    chan.fail_queued(
                        &queries,
                        Error::ConnectError(Arc::new(err)),
                    );
                }
            }
            StreamEvent::Io(events) => {
                let queries = self.queries.clone();
                let mut flow = Flow::default();
                if let Some(chan) = self.streams.get_mut(&peer) {
                    if events.writable {
                        let res = chan.handle_write(&queries);
                        flow.activity |= res.activity;
                        flow.closed |= res.closed;
                    }
                    if events.readable && !flow.closed {
                        let res = chan.handle_read(&queries);
                        flow.activity |= res.activity;
                        flow.closed |= res.closed;
                    }
                }
                if flow.closed {
                    self.streams.remove(&peer);
                } else if flow.activity {
                    self.touch_stream(peer);
                }
            }
        }
    }

    /// Fires expired timeout entries.
    fn check_timeouts(&mut self) {
        for fired in self.timeouts.check(Instant::now()) {
            match &self.executor {
                Some(executor) => executor(fired.into_task()),
                None => fired.run(),
            }
        }
    }

    /// Fails everything still pending and drops all sockets.
    fn teardown(mut self) {
        debug!("reactor stopping");
        let queries = self.queries.clone();
        for (_, mut chan) in self.streams.drain() {
            chan.fail_queued(&queries, Error::Shutdown);
        }
        self.dgram.fail_all(&queries, Error::Shutdown);
        queries.drain_all(Error::Shutdown);
    }
}
