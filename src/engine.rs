//! The engine facade.
//!
//! An [`Engine`] owns one reactor thread plus the query registry shared
//! with it. Submitting a query registers it, allocates its transaction id,
//! and posts a send command to the reactor; the result arrives later
//! through the completion callback. The facade itself never blocks on the
//! network.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::error;

use crate::dgram::DgramChannel;
use crate::error::Error;
use crate::queries::{Executor, Queries, Transport};
use crate::reactor::{Command, Reactor};

//------------ Module Configuration ------------------------------------------

/// How often the reactor checks for expired timeouts.
const CHECK_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(50),
    Duration::from_millis(1),
    Duration::from_secs(10),
);

/// How long a quiet stream channel stays open.
const IDLE_LINGER: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(3000),
    Duration::from_millis(1),
    Duration::from_secs(3600),
);

/// Size of the datagram receive buffer in octets.
const RECV_SIZE: DefMinMax<usize> = DefMinMax::new(65535, 512, 65535);

//------------ Config --------------------------------------------------------

/// Configuration of an engine.
#[derive(Clone)]
pub struct Config {
    /// Timeout check interval of the reactor.
    check_interval: Duration,

    /// Idle linger of stream channels.
    idle_linger: Duration,

    /// Datagram receive buffer size.
    recv_size: usize,

    /// Local address the datagram socket binds to.
    bind_addr: SocketAddr,

    /// Optional executor for callbacks and timeout tasks.
    executor: Option<Executor>,
}

impl Config {
    /// Creates a default configuration.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the timeout check interval.
    ///
    /// This bounds both how long the reactor sleeps between readiness
    /// events and how late a timeout can fire.
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Sets the timeout check interval.
    ///
    /// Limited to between 1 ms and 10 s, inclusive. Defaults to 50 ms.
    pub fn set_check_interval(&mut self, value: Duration) {
        self.check_interval = CHECK_INTERVAL.limit(value)
    }

    /// Returns the idle linger of stream channels.
    pub fn idle_linger(&self) -> Duration {
        self.idle_linger
    }

    /// Sets how long a stream channel without traffic stays open.
    ///
    /// Limited to between 1 ms and 1 hour, inclusive. Defaults to 3 s.
    pub fn set_idle_linger(&mut self, value: Duration) {
        self.idle_linger = IDLE_LINGER.limit(value)
    }

    /// Returns the datagram receive buffer size.
    pub fn recv_size(&self) -> usize {
        self.recv_size
    }

    /// Sets the datagram receive buffer size.
    ///
    /// Datagrams longer than this are truncated by the socket. Limited to
    /// between 512 and 65535 octets, inclusive. Defaults to the maximum.
    pub fn set_recv_size(&mut self, value: usize) {
        self.recv_size = RECV_SIZE.limit(value)
    }

    /// Returns the local bind address of the datagram socket.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Sets the local bind address of the datagram socket.
    ///
    /// Defaults to `0.0.0.0:0`, i.e., a kernel-chosen port.
    pub fn set_bind_addr(&mut self, value: SocketAddr) {
        self.bind_addr = value
    }

    /// Installs an executor for completion callbacks and timeout tasks.
    ///
    /// Without one, callbacks run inline on the reactor thread and must
    /// not block.
    pub fn set_executor(&mut self, executor: Executor) {
        self.executor = Some(executor)
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Config {
            check_interval: CHECK_INTERVAL.default(),
            idle_linger: IDLE_LINGER.default(),
            recv_size: RECV_SIZE.default(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            executor: None,
        }
    }
}

//--- Debug

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("check_interval", &self.check_interval)
            .field("idle_linger", &self.idle_linger)
            .field("recv_size", &self.recv_size)
            .field("bind_addr", &self.bind_addr)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

//------------ Engine --------------------------------------------------------

/// An asynchronous query engine.
///
/// Dropping the engine shuts the reactor down; all still-outstanding
/// queries fail with [`Error::Shutdown`].
pub struct Engine {
    /// Sender half of the reactor's command channel.
    sender: mpsc::UnboundedSender<Command>,

    /// The query registry shared with the reactor.
    queries: Arc<Queries>,

    /// The actual local address of the datagram socket.
    local_addr: SocketAddr,

    /// The reactor thread, until shutdown.
    thread: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Creates an engine and starts its reactor thread.
    ///
    /// Binds the datagram socket immediately, so bind errors surface here
    /// rather than on first use.
    pub fn new(config: Config) -> Result<Self, Error> {
        let sock = std::net::UdpSocket::bind(config.bind_addr)
            .map_err(|err| Error::UdpBind(Arc::new(err)))?;
        sock.set_nonblocking(true)
            .map_err(|err| Error::UdpBind(Arc::new(err)))?;
        let local_addr = sock
            .local_addr()
            .map_err(|err| Error::UdpBind(Arc::new(err)))?;

        let runtime = runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| Error::Reactor(Arc::new(err)))?;
        let dgram = {
            // Socket registration needs the runtime context.
            let _guard = runtime.enter();
            DgramChannel::new(sock, config.recv_size)?
        };

        let queries = Arc::new(Queries::new(config.executor.clone()));
        let (sender, commands) = mpsc::unbounded_channel();
        let reactor = Reactor::new(
            commands,
            sender.clone(),
            dgram,
            queries.clone(),
            config.executor,
            config.check_interval,
            config.idle_linger,
        );
        let thread = thread::Builder::new()
            .name("dns-engine".into())
            .spawn(move || runtime.block_on(reactor.run()))
            .map_err(|err| Error::Reactor(Arc::new(err)))?;

        Ok(Engine {
            sender,
            queries,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Submits a query.
    ///
    /// The first two octets of `request` are overwritten with the
    /// allocated transaction id before transmission. The callback is
    /// invoked exactly once: with the response payload, or with the error
    /// that ended the query. It may be invoked on the reactor thread, so
    /// it must not block unless an executor is configured.
    ///
    /// The request must be at least two octets long, and for the stream
    /// transport no longer than 65535 octets.
    pub fn resolve<F>(
        &self,
        request: Vec<u8>,
        server: SocketAddr,
        transport: Transport,
        timeout: Duration,
        callback: F,
    ) -> Result<QueryHandle, Error>
    where
        F: FnOnce(Result<Bytes, Error>) + Send + 'static,
    {
        if request.len() < 2 {
            return Err(Error::ShortMessage);
        }
        if transport == Transport::Stream
            && request.len() > usize::from(u16::MAX)
        {
            return Err(Error::StreamLongMessage);
        }
        let deadline = Instant::now() + timeout;
        let (id, msg) = self.queries.insert(
            request,
            server,
            transport,
            deadline,
            Box::new(callback),
        )?;
        let cmd = match transport {
            Transport::Dgram => Command::SendDgram {
                id,
                msg,
                peer: server,
            },
            Transport::Stream => Command::SendStream {
                id,
                msg,
                peer: server,
            },
        };
        if self.sender.send(cmd).is_err() {
            self.queries.forget(id);
            return Err(Error::Shutdown);
        }
        Ok(QueryHandle {
            id,
            queries: self.queries.clone(),
        })
    }

    /// Returns the local address of the datagram socket.
    ///
    /// Useful when binding to a kernel-chosen port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the number of currently outstanding queries.
    pub fn pending_queries(&self) -> usize {
        self.queries.len()
    }

    /// Shuts the engine down and waits for the reactor thread.
    ///
    /// Every outstanding query fails with [`Error::Shutdown`] before this
    /// returns. Called implicitly on drop.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        drop(self.sender.send(Command::Shutdown));
        if thread.join().is_err() {
            error!("reactor thread panicked");
            self.queries.drain_all(Error::Shutdown);
        }
    }
}

//--- Drop

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown()
    }
}

//------------ QueryHandle ---------------------------------------------------

/// A handle to one submitted query.
///
/// Dropping the handle does not affect the query.
#[derive(Clone)]
pub struct QueryHandle {
    /// The allocated transaction id.
    id: u16,

    /// The registry the query lives in.
    queries: Arc<Queries>,
}

impl QueryHandle {
    /// Returns the transaction id allocated to the query.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Cancels the query.
    ///
    /// If it is still pending, the callback receives
    /// [`Error::Cancelled`]; if it already finished, this is a no-op.
    pub fn cancel(&self) {
        self.queries.cancel(self.id)
    }
}

//--- Debug

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle").field("id", &self.id).finish()
    }
}

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values of a config variable.
#[derive(Clone, Copy)]
struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T: Copy + PartialOrd> DefMinMax<T> {
    /// Creates a new value.
    const fn new(def: T, min: T, max: T) -> Self {
        DefMinMax { def, min, max }
    }

    /// Returns the default value.
    fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    fn limit(self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_limits_are_enforced() {
        let mut config = Config::new();

        config.set_check_interval(Duration::ZERO);
        assert_eq!(config.check_interval(), Duration::from_millis(1));
        config.set_check_interval(Duration::from_secs(999));
        assert_eq!(config.check_interval(), Duration::from_secs(10));

        config.set_idle_linger(Duration::ZERO);
        assert_eq!(config.idle_linger(), Duration::from_millis(1));

        config.set_recv_size(0);
        assert_eq!(config.recv_size(), 512);
        config.set_recv_size(1 << 20);
        assert_eq!(config.recv_size(), 65535);
    }

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.check_interval(), Duration::from_millis(50));
        assert_eq!(config.idle_linger(), Duration::from_millis(3000));
        assert_eq!(config.recv_size(), 65535);
        assert_eq!(config.bind_addr(), SocketAddr::from(([0, 0, 0, 0], 0)));
    }
}
