//! The registry of outstanding queries.
//!
//! This is the one structure shared between caller threads and the reactor
//! thread. Callers insert and cancel; the reactor completes, times out, or
//! fails. Every terminal path removes the entry from the map under the lock
//! and only the remover invokes the completion callback, so exactly one
//! notification is delivered per query no matter how paths race.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::Error;
use crate::timeouts::{Task, TimeoutHandle};

//------------ Module Configuration ------------------------------------------

/// Maximum number of outstanding queries per engine.
///
/// Kept well below the 16-bit id space so id allocation stays fast.
const MAX_PENDING: usize = 0xA000;

//------------ Transport -----------------------------------------------------

/// The transport used to carry a query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    /// Unreliable datagram transport (UDP).
    Dgram,

    /// Reliable stream transport (TCP) with 2-byte length framing.
    Stream,
}

//------------ Callback, Executor --------------------------------------------

/// The completion callback of a query. Invoked exactly once.
pub(crate) type Callback = Box<dyn FnOnce(Result<Bytes, Error>) + Send>;

/// An engine-wide executor for completion callbacks and timeout tasks.
///
/// When installed, the reactor hands work to it instead of running it
/// inline, so slow handlers do not stall I/O.
pub type Executor = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

//------------ Query ---------------------------------------------------------

/// The lifecycle states of a query.
///
/// `Pending` is the only non-terminal state; the terminal states are
/// mutually exclusive and entered at most once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum QueryState {
    /// Waiting for a response or timeout.
    Pending,

    /// Finished with a response or a channel failure.
    Completed,

    /// Finished by the timeout registry.
    TimedOut,

    /// Finished by the caller.
    Cancelled,
}

/// One outstanding query.
pub(crate) struct Query {
    /// The payload as transmitted, transaction id already patched in.
    request: Bytes,

    /// The remote endpoint the query was sent to.
    server: SocketAddr,

    /// The transport the query was submitted on.
    transport: Transport,

    /// Absolute expiration time.
    deadline: Instant,

    /// The completion callback.
    callback: Callback,

    /// Current lifecycle state.
    state: QueryState,

    /// The matching timeout entry, once the reactor has scheduled it.
    timer: Option<TimeoutHandle>,
}

impl Query {
    /// Enters a terminal state and returns the callback for delivery.
    fn finish(mut self, state: QueryState) -> Callback {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.state = state;
        trace!(
            state = ?self.state,
            transport = ?self.transport,
            server = %self.server,
            len = self.request.len(),
            "query finished"
        );
        self.callback
    }
}

//------------ Queries -------------------------------------------------------

/// The registry of outstanding queries, keyed by transaction id.
pub(crate) struct Queries {
    /// The pending queries.
    pending: Mutex<HashMap<u16, Query>>,

    /// Optional executor for callback delivery.
    executor: Option<Executor>,
}

impl Queries {
    /// Creates an empty registry.
    pub fn new(executor: Option<Executor>) -> Self {
        Queries {
            pending: Mutex::new(HashMap::new()),
            executor,
        }
    }

    /// Returns the number of outstanding queries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Registers a new query and allocates its transaction id.
    ///
    /// The id is chosen starting from a random value and probing upward
    /// until an id not currently in flight is found; the first two octets
    /// of `request` are overwritten with it. Returns the id and the final
    /// payload.
    pub fn insert(
        &self,
        mut request: Vec<u8>,
        server: SocketAddr,
        transport: Transport,
        deadline: Instant,
        callback: Callback,
    ) -> Result<(u16, Bytes), Error> {
        let mut pending = self.lock();
        if pending.len() >= MAX_PENDING {
            return Err(Error::TooManyQueries);
        }
        let mut id: u16 = rand::random();
        loop {
            match pending.entry(id) {
                MapEntry::Vacant(entry) => {
                    request[..2].copy_from_slice(&id.to_be_bytes());
                    let request = Bytes::from(request);
                    entry.insert(Query {
                        request: request.clone(),
                        server,
                        transport,
                        deadline,
                        callback,
                        state: QueryState::Pending,
                        timer: None,
                    });
                    return Ok((id, request));
                }
                MapEntry::Occupied(_) => {
                    id = id.wrapping_add(1);
                }
            }
        }
    }

    /// Returns the deadline of a still-pending query.
    pub fn deadline(&self, id: u16) -> Option<Instant> {
        self.lock().get(&id).map(|query| query.deadline)
    }

    /// Attaches the matching timeout entry to a pending query.
    ///
    /// Returns `false` if the query is already gone, in which case the
    /// caller must cancel the handle itself and drop the send.
    pub fn set_timer(&self, id: u16, timer: TimeoutHandle) -> bool {
        match self.lock().get_mut(&id) {
            Some(query) => {
                query.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    /// Completes a query with a response payload.
    ///
    /// An id with no pending entry is an orphan response: logged and
    /// discarded. If `from` is given, a source address other than the
    /// query's server is treated the same way.
    pub fn complete(&self, id: u16, from: Option<SocketAddr>, response: Bytes) {
        let query = {
            let mut pending = self.lock();
            if let (Some(from), Some(query)) = (from, pending.get(&id)) {
                if query.server != from {
                    debug!(id, %from, "response from unexpected address; discarded");
                    return;
                }
            }
            pending.remove(&id)
        };
        match query {
            Some(query) => {
                let callback = query.finish(QueryState::Completed);
                self.deliver(callback, Ok(response));
            }
            None => {
                debug!(id, "orphan response; discarded");
            }
        }
    }

    /// Times out a query. Fired only by the timeout registry.
    ///
    /// A no-op if the query already reached a terminal state; the registry
    /// removal makes the second of the racing paths observe "absent".
    pub fn expire(&self, id: u16) {
        // Take the entry in its own statement so the guard is gone
        // before delivery; callbacks may re-enter the registry.
        let query = self.lock().remove(&id);
        if let Some(query) = query {
            let callback = query.finish(QueryState::TimedOut);
            self.deliver(callback, Err(Error::Timeout));
        }
    }

    /// Fails a query because its channel broke.
    pub fn fail(&self, id: u16, error: Error) {
        let query = self.lock().remove(&id);
        if let Some(query) = query {
            let callback = query.finish(QueryState::Completed);
            self.deliver(callback, Err(error));
        }
    }

    /// Cancels a query on behalf of the caller.
    pub fn cancel(&self, id: u16) {
        let query = self.lock().remove(&id);
        if let Some(query) = query {
            let callback = query.finish(QueryState::Cancelled);
            self.deliver(callback, Err(Error::Cancelled));
        }
    }

    /// Removes a query without delivering anything.
    ///
    /// Used when handing the query to the reactor fails right after
    /// registration; the submitter reports the error through its own
    /// return value instead.
    pub fn forget(&self, id: u16) {
        self.lock().remove(&id);
    }

    /// Fails every outstanding query. Used at engine teardown.
    pub fn drain_all(&self, error: Error) {
        let drained: Vec<Query> = {
            let mut pending = self.lock();
            pending.drain().map(|(_, query)| query).collect()
        };
        for query in drained {
            let callback = query.finish(QueryState::Completed);
            self.deliver(callback, Err(error.clone()));
        }
    }

    /// Delivers a result, inline or through the configured executor.
    fn deliver(&self, callback: Callback, result: Result<Bytes, Error>) {
        match &self.executor {
            Some(executor) => {
                executor(Box::new(move || callback(result)));
            }
            None => callback(result),
        }
    }

    /// Wraps a timeout task for a query id.
    pub fn expire_task(self: &Arc<Self>, id: u16) -> Task {
        let queries = self.clone();
        Box::new(move || queries.expire(id))
    }

    /// Locks the map.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, Query>> {
        self.pending.lock().expect("query registry lock poisoned")
    }
}

//============ Tests =========================================================
