//! The per-thread worker context and its run loop.
//!
//! Every OS thread of the core owns exactly one [`WorkerContext`]. It holds
//! everything the thread works with: the [`Scheduler`] running the tasks,
//! the [`Multiplexer`] the thread waits on, the outgoing UDP sockets, the
//! accounting of inbound TCP connections, and the listen sockets the thread
//! serves. None of it is shared with other threads; the context is handed
//! around as a [`WorkerRef`], a reference counted pointer, so tasks can keep
//! it alive while they are suspended.
//!
//! The run loop alternates between polling runnable tasks and waiting on
//! the multiplexer. Ready descriptors are dispatched by the
//! [`ConnectionContext`] they are currently registered with. Afterwards
//! expired waits are timed out and idle TCP connections closed.
//!
//! Threads talk to each other only via the pipes in [`pipes`], set up by
//! the [`runtime`].

use core::cell::{Cell, RefCell, RefMut};
use core::fmt;
use core::time::Duration;

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use self::pipes::{ThreadPipes, Topology};
use crate::config::Config;
use crate::metrics::Counters;
use crate::net::client::udp::UdpClientSockets;
use crate::net::client::{tcp, udp};
use crate::net::mplex::{
    ConnectionContext, Direction, MioMultiplexer, MplexError, Multiplexer,
};
use crate::net::server::acl::SharedAcl;
use crate::net::server::connection::ClientCounts;
use crate::net::server::service::{NoCache, PacketCache, Resolve};
use crate::net::server::{dgram, stream};
use crate::sched::Scheduler;

pub mod distributor;
pub mod pipes;
pub mod runtime;

//------------ Role ----------------------------------------------------------

/// The job of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Reads UDP queries and hands them to the workers.
    Distributor,

    /// Answers queries.
    Worker,
}

//------------ WorkerRef -----------------------------------------------------

/// A shared reference to the context of the current thread.
pub type WorkerRef = Rc<WorkerContext>;

//------------ WorkerContext -------------------------------------------------

/// Everything a thread of the core works with.
pub struct WorkerContext {
    index: usize,
    role: Role,
    config: Arc<Config>,
    counters: Arc<Counters>,
    sched: Scheduler,
    mplex: RefCell<Box<dyn Multiplexer>>,
    udp_sockets: UdpClientSockets,
    client_counts: ClientCounts,
    udp_listeners: Vec<Arc<UdpSocket>>,
    tcp_listeners: Vec<Arc<TcpListener>>,
    tcp_listening: Cell<bool>,
    topology: Option<Arc<Topology>>,
    pipes: RefCell<Option<ThreadPipes>>,
    engine: Rc<dyn Resolve>,
    cache: Arc<dyn PacketCache>,
    hash_key: (u64, u64),
    acl: SharedAcl,
    shutdown: Cell<bool>,
}

impl WorkerContext {
    /// Returns the index of the thread within the topology.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the role of the thread.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the process wide counters.
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Returns the scheduler of the thread.
    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    /// Returns the multiplexer of the thread.
    ///
    /// The guard must not be held across calls that may need the
    /// multiplexer themselves.
    pub fn mplex(&self) -> RefMut<'_, Box<dyn Multiplexer>> {
        self.mplex.borrow_mut()
    }

    /// Returns the outgoing UDP sockets.
    pub fn udp_sockets(&self) -> &UdpClientSockets {
        &self.udp_sockets
    }

    pub(crate) fn client_counts(&self) -> &ClientCounts {
        &self.client_counts
    }

    /// Returns a UDP listen socket of the thread.
    pub fn udp_listener(&self, idx: usize) -> Option<&Arc<UdpSocket>> {
        self.udp_listeners.get(idx)
    }

    /// Returns a TCP listen socket of the thread.
    pub fn tcp_listener(&self, idx: usize) -> Option<&Arc<TcpListener>> {
        self.tcp_listeners.get(idx)
    }

    /// Returns the number of TCP listen sockets of the thread.
    pub fn tcp_listener_count(&self) -> usize {
        self.tcp_listeners.len()
    }

    pub(crate) fn tcp_listening(&self) -> bool {
        self.tcp_listening.get()
    }

    pub(crate) fn set_tcp_listening(&self, value: bool) {
        self.tcp_listening.set(value)
    }

    /// Returns the topology of all threads, if the thread is part of one.
    pub fn topology(&self) -> Option<&Arc<Topology>> {
        self.topology.as_ref()
    }

    /// Returns the engine answering queries.
    pub fn engine(&self) -> &Rc<dyn Resolve> {
        &self.engine
    }

    /// Returns the packet cache.
    pub fn cache(&self) -> &Arc<dyn PacketCache> {
        &self.cache
    }

    /// Returns the key for hashing questions.
    pub fn hash_key(&self) -> (u64, u64) {
        self.hash_key
    }

    /// Returns the access list for clients.
    pub fn acl(&self) -> &SharedAcl {
        &self.acl
    }

    /// Asks the run loop to end.
    pub fn shutdown(&self) {
        self.shutdown.set(true)
    }

    /// Returns whether the run loop has been asked to end.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }

    /// Runs the thread until [`shutdown`][Self::shutdown] is called.
    ///
    /// All remaining tasks are dropped before returning.
    pub fn run(self: &Rc<Self>) -> io::Result<()> {
        debug!(index = self.index, role = ?self.role, "worker started");
        let res = loop {
            if self.is_shutdown() {
                break Ok(());
            }
            if let Err(err) = self.run_once(None) {
                break Err(err);
            }
        };
        self.sched.clear();
        debug!(index = self.index, "worker stopped");
        res
    }

    /// Runs one round of the loop.
    ///
    /// Waits at most `max_wait` for something to happen.
    pub fn run_once(self: &Rc<Self>, max_wait: Option<Duration>) -> io::Result<()> {
        self.sched.run_ready();
        if self.is_shutdown() {
            return Ok(());
        }

        let timeout = self.poll_timeout(max_wait);
        let mut ready = Vec::new();
        self.mplex.borrow_mut().run_once(timeout, &mut ready)?;
        for fd in ready {
            // Earlier handlers may have changed or removed the registration.
            let ctx = self.mplex.borrow().context(fd);
            if let Some(ctx) = ctx {
                self.dispatch(fd, ctx);
            }
        }

        let now = Instant::now();
        let expired = self.sched.expire(now);
        if expired > 0 {
            trace!(expired, "waits timed out");
        }
        let idle = self.mplex.borrow().expired(now);
        for (fd, ctx) in idle {
            self.handle_expired(fd, ctx);
        }
        stream::update_listeners(self);
        self.sched.run_ready();
        Ok(())
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if self.sched.has_ready() {
            return Some(Duration::ZERO);
        }
        let deadline = match (
            self.sched.next_deadline(),
            self.mplex.borrow().next_deadline(),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let until_deadline =
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (until_deadline, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch(self: &Rc<Self>, fd: RawFd, ctx: ConnectionContext) {
        match ctx {
            ConnectionContext::UdpResponse(socket) => {
                udp::handle_response(self, socket)
            }
            ConnectionContext::TcpClientIo(waiter) => tcp::handle_io(self, waiter),
            ConnectionContext::TcpConnection(conn) => {
                stream::handle_readable(self, conn)
            }
            ConnectionContext::UdpListener(idx) => dgram::handle_readable(self, idx),
            ConnectionContext::TcpListener(idx) => stream::handle_accept(self, idx),
            ConnectionContext::Pipe => pipes::handle_pipe(self),
        }
        trace!(fd, "dispatched readiness");
    }

    fn handle_expired(&self, fd: RawFd, ctx: ConnectionContext) {
        match ctx {
            ConnectionContext::TcpConnection(conn) => {
                stream::handle_timeout(self, &conn)
            }
            other => {
                warn!(fd, ctx = ?other, "unexpected deadline on descriptor");
                let mut mplex = self.mplex();
                let res = match mplex.direction(fd) {
                    Some(Direction::Write) => {
                        mplex.remove_write(fd)
                    }
                    _ => mplex.remove_read(fd),
                };
                if let Err(err) = res {
                    debug!(fd, "removing expired descriptor failed: {}", err);
                }
            }
        }
    }

    pub(crate) fn take_pipes(&self) -> Option<ThreadPipes> {
        self.pipes.borrow_mut().take()
    }

    pub(crate) fn put_pipes(&self, pipes: ThreadPipes) {
        *self.pipes.borrow_mut() = Some(pipes);
    }
}

//--- Debug

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("index", &self.index)
            .field("role", &self.role)
            .field("tasks", &self.sched.runnable_count())
            .field("udp_listeners", &self.udp_listeners.len())
            .field("tcp_listeners", &self.tcp_listeners.len())
            .finish_non_exhaustive()
    }
}

//------------ WorkerBuilder -------------------------------------------------

/// Assembles a [`WorkerContext`].
pub struct WorkerBuilder {
    index: usize,
    role: Role,
    config: Arc<Config>,
    counters: Arc<Counters>,
    engine: Rc<dyn Resolve>,
    cache: Arc<dyn PacketCache>,
    hash_key: (u64, u64),
    acl: SharedAcl,
    load: Arc<AtomicUsize>,
    udp_listeners: Vec<Arc<UdpSocket>>,
    tcp_listeners: Vec<Arc<TcpListener>>,
    topology: Option<(Arc<Topology>, ThreadPipes)>,
}

impl WorkerBuilder {
    /// Starts building a worker with the given engine.
    ///
    /// By default the worker has fresh counters, no packet cache, a random
    /// hash key and the access list of the config.
    pub fn new(index: usize, config: Arc<Config>, engine: Rc<dyn Resolve>) -> Self {
        let acl = SharedAcl::new(config.allow_from().clone());
        WorkerBuilder {
            index,
            role: Role::Worker,
            config,
            counters: Default::default(),
            engine,
            cache: Arc::new(NoCache),
            hash_key: rand::random(),
            acl,
            load: Default::default(),
            udp_listeners: Vec::new(),
            tcp_listeners: Vec::new(),
            topology: None,
        }
    }

    /// Sets the role of the thread.
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the counters to update.
    pub fn counters(mut self, counters: Arc<Counters>) -> Self {
        self.counters = counters;
        self
    }

    /// Sets the packet cache.
    pub fn cache(mut self, cache: Arc<dyn PacketCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the key for hashing questions.
    pub fn hash_key(mut self, key: (u64, u64)) -> Self {
        self.hash_key = key;
        self
    }

    /// Sets the access list for clients.
    pub fn acl(mut self, acl: SharedAcl) -> Self {
        self.acl = acl;
        self
    }

    /// Adds a UDP listen socket.
    ///
    /// The socket has to be in non-blocking mode.
    pub fn udp_listener(mut self, sock: Arc<UdpSocket>) -> Self {
        self.udp_listeners.push(sock);
        self
    }

    /// Adds a TCP listen socket.
    ///
    /// The socket has to be in non-blocking mode.
    pub fn tcp_listener(mut self, sock: Arc<TcpListener>) -> Self {
        self.tcp_listeners.push(sock);
        self
    }

    /// Makes the worker part of a topology.
    pub(crate) fn topology(
        mut self,
        topology: Arc<Topology>,
        pipes: ThreadPipes,
    ) -> Self {
        self.load = topology.info(self.index).load.clone();
        self.topology = Some((topology, pipes));
        self
    }

    /// Creates the context and registers its sockets.
    pub fn build(self) -> io::Result<WorkerRef> {
        let mut mplex = MioMultiplexer::new()?;
        for (idx, sock) in self.udp_listeners.iter().enumerate() {
            mplex
                .add_read(sock.as_raw_fd(), ConnectionContext::UdpListener(idx), None)
                .map_err(into_io)?;
        }
        for (idx, sock) in self.tcp_listeners.iter().enumerate() {
            mplex
                .add_read(sock.as_raw_fd(), ConnectionContext::TcpListener(idx), None)
                .map_err(into_io)?;
        }
        let (topology, pipes) = match self.topology {
            Some((topology, pipes)) => {
                mplex
                    .add_read(pipes.wake_fd(), ConnectionContext::Pipe, None)
                    .map_err(into_io)?;
                (Some(topology), Some(pipes))
            }
            None => (None, None),
        };
        Ok(Rc::new(WorkerContext {
            index: self.index,
            role: self.role,
            config: self.config,
            counters: self.counters,
            sched: Scheduler::with_load_counter(self.load),
            mplex: RefCell::new(Box::new(mplex)),
            udp_sockets: UdpClientSockets::new(),
            client_counts: Rc::new(RefCell::new(HashMap::new())),
            udp_listeners: self.udp_listeners,
            tcp_listeners: self.tcp_listeners,
            tcp_listening: Cell::new(true),
            topology,
            pipes: RefCell::new(pipes),
            engine: self.engine,
            cache: self.cache,
            hash_key: self.hash_key,
            acl: self.acl,
            shutdown: Cell::new(false),
        }))
    }
}

fn into_io(err: MplexError) -> io::Error {
    match err {
        MplexError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

//============ Tests =========================================================
