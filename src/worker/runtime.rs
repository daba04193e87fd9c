//! Starting and stopping the threads of the core.
//!
//! [`Recursor::start`] binds the listen sockets, creates the [`Topology`],
//! and starts one OS thread per distributor and worker, each owning a
//! [`WorkerContext`]. The returned [`Recursor`] is the handle through which
//! the application talks to the threads afterwards.
//!
//! Without distributor threads, every worker reads from every UDP listen
//! socket itself. With distributors, only they read UDP queries and hand
//! them to the workers. TCP connections are always accepted by the workers.
//!
//! [`WorkerContext`]: super::WorkerContext

use core::fmt;

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::oneshot;
use tracing::{error, info};

use super::pipes::{ThreadPipes, Topology};
use super::{Role, WorkerBuilder, WorkerRef};
use crate::config::{Config, ConfigError};
use crate::metrics::Counters;
use crate::net::server::acl::{NetmaskGroup, SharedAcl};
use crate::net::server::service::{PacketCache, ResolveFactory};

/// The backlog of TCP listen sockets.
const LISTEN_BACKLOG: i32 = 128;

//------------ Recursor ------------------------------------------------------

/// A handle to the running threads.
///
/// Dropping the handle shuts the threads down.
pub struct Recursor {
    topology: Arc<Topology>,
    counters: Arc<Counters>,
    acl: SharedAcl,
    udp_addrs: Vec<SocketAddr>,
    tcp_addrs: Vec<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Recursor {
    /// Starts the threads.
    ///
    /// Returns once every thread is ready to serve.
    pub fn start<F>(
        config: Config,
        factory: F,
        cache: Arc<dyn PacketCache>,
    ) -> Result<Self, StartError>
    where
        F: ResolveFactory + 'static,
    {
        config.validate()?;
        let config = Arc::new(config);
        let counters = Arc::new(Counters::new());
        let acl = SharedAcl::new(config.allow_from().clone());
        let hash_key: (u64, u64) = rand::random();
        let factory: Arc<dyn ResolveFactory> = Arc::new(factory);

        let mut udp = Vec::new();
        let mut tcp = Vec::new();
        for addr in config.listen() {
            udp.push(Arc::new(bind_udp(*addr)?));
            tcp.push(Arc::new(bind_tcp(*addr)?));
        }
        let udp_addrs = udp
            .iter()
            .map(|sock| sock.local_addr())
            .collect::<Result<Vec<_>, _>>()?;
        let tcp_addrs = tcp
            .iter()
            .map(|sock| sock.local_addr())
            .collect::<Result<Vec<_>, _>>()?;

        let (topology, pipes) = Topology::new(&config, counters.clone())?;
        let topology = Arc::new(topology);
        let mut recursor = Recursor {
            topology: topology.clone(),
            counters: counters.clone(),
            acl: acl.clone(),
            udp_addrs,
            tcp_addrs,
            threads: Vec::new(),
        };

        let mut ready = Vec::new();
        for (index, pipes) in pipes.into_iter().enumerate() {
            let role = topology.info(index).role();
            let setup = ThreadSetup {
                index,
                role,
                config: config.clone(),
                counters: counters.clone(),
                factory: factory.clone(),
                cache: cache.clone(),
                hash_key,
                acl: acl.clone(),
                udp: if role == Role::Distributor
                    || config.num_distributors() == 0
                {
                    udp.clone()
                } else {
                    Vec::new()
                },
                tcp: if role == Role::Worker {
                    tcp.clone()
                } else {
                    Vec::new()
                },
                topology: topology.clone(),
                pipes,
            };
            let (tx, rx) = oneshot::channel();
            let name = match role {
                Role::Distributor => format!("rec/distr{}", index),
                Role::Worker => format!("rec/worker{}", index),
            };
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || setup.run(tx))?;
            recursor.threads.push(handle);
            ready.push(rx);
        }

        for rx in ready {
            match rx.blocking_recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    return Err(StartError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "thread ended during start up",
                    )))
                }
            }
        }
        info!(
            udp = ?recursor.udp_addrs, tcp = ?recursor.tcp_addrs,
            "recursor started"
        );
        Ok(recursor)
    }

    /// Returns the process wide counters.
    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Returns the topology of the threads.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Returns the addresses of the UDP listen sockets.
    pub fn udp_addrs(&self) -> &[SocketAddr] {
        &self.udp_addrs
    }

    /// Returns the addresses of the TCP listen sockets.
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    /// Runs a function on every thread and waits for all of them.
    pub fn broadcast<F>(&self, func: F) -> usize
    where
        F: Fn(&WorkerRef) + Send + Sync + 'static,
    {
        self.topology.broadcast(func)
    }

    /// Runs a function on every thread and sums up the results.
    pub fn broadcast_acc<T, F>(&self, func: F) -> T
    where
        T: Default + core::ops::AddAssign + Send + 'static,
        F: Fn(&WorkerRef) -> T + Send + Sync + 'static,
    {
        self.topology.broadcast_acc(func)
    }

    /// Replaces the list of clients allowed to query.
    pub fn set_allow_from(&self, group: NetmaskGroup) {
        info!(allow_from = %group, "updating access list");
        self.acl.store(group);
    }

    /// Stops all threads and waits for them to finish.
    pub fn shutdown(mut self) {
        self.stop()
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        // Threads that already ended simply do not answer.
        self.topology.broadcast(|ctx| ctx.shutdown());
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("recursor thread panicked");
            }
        }
        info!("recursor stopped");
    }
}

impl Drop for Recursor {
    fn drop(&mut self) {
        self.stop()
    }
}

impl fmt::Debug for Recursor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Recursor")
            .field("udp_addrs", &self.udp_addrs)
            .field("tcp_addrs", &self.tcp_addrs)
            .field("threads", &self.threads.len())
            .finish()
    }
}

//------------ ThreadSetup ---------------------------------------------------

/// Everything a thread needs to build its context.
struct ThreadSetup {
    index: usize,
    role: Role,
    config: Arc<Config>,
    counters: Arc<Counters>,
    factory: Arc<dyn ResolveFactory>,
    cache: Arc<dyn PacketCache>,
    hash_key: (u64, u64),
    acl: SharedAcl,
    udp: Vec<Arc<UdpSocket>>,
    tcp: Vec<Arc<TcpListener>>,
    topology: Arc<Topology>,
    pipes: ThreadPipes,
}

impl ThreadSetup {
    fn run(self, ready: oneshot::Sender<io::Result<()>>) {
        let mut builder = WorkerBuilder::new(
            self.index,
            self.config,
            self.factory.make(self.index),
        )
        .role(self.role)
        .counters(self.counters)
        .cache(self.cache)
        .hash_key(self.hash_key)
        .acl(self.acl)
        .topology(self.topology, self.pipes);
        for sock in self.udp {
            builder = builder.udp_listener(sock);
        }
        for sock in self.tcp {
            builder = builder.tcp_listener(sock);
        }
        let ctx = match builder.build() {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(index = self.index, "setting up thread failed: {}", err);
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        if let Err(err) = ctx.run() {
            error!(index = self.index, "thread failed: {}", err);
        }
    }
}

//------------ Binding -------------------------------------------------------

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let sock =
        Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.set_reuse_address(true)?;
    sock.bind(&SockAddr::from(addr))?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

fn bind_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    let sock = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.set_reuse_address(true)?;
    sock.bind(&SockAddr::from(addr))?;
    sock.listen(LISTEN_BACKLOG)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into())
}

//------------ StartError ----------------------------------------------------

/// The threads could not be started.
#[derive(Debug)]
pub enum StartError {
    /// The configuration is not usable.
    Config(ConfigError),

    /// Setting up sockets or threads failed.
    Io(io::Error),
}

impl From<ConfigError> for StartError {
    fn from(err: ConfigError) -> Self {
        StartError::Config(err)
    }
}

impl From<io::Error> for StartError {
    fn from(err: io::Error) -> Self {
        StartError::Io(err)
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StartError::Config(err) => write!(f, "invalid configuration: {}", err),
            StartError::Io(err) => write!(f, "start up failed: {}", err),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartError::Config(err) => Some(err),
            StartError::Io(err) => Some(err),
        }
    }
}
