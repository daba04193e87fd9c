//! Exchanging queries with upstream servers over UDP.
//!
//! Every query that is actually sent gets its own socket, bound to a
//! random source port and connected to the server so the kernel only
//! passes on datagrams from that server. The socket is registered with the
//! worker's multiplexer and the sending task waits for the answer under a
//! [`WaitKey`] that names the socket, the server, the transaction ID and
//! the question.
//!
//! A query that is identical to one already outstanding, i.e., with the
//! same server and question but a different transaction ID, is not sent
//! at all. Instead its ID is added to the chain of the outstanding query.
//! When that query's answer arrives, a copy with the ID rewritten is
//! delivered to every member of the chain.
//!
//! Answers that match an outstanding query in everything but the
//! transaction ID are near misses. They are a sign of somebody trying to
//! guess the ID. If more than the configured number of near misses were
//! seen before the real answer arrives, the answer is rejected as spoofed.

use core::cell::{Cell, RefCell};

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, enabled, trace, Level};

use super::error::Error;
use crate::base::{set_message_id, Header, Question, HEADER_LEN};
use crate::config::Config;
use crate::metrics::Counter;
use crate::net::mplex::{ConnectionContext, Multiplexer};
use crate::net::util::to_pcap_text;
use crate::sched::{ExactKey, Outcome, WaitKey, WaiterId};
use crate::worker::WorkerContext;

/// How many times do we try a new random port if binding fails.
///
/// The last attempt leaves the choice of port to the kernel.
const RETRY_RANDOM_PORT: usize = 10;

/// How often a port is drawn before giving up on avoiding excluded ports.
const MAX_PORT_DRAWS: usize = 64;

/// The size of the buffer answers are received into.
const RECV_BUF_SIZE: usize = 65_535;

//------------ ClientSocketId ------------------------------------------------

/// Identifies a socket handed out by [`UdpClientSockets`].
///
/// Descriptors are reused by the OS once closed, so the identifier also
/// carries a serial number unique to the socket.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClientSocketId {
    fd: RawFd,
    serial: u64,
}

impl ClientSocketId {
    /// Returns the descriptor of the socket.
    pub fn fd(self) -> RawFd {
        self.fd
    }
}

//------------ UdpClientSockets ----------------------------------------------

/// The outgoing UDP sockets of one worker.
///
/// A socket belongs to exactly one outstanding query. It is closed when it
/// is released, which happens exactly once.
#[derive(Debug, Default)]
pub struct UdpClientSockets {
    sockets: RefCell<HashMap<RawFd, ClientSocket>>,
    next_serial: Cell<u64>,
    opened: Cell<u64>,
    released: Cell<u64>,
}

#[derive(Debug)]
struct ClientSocket {
    serial: u64,
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpClientSockets {
    /// Creates an empty set of sockets.
    pub fn new() -> Self {
        Default::default()
    }

    /// Opens a new socket connected to `remote`.
    pub fn acquire(
        &self,
        config: &Config,
        remote: SocketAddr,
    ) -> Result<ClientSocketId, Error> {
        let socket = Socket::new(
            Domain::for_address(remote),
            Type::DGRAM,
            Some(Protocol::UDP),
        )
        .map_err(Error::from_setup)?;
        socket.set_nonblocking(true).map_err(Error::from_setup)?;

        let mut rng = rand::thread_rng();
        let local = config.query_local_address_for(&remote, rng.gen());
        let (min, max) = config.udp_source_ports();
        let avoid = config.udp_source_port_avoid();
        let mut tries = 0;
        loop {
            tries += 1;
            let port = if tries == RETRY_RANDOM_PORT || min > max {
                0
            } else {
                (0..MAX_PORT_DRAWS)
                    .map(|_| rng.gen_range(min..=max))
                    .find(|port| !avoid.contains(port))
                    .unwrap_or(0)
            };
            let addr = SockAddr::from(SocketAddr::new(local, port));
            match socket.bind(&addr) {
                Ok(()) => break,
                Err(err) if tries < RETRY_RANDOM_PORT => {
                    trace!(port, "binding outgoing socket failed: {}", err);
                }
                Err(err) => return Err(Error::from_setup(err)),
            }
        }
        socket
            .connect(&SockAddr::from(remote))
            .map_err(Error::from_setup)?;

        let socket = UdpSocket::from(socket);
        let fd = socket.as_raw_fd();
        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);
        self.opened.set(self.opened.get() + 1);
        self.sockets.borrow_mut().insert(
            fd,
            ClientSocket {
                serial,
                socket,
                remote,
            },
        );
        trace!(fd, remote = %remote, "opened outgoing socket");
        Ok(ClientSocketId { fd, serial })
    }

    /// Stops watching and closes a socket.
    ///
    /// Returns whether the socket was still open.
    pub fn release(
        &self,
        mplex: &mut dyn Multiplexer,
        id: ClientSocketId,
    ) -> bool {
        let socket = {
            let mut sockets = self.sockets.borrow_mut();
            match sockets.get(&id.fd) {
                Some(socket) if socket.serial == id.serial => {
                    sockets.remove(&id.fd)
                }
                _ => None,
            }
        };
        match socket {
            Some(socket) => {
                let _ = mplex.remove_read(id.fd);
                self.released.set(self.released.get() + 1);
                trace!(fd = id.fd, "closed outgoing socket");
                drop(socket);
                true
            }
            None => false,
        }
    }

    /// Sends a datagram over a socket.
    fn send(&self, id: ClientSocketId, data: &[u8]) -> io::Result<()> {
        let sockets = self.sockets.borrow();
        let socket = sockets
            .get(&id.fd)
            .filter(|socket| socket.serial == id.serial)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let sent = socket.socket.send(data)?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short send on UDP socket",
            ));
        }
        Ok(())
    }

    /// Receives a datagram from a socket.
    ///
    /// Returns `None` if the socket has been released already.
    fn recv(
        &self,
        id: ClientSocketId,
        buf: &mut [u8],
    ) -> Option<(SocketAddr, io::Result<usize>)> {
        let sockets = self.sockets.borrow();
        let socket = sockets
            .get(&id.fd)
            .filter(|socket| socket.serial == id.serial)?;
        Some((socket.remote, socket.socket.recv(buf)))
    }

    /// Returns the number of open sockets.
    pub fn len(&self) -> usize {
        self.sockets.borrow().len()
    }

    /// Returns whether no socket is open.
    pub fn is_empty(&self) -> bool {
        self.sockets.borrow().is_empty()
    }

    /// Returns the number of sockets opened so far.
    pub fn opened(&self) -> u64 {
        self.opened.get()
    }

    /// Returns the number of sockets released so far.
    pub fn released(&self) -> u64 {
        self.released.get()
    }
}

//------------ Outgoing ------------------------------------------------------

/// What identifies an outgoing query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outgoing {
    /// The server the query is sent to.
    pub dest: SocketAddr,

    /// The transaction ID of the query.
    pub id: u16,

    /// The canonical query name.
    pub qname: String,

    /// The query type.
    pub qtype: u16,
}

impl Outgoing {
    /// Takes ID and question from a query message.
    pub fn from_query(dest: SocketAddr, query: &[u8]) -> Result<Self, Error> {
        let header =
            Header::from_message(query).map_err(|_| Error::PermanentError(None))?;
        let (question, _) = Question::from_message(query)
            .map_err(|_| Error::PermanentError(None))?;
        Ok(Outgoing {
            dest,
            id: header.id(),
            qname: question.qname().into(),
            qtype: question.qtype(),
        })
    }

    fn wait_key(&self, socket: Option<ClientSocketId>) -> WaitKey {
        match socket {
            Some(socket) => WaitKey::udp(
                self.dest,
                socket.fd,
                self.id,
                &self.qname,
                self.qtype,
            ),
            None => {
                WaitKey::chained(self.dest, self.id, &self.qname, self.qtype)
            }
        }
    }
}

//------------ Exchange ------------------------------------------------------

/// Sends a query and waits for its answer.
pub async fn exchange(
    ctx: &WorkerContext,
    query: &[u8],
    dest: SocketAddr,
) -> Result<Vec<u8>, Error> {
    let out = Outgoing::from_query(dest, query)?;
    let socket = send(ctx, query, &out)?;
    receive(ctx, socket, &out).await
}

/// Sends a query unless an identical one is outstanding.
///
/// Returns the socket the query was sent on or `None` if it was chained
/// onto an outstanding query. The result has to be passed to [`receive`]
/// before the calling task yields.
pub fn send(
    ctx: &WorkerContext,
    query: &[u8],
    out: &Outgoing,
) -> Result<Option<ClientSocketId>, Error> {
    let sched = ctx.sched();
    let primary =
        sched
            .waiters()
            .find_partial(out.dest, None, &out.qname, out.qtype);
    if let Some(primary) = primary {
        if sched.waiters_mut().attach_to_chain(primary, out.id) {
            trace!(
                remote = %out.dest, id = out.id, %primary,
                "chained query onto outstanding one"
            );
            return Ok(None);
        }
    }

    let sockets = ctx.udp_sockets();
    let socket = sockets.acquire(ctx.config(), out.dest)?;
    let res = ctx.mplex().add_read(
        socket.fd,
        ConnectionContext::UdpResponse(socket),
        None,
    );
    if let Err(err) = res {
        debug!("registering outgoing socket failed: {}", err);
        sockets.release(&mut **ctx.mplex(), socket);
        return Err(Error::PermanentError(None));
    }
    if enabled!(Level::TRACE) {
        trace!(
            fd = socket.fd, remote = %out.dest,
            "sending query: {}", to_pcap_text(query, query.len())
        );
    }
    if let Err(err) = sockets.send(socket, query) {
        sockets.release(&mut **ctx.mplex(), socket);
        return Err(Error::from_setup(err));
    }
    Ok(Some(socket))
}

/// Waits for the answer to a query sent with [`send`].
///
/// The socket is released on every path out of this function.
pub async fn receive(
    ctx: &WorkerContext,
    socket: Option<ClientSocketId>,
    out: &Outgoing,
) -> Result<Vec<u8>, Error> {
    let _guard = socket.map(|socket| SocketGuard { ctx, socket });
    let wait = ctx
        .sched()
        .wait_event(out.wait_key(socket), ctx.config().network_timeout())
        .map_err(|_| Error::PermanentError(None))?;
    let completion = wait.await;
    match completion.outcome {
        Outcome::TimedOut => Err(Error::Timeout),
        Outcome::Delivered(payload) if payload.is_empty() => {
            Err(Error::PermanentError(None))
        }
        Outcome::Delivered(payload) => {
            let limit = ctx.config().spoof_nearmiss_max();
            let near_misses = completion.key.near_misses;
            if limit > 0 && near_misses > limit {
                ctx.counters().inc(Counter::SpoofCount);
                debug!(
                    remote = %out.dest, near_misses,
                    "discarding answer after too many near misses"
                );
                Err(Error::Spoofed)
            } else {
                Ok(payload)
            }
        }
    }
}

/// Releases a socket when dropped.
struct SocketGuard<'a> {
    ctx: &'a WorkerContext,
    socket: ClientSocketId,
}

impl Drop for SocketGuard<'_> {
    fn drop(&mut self) {
        self.ctx
            .udp_sockets()
            .release(&mut **self.ctx.mplex(), self.socket);
    }
}

//------------ Response handling ---------------------------------------------

/// Processes datagrams that arrived on an outgoing socket.
///
/// Reads until the socket has nothing left or has been released.
pub fn handle_response(ctx: &WorkerContext, socket: ClientSocketId) {
    let mut buf = vec![0; RECV_BUF_SIZE];
    loop {
        let Some((remote, res)) = ctx.udp_sockets().recv(socket, &mut buf)
        else {
            return;
        };
        match res {
            Ok(len) if len >= HEADER_LEN => {
                if dispatch_answer(ctx, socket, remote, &buf[..len]) {
                    return;
                }
            }
            Ok(len) => {
                ctx.counters().inc(Counter::ServerParseErrors);
                if ctx.config().log_common_errors() {
                    debug!(remote = %remote, len, "answer too short");
                }
                fail_socket(ctx, socket, remote);
                return;
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                return
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(remote = %remote, "receiving answer failed: {}", err);
                fail_socket(ctx, socket, remote);
                return;
            }
        }
    }
}

/// Matches an answer to its waiter.
///
/// Returns whether the socket has been released.
fn dispatch_answer(
    ctx: &WorkerContext,
    socket: ClientSocketId,
    remote: SocketAddr,
    packet: &[u8],
) -> bool {
    let header = match Header::from_message(packet) {
        Ok(header) => header,
        Err(_) => return false,
    };
    if enabled!(Level::TRACE) {
        trace!(
            fd = socket.fd, remote = %remote,
            "received answer: {}", to_pcap_text(packet, packet.len())
        );
    }
    let (qname, qtype) = if !header.qr() || header.qdcount() == 0 {
        (String::new(), 0)
    } else {
        match Question::from_message(packet) {
            Ok((question, _)) => (question.qname().to_string(), question.qtype()),
            Err(err) => {
                ctx.counters().inc(Counter::ServerParseErrors);
                if ctx.config().log_common_errors() {
                    debug!(remote = %remote, "unparsable answer: {}", err);
                }
                return false;
            }
        }
    };

    let sched = ctx.sched();
    let exact = ExactKey {
        remote: Some(remote),
        fd: Some(socket.fd),
        tcp_fd: None,
        id: header.id(),
        qname,
        qtype,
    };
    let found = sched.waiters().find_exact(&exact);
    if let Some(waiter) = found {
        deliver_with_chain(ctx, waiter, packet);
        ctx.udp_sockets().release(&mut **ctx.mplex(), socket);
        return true;
    }

    if exact.qname.is_empty() {
        let found =
            sched
                .waiters()
                .find_questionless(remote, socket.fd, header.id());
        if let Some(waiter) = found {
            trace!(remote = %remote, id = header.id(), "matched answer without question");
            deliver_with_chain(ctx, waiter, packet);
            ctx.udp_sockets().release(&mut **ctx.mplex(), socket);
            return true;
        }
    } else {
        sched.waiters_mut().record_near_miss(
            socket.fd,
            remote,
            &exact.qname,
            exact.qtype,
        );
    }

    ctx.counters().inc(Counter::UnexpectedCount);
    if ctx.config().log_common_errors() {
        debug!(
            remote = %remote, id = header.id(), qname = %exact.qname,
            "discarding unexpected answer"
        );
    }
    false
}

/// Delivers an answer to a waiter and every member of its chain.
///
/// The chain is closed first so nothing attaches to it any more and the
/// chain members receive their copies before the primary is removed.
fn deliver_with_chain(ctx: &WorkerContext, waiter: WaiterId, packet: &[u8]) {
    let sched = ctx.sched();
    let chain = sched.waiters_mut().close_chain(waiter);
    if !chain.is_empty() {
        let (remote, qname, qtype) = match sched.waiters().get(waiter) {
            Some(key) => (key.remote, key.qname.clone(), key.qtype),
            None => return,
        };
        for id in chain {
            let mut copy = packet.to_vec();
            if !copy.is_empty() {
                set_message_id(&mut copy, id);
            }
            let key = ExactKey {
                remote,
                fd: None,
                tcp_fd: None,
                id,
                qname: qname.clone(),
                qtype,
            };
            let member = sched.waiters().find_exact(&key);
            if let Some(member) = member {
                sched.deliver(member, copy);
                ctx.counters().inc(Counter::ChainResends);
            }
        }
    }
    sched.deliver(waiter, packet.to_vec());
}

/// Fails every query waiting on a socket and releases the socket.
fn fail_socket(ctx: &WorkerContext, socket: ClientSocketId, remote: SocketAddr) {
    let waiters: Vec<_> = ctx
        .sched()
        .waiters()
        .iter()
        .filter(|(_, key)| {
            key.fd == Some(socket.fd) && key.remote == Some(remote)
        })
        .map(|(id, _)| id)
        .collect();
    for waiter in waiters {
        deliver_with_chain(ctx, waiter, &[]);
    }
    ctx.udp_sockets().release(&mut **ctx.mplex(), socket);
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mplex::MioMultiplexer;

    fn local_config() -> Config {
        let mut config = Config::new();
        config.set_query_local_addresses(vec!["127.0.0.1".parse().unwrap()]);
        config
    }

    #[test]
    fn acquired_sockets_are_released_once() {
        let config = local_config();
        let mut mplex = MioMultiplexer::new().unwrap();
        let sockets = UdpClientSockets::new();
        let id = sockets
            .acquire(&config, "127.0.0.1:53".parse().unwrap())
            .unwrap();
        assert_eq!(sockets.len(), 1);
        assert!(sockets.release(&mut mplex, id));
        assert!(!sockets.release(&mut mplex, id));
        assert!(sockets.is_empty());
        assert_eq!((sockets.opened(), sockets.released()), (1, 1));
    }

    #[test]
    fn stale_ids_do_not_release_reused_descriptors() {
        let config = local_config();
        let mut mplex = MioMultiplexer::new().unwrap();
        let sockets = UdpClientSockets::new();
        let remote = "127.0.0.1:53".parse().unwrap();
        let first = sockets.acquire(&config, remote).unwrap();
        assert!(sockets.release(&mut mplex, first));
        let second = sockets.acquire(&config, remote).unwrap();
        let stale = ClientSocketId {
            fd: second.fd,
            serial: first.serial,
        };
        assert!(!sockets.release(&mut mplex, stale));
        assert_eq!(sockets.len(), 1);
        assert!(sockets.release(&mut mplex, second));
    }

    #[test]
    fn failed_connect_leaves_nothing_open() {
        let config = local_config();
        let sockets = UdpClientSockets::new();
        // Connecting to the broadcast address without SO_BROADCAST fails.
        let res = sockets.acquire(&config, "255.255.255.255:53".parse().unwrap());
        assert!(matches!(res, Err(Error::PermanentError(Some(_)))));
        assert!(sockets.is_empty());
        assert_eq!((sockets.opened(), sockets.released()), (0, 0));
    }

    #[test]
    fn source_port_stays_in_range() {
        let mut config = local_config();
        config.set_udp_source_ports(40000, 40100);
        config.set_udp_source_port_avoid((40000..40050).collect());
        let sockets = UdpClientSockets::new();
        let id = sockets
            .acquire(&config, "127.0.0.1:53".parse().unwrap())
            .unwrap();
        let port = sockets.sockets.borrow()[&id.fd]
            .socket
            .local_addr()
            .unwrap()
            .port();
        assert!(!(40000..40050).contains(&port));
    }

    #[test]
    fn outgoing_takes_id_and_question() {
        let question = Question::new("Example.COM", 28, 1).unwrap();
        let query = crate::base::build_query(77, &question, false).unwrap();
        let out =
            Outgoing::from_query("192.0.2.1:53".parse().unwrap(), &query)
                .unwrap();
        assert_eq!(out.id, 77);
        assert_eq!(out.qname, "example.com.");
        assert_eq!(out.qtype, 28);
        assert!(matches!(
            Outgoing::from_query("192.0.2.1:53".parse().unwrap(), &query[..5]),
            Err(Error::PermanentError(None))
        ));
    }
}
