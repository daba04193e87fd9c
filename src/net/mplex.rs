//! The readiness multiplexer.
//!
//! Every thread owns one [`Multiplexer`]. Descriptors are registered for
//! either read or write readiness together with a [`ConnectionContext`]
//! that says what the descriptor is and what should happen once it becomes
//! ready. The run loop asks the multiplexer for ready descriptors, looks up
//! their current context and dispatches on it.
//!
//! Read registrations can carry a deadline. The run loop collects expired
//! registrations via [`Multiplexer::expired`] and deals with them, usually
//! by closing an idle connection.
//!
//! [`MioMultiplexer`] implements the trait on top of [mio]. Readiness is
//! edge triggered: handlers have to consume everything available or
//! re-register the descriptor.

use core::fmt;
use core::time::Duration;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::net::client::udp::ClientSocketId;
use crate::net::server::connection::TcpConnection;
use crate::sched::WaiterId;

/// The number of events fetched from the OS in one go.
const MAX_EVENTS_PER_BATCH: usize = 1024;

//------------ ConnectionContext ---------------------------------------------

/// What a registered descriptor is.
#[derive(Clone)]
pub enum ConnectionContext {
    /// An outgoing UDP socket waiting for an answer.
    UdpResponse(ClientSocketId),

    /// An outgoing TCP socket with a pending partial transfer.
    TcpClientIo(WaiterId),

    /// An inbound TCP connection reading the next query.
    TcpConnection(Rc<TcpConnection>),

    /// A UDP listen socket, by index into the thread's listeners.
    UdpListener(usize),

    /// A TCP listen socket, by index into the thread's listeners.
    TcpListener(usize),

    /// The wake up end of the thread's pipes.
    Pipe,
}

//--- Debug

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionContext::UdpResponse(id) => {
                f.debug_tuple("UdpResponse").field(id).finish()
            }
            ConnectionContext::TcpClientIo(id) => {
                f.debug_tuple("TcpClientIo").field(id).finish()
            }
            ConnectionContext::TcpConnection(conn) => f
                .debug_tuple("TcpConnection")
                .field(&conn.remote())
                .finish(),
            ConnectionContext::UdpListener(idx) => {
                f.debug_tuple("UdpListener").field(idx).finish()
            }
            ConnectionContext::TcpListener(idx) => {
                f.debug_tuple("TcpListener").field(idx).finish()
            }
            ConnectionContext::Pipe => f.write_str("Pipe"),
        }
    }
}

//------------ Direction -----------------------------------------------------

/// The readiness a descriptor is registered for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// The descriptor has data to read.
    Read,

    /// The descriptor can be written to.
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

//------------ Multiplexer ---------------------------------------------------

/// A readiness notification facility.
///
/// A descriptor is registered for at most one direction at a time.
pub trait Multiplexer {
    /// Starts watching a descriptor for read readiness.
    fn add_read(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError>;

    /// Starts watching a descriptor for write readiness.
    fn add_write(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError>;

    /// Stops watching a descriptor registered for reading.
    fn remove_read(&mut self, fd: RawFd) -> Result<(), MplexError>;

    /// Stops watching a descriptor registered for writing.
    fn remove_write(&mut self, fd: RawFd) -> Result<(), MplexError>;

    /// Switches a registered descriptor to read readiness.
    ///
    /// Also re-arms a descriptor already registered for reading so that it
    /// reports readiness again if there is data left.
    fn alter_to_read(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError>;

    /// Switches a registered descriptor to write readiness.
    fn alter_to_write(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError>;

    /// Sets the deadline of a registered descriptor.
    fn set_deadline(
        &mut self,
        fd: RawFd,
        deadline: Instant,
    ) -> Result<(), MplexError>;

    /// Returns the context a descriptor is currently registered with.
    fn context(&self, fd: RawFd) -> Option<ConnectionContext>;

    /// Returns the direction a descriptor is currently registered for.
    fn direction(&self, fd: RawFd) -> Option<Direction>;

    /// Returns all registrations whose deadline is not after `now`.
    fn expired(&self, now: Instant) -> Vec<(RawFd, ConnectionContext)>;

    /// Returns the earliest deadline of all registrations.
    fn next_deadline(&self) -> Option<Instant>;

    /// Waits for readiness at most `timeout` and collects ready descriptors.
    fn run_once(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<RawFd>,
    ) -> io::Result<()>;

    /// Returns all registered descriptors.
    fn descriptors(&self) -> Vec<RawFd>;

    /// Returns the number of registered descriptors.
    fn len(&self) -> usize;

    /// Returns whether nothing is registered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//------------ MioMultiplexer ------------------------------------------------

/// A multiplexer using [mio].
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    registrations: HashMap<RawFd, Registration>,
    deadlines: BTreeSet<(Instant, RawFd)>,
}

struct Registration {
    direction: Direction,
    ctx: ConnectionContext,
    deadline: Option<Instant>,
}

impl MioMultiplexer {
    /// Creates a new multiplexer.
    pub fn new() -> io::Result<Self> {
        Ok(MioMultiplexer {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS_PER_BATCH),
            registrations: HashMap::new(),
            deadlines: BTreeSet::new(),
        })
    }

    fn add(
        &mut self,
        fd: RawFd,
        direction: Direction,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError> {
        if self.registrations.contains_key(&fd) {
            return Err(MplexError::AlreadyRegistered(fd));
        }
        self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            direction.interest(),
        )?;
        trace!(fd, ?direction, ?ctx, "registered");
        self.insert(fd, direction, ctx, deadline);
        Ok(())
    }

    fn remove(
        &mut self,
        fd: RawFd,
        direction: Direction,
    ) -> Result<(), MplexError> {
        match self.registrations.get(&fd) {
            Some(reg) if reg.direction == direction => {}
            _ => return Err(MplexError::NotRegistered(fd)),
        }
        self.take(fd);
        trace!(fd, ?direction, "deregistered");
        self.poll.registry().deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    fn alter(
        &mut self,
        fd: RawFd,
        direction: Direction,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError> {
        if self.take(fd).is_none() {
            return Err(MplexError::NotRegistered(fd));
        }
        let res = self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            direction.interest(),
        );
        if let Err(err) = res {
            // The registration is gone from the OS side as well now.
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            return Err(err.into());
        }
        trace!(fd, ?direction, ?ctx, "re-registered");
        self.insert(fd, direction, ctx, deadline);
        Ok(())
    }

    fn insert(
        &mut self,
        fd: RawFd,
        direction: Direction,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) {
        if let Some(deadline) = deadline {
            self.deadlines.insert((deadline, fd));
        }
        self.registrations.insert(
            fd,
            Registration {
                direction,
                ctx,
                deadline,
            },
        );
    }

    fn take(&mut self, fd: RawFd) -> Option<Registration> {
        let reg = self.registrations.remove(&fd)?;
        if let Some(deadline) = reg.deadline {
            self.deadlines.remove(&(deadline, fd));
        }
        Some(reg)
    }
}

impl Multiplexer for MioMultiplexer {
    fn add_read(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError> {
        self.add(fd, Direction::Read, ctx, deadline)
    }

    fn add_write(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError> {
        self.add(fd, Direction::Write, ctx, deadline)
    }

    fn remove_read(&mut self, fd: RawFd) -> Result<(), MplexError> {
        self.remove(fd, Direction::Read)
    }

    fn remove_write(&mut self, fd: RawFd) -> Result<(), MplexError> {
        self.remove(fd, Direction::Write)
    }

    fn alter_to_read(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError> {
        self.alter(fd, Direction::Read, ctx, deadline)
    }

    fn alter_to_write(
        &mut self,
        fd: RawFd,
        ctx: ConnectionContext,
        deadline: Option<Instant>,
    ) -> Result<(), MplexError> {
        self.alter(fd, Direction::Write, ctx, deadline)
    }

    fn set_deadline(
        &mut self,
        fd: RawFd,
        deadline: Instant,
    ) -> Result<(), MplexError> {
        let reg = self
            .registrations
            .get_mut(&fd)
            .ok_or(MplexError::NotRegistered(fd))?;
        if let Some(old) = reg.deadline.replace(deadline) {
            self.deadlines.remove(&(old, fd));
        }
        self.deadlines.insert((deadline, fd));
        Ok(())
    }

    fn context(&self, fd: RawFd) -> Option<ConnectionContext> {
        self.registrations.get(&fd).map(|reg| reg.ctx.clone())
    }

    fn direction(&self, fd: RawFd) -> Option<Direction> {
        self.registrations.get(&fd).map(|reg| reg.direction)
    }

    fn expired(&self, now: Instant) -> Vec<(RawFd, ConnectionContext)> {
        self.deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .filter_map(|(_, fd)| {
                self.registrations
                    .get(fd)
                    .map(|reg| (*fd, reg.ctx.clone()))
            })
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    fn run_once(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<RawFd>,
    ) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                return Ok(())
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        ready.extend(self.events.iter().map(|event| event.token().0 as RawFd));
        Ok(())
    }

    fn descriptors(&self) -> Vec<RawFd> {
        self.registrations.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.registrations.len()
    }
}

//--- Debug

impl fmt::Debug for MioMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MioMultiplexer")
            .field("registrations", &self.registrations.len())
            .field("deadlines", &self.deadlines.len())
            .finish()
    }
}

//------------ MplexError ----------------------------------------------------

/// Changing a registration failed.
#[derive(Debug)]
pub enum MplexError {
    /// The descriptor is registered already.
    AlreadyRegistered(RawFd),

    /// The descriptor is not registered, or not for this direction.
    NotRegistered(RawFd),

    /// The OS rejected the change.
    Io(io::Error),
}

//--- From

impl From<io::Error> for MplexError {
    fn from(err: io::Error) -> Self {
        MplexError::Io(err)
    }
}

//--- Display and Error

impl fmt::Display for MplexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MplexError::AlreadyRegistered(fd) => {
                write!(f, "descriptor {} already registered", fd)
            }
            MplexError::NotRegistered(fd) => {
                write!(f, "descriptor {} not registered", fd)
            }
            MplexError::Io(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for MplexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MplexError::AlreadyRegistered(_) => None,
            MplexError::NotRegistered(_) => None,
            MplexError::Io(err) => Some(err),
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn poll(mplex: &mut MioMultiplexer) -> Vec<RawFd> {
        let mut ready = Vec::new();
        mplex
            .run_once(Some(Duration::from_millis(200)), &mut ready)
            .unwrap();
        ready
    }

    #[test]
    fn reports_read_readiness() {
        let mut mplex = MioMultiplexer::new().unwrap();
        let (a, mut b) = pair();
        mplex
            .add_read(a.as_raw_fd(), ConnectionContext::Pipe, None)
            .unwrap();
        assert!(matches!(
            mplex.add_read(a.as_raw_fd(), ConnectionContext::Pipe, None),
            Err(MplexError::AlreadyRegistered(_))
        ));
        b.write_all(b"x").unwrap();
        assert_eq!(poll(&mut mplex), vec![a.as_raw_fd()]);
        assert!(matches!(
            mplex.context(a.as_raw_fd()),
            Some(ConnectionContext::Pipe)
        ));
        assert_eq!(mplex.direction(a.as_raw_fd()), Some(Direction::Read));
    }

    #[test]
    fn alter_switches_direction() {
        let mut mplex = MioMultiplexer::new().unwrap();
        let (a, _b) = pair();
        let fd = a.as_raw_fd();
        mplex
            .add_read(fd, ConnectionContext::UdpListener(0), None)
            .unwrap();
        assert!(poll(&mut mplex).is_empty());
        assert_eq!(mplex.descriptors(), vec![fd]);
        mplex
            .alter_to_write(fd, ConnectionContext::TcpListener(1), None)
            .unwrap();
        assert_eq!(poll(&mut mplex), vec![fd]);
        assert_eq!(mplex.direction(fd), Some(Direction::Write));
        assert!(matches!(
            mplex.remove_read(fd),
            Err(MplexError::NotRegistered(_))
        ));
        mplex.remove_write(fd).unwrap();
        assert!(mplex.is_empty());
        assert!(matches!(
            mplex.alter_to_read(fd, ConnectionContext::Pipe, None),
            Err(MplexError::NotRegistered(_))
        ));
    }

    #[test]
    fn deadlines_expire() {
        let mut mplex = MioMultiplexer::new().unwrap();
        let (a, _b) = pair();
        let (c, _d) = pair();
        let now = Instant::now();
        mplex
            .add_read(
                a.as_raw_fd(),
                ConnectionContext::Pipe,
                Some(now + Duration::from_secs(10)),
            )
            .unwrap();
        mplex
            .add_read(c.as_raw_fd(), ConnectionContext::Pipe, None)
            .unwrap();
        assert_eq!(mplex.next_deadline(), Some(now + Duration::from_secs(10)));
        assert!(mplex.expired(now).is_empty());

        mplex.set_deadline(c.as_raw_fd(), now).unwrap();
        let expired: Vec<_> =
            mplex.expired(now).into_iter().map(|(fd, _)| fd).collect();
        assert_eq!(expired, vec![c.as_raw_fd()]);

        mplex.remove_read(c.as_raw_fd()).unwrap();
        assert!(mplex.expired(now).is_empty());
        assert_eq!(mplex.next_deadline(), Some(now + Duration::from_secs(10)));
    }
}
