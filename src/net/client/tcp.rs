//! Moving bytes over TCP connections to upstream servers.
//!
//! Each operation is first attempted right away. Only if the socket cannot
//! complete it does the calling task register the descriptor with the
//! worker's multiplexer and suspend. The partial transfer travels with the
//! task's [`WaitKey`] and is advanced by [`handle_io`] whenever the socket
//! becomes ready, until it completes or fails.
//!
//! The actual I/O is done by a [`TcpIoHandler`]. A handler may need to
//! write while the caller asked it to read, for instance while negotiating
//! in-band, so every step reports which readiness it needs next and the
//! registration is moved to that direction.

use core::fmt;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use super::error::Error;
use crate::net::mplex::{ConnectionContext, Direction, MplexError};
use crate::sched::{Outcome, WaitKey, WaiterId};
use crate::worker::WorkerContext;

//------------ IoState -------------------------------------------------------

/// The readiness an operation needs to make progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoState {
    /// The socket has to become readable.
    NeedRead,

    /// The socket has to become writable.
    NeedWrite,

    /// Nothing is needed, the operation is complete.
    Done,
}

//------------ TcpIoHandler --------------------------------------------------

/// Performs non-blocking I/O on a connection.
pub trait TcpIoHandler {
    /// Returns the descriptor of the underlying socket.
    fn descriptor(&self) -> RawFd;

    /// Reads into `buf[*pos..want]`, advancing `pos`.
    ///
    /// Returns [`IoState::Done`] once `pos` reached `want`. The end of the
    /// stream is an error.
    fn try_read(
        &self,
        buf: &mut [u8],
        pos: &mut usize,
        want: usize,
    ) -> io::Result<IoState>;

    /// Writes `buf[*pos..want]`, advancing `pos`.
    fn try_write(
        &self,
        buf: &[u8],
        pos: &mut usize,
        want: usize,
    ) -> io::Result<IoState>;

    /// Returns the outcome of a connect that was in progress.
    fn connect_result(&self) -> io::Result<()> {
        Ok(())
    }
}

//------------ PlainTcpHandler -----------------------------------------------

/// A handler for unencrypted TCP connections.
#[derive(Debug)]
pub struct PlainTcpHandler {
    stream: TcpStream,
}

impl PlainTcpHandler {
    /// Creates a handler for a stream.
    ///
    /// The stream is switched to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(PlainTcpHandler { stream })
    }

    /// Returns the underlying stream.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl TcpIoHandler for PlainTcpHandler {
    fn descriptor(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn try_read(
        &self,
        buf: &mut [u8],
        pos: &mut usize,
        want: usize,
    ) -> io::Result<IoState> {
        while *pos < want {
            match (&self.stream).read(&mut buf[*pos..want]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ))
                }
                Ok(len) => *pos += len,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoState::NeedRead)
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(IoState::Done)
    }

    fn try_write(
        &self,
        buf: &[u8],
        pos: &mut usize,
        want: usize,
    ) -> io::Result<IoState> {
        while *pos < want {
            match (&self.stream).write(&buf[*pos..want]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(len) => *pos += len,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoState::NeedWrite)
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(IoState::Done)
    }

    fn connect_result(&self) -> io::Result<()> {
        match self.stream.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

//------------ TcpTransfer ---------------------------------------------------

/// A partial operation on a TCP connection.
pub struct TcpTransfer {
    handler: Rc<dyn TcpIoHandler>,
    action: TcpAction,

    /// The readiness the descriptor is currently registered for.
    registered: IoState,
}

enum TcpAction {
    Reading {
        buf: Vec<u8>,
        pos: usize,
        wanted: usize,
        incomplete_ok: bool,
    },
    Writing {
        buf: Vec<u8>,
        pos: usize,
    },
    Connecting,
}

/// The result of advancing a transfer.
enum Step {
    Pending(IoState),
    Finished(Vec<u8>),
    Failed(io::Error),
}

impl TcpTransfer {
    fn new(handler: Rc<dyn TcpIoHandler>, action: TcpAction) -> Self {
        TcpTransfer {
            handler,
            action,
            registered: IoState::Done,
        }
    }

    /// Returns the number of bytes transferred so far.
    pub fn progress(&self) -> usize {
        match self.action {
            TcpAction::Reading { pos, .. } => pos,
            TcpAction::Writing { pos, .. } => pos,
            TcpAction::Connecting => 0,
        }
    }

    fn advance(&mut self) -> Step {
        let handler = self.handler.clone();
        match self.action {
            TcpAction::Reading {
                ref mut buf,
                ref mut pos,
                wanted,
                incomplete_ok,
            } => match handler.try_read(buf, pos, wanted) {
                Ok(state) => {
                    if state == IoState::Done || (incomplete_ok && *pos > 0) {
                        let mut buf = core::mem::take(buf);
                        buf.truncate(*pos);
                        Step::Finished(buf)
                    } else {
                        Step::Pending(state)
                    }
                }
                Err(err) => Step::Failed(err),
            },
            TcpAction::Writing {
                ref mut buf,
                ref mut pos,
            } => {
                let want = buf.len();
                match handler.try_write(buf, pos, want) {
                    Ok(IoState::Done) => Step::Finished(core::mem::take(buf)),
                    Ok(state) => Step::Pending(state),
                    Err(err) => Step::Failed(err),
                }
            }
            TcpAction::Connecting => match handler.connect_result() {
                Ok(()) => Step::Finished(vec![1]),
                Err(err) => Step::Failed(err),
            },
        }
    }
}

//--- Debug

impl fmt::Debug for TcpTransfer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let action = match self.action {
            TcpAction::Reading { .. } => "reading",
            TcpAction::Writing { .. } => "writing",
            TcpAction::Connecting => "connecting",
        };
        f.debug_struct("TcpTransfer")
            .field("fd", &self.handler.descriptor())
            .field("action", &action)
            .field("progress", &self.progress())
            .field("registered", &self.registered)
            .finish()
    }
}

//------------ Operations ----------------------------------------------------

/// Writes all of `data` to a connection.
pub async fn async_send(
    ctx: &WorkerContext,
    handler: &Rc<dyn TcpIoHandler>,
    data: &[u8],
) -> Result<(), Error> {
    let mut pos = 0;
    let state = handler
        .try_write(data, &mut pos, data.len())
        .map_err(Error::permanent)?;
    if state == IoState::Done {
        return Ok(());
    }
    let transfer = TcpTransfer::new(
        handler.clone(),
        TcpAction::Writing {
            buf: data.to_vec(),
            pos,
        },
    );
    let payload = suspend(ctx, transfer, state).await?;
    if payload == data {
        Ok(())
    } else {
        Err(Error::PermanentError(None))
    }
}

/// Reads from a connection.
///
/// Reads exactly `len` bytes unless `incomplete_ok` is set, in which case
/// it returns as soon as at least one byte has arrived.
pub async fn async_receive(
    ctx: &WorkerContext,
    handler: &Rc<dyn TcpIoHandler>,
    len: usize,
    incomplete_ok: bool,
) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0; len];
    let mut pos = 0;
    let state = handler
        .try_read(&mut buf, &mut pos, len)
        .map_err(Error::permanent)?;
    if state == IoState::Done || (incomplete_ok && pos > 0) {
        buf.truncate(pos);
        return Ok(buf);
    }
    let transfer = TcpTransfer::new(
        handler.clone(),
        TcpAction::Reading {
            buf,
            pos,
            wanted: len,
            incomplete_ok,
        },
    );
    suspend(ctx, transfer, state).await
}

/// Opens a TCP connection to `dest`.
pub async fn async_connect(
    ctx: &WorkerContext,
    dest: SocketAddr,
    local: Option<SocketAddr>,
) -> Result<Rc<dyn TcpIoHandler>, Error> {
    let socket =
        Socket::new(Domain::for_address(dest), Type::STREAM, Some(Protocol::TCP))
            .map_err(Error::from_setup)?;
    socket.set_nonblocking(true).map_err(Error::from_setup)?;
    if let Some(local) = local {
        socket
            .bind(&SockAddr::from(local))
            .map_err(Error::from_setup)?;
    }
    let pending = match socket.connect(&SockAddr::from(dest)) {
        Ok(()) => false,
        Err(ref err)
            if err.raw_os_error() == Some(libc::EINPROGRESS)
                || err.kind() == io::ErrorKind::WouldBlock =>
        {
            true
        }
        Err(err) => return Err(Error::from_setup(err)),
    };
    let handler: Rc<dyn TcpIoHandler> =
        Rc::new(PlainTcpHandler::new(socket.into()).map_err(Error::from_setup)?);
    if pending {
        trace!(remote = %dest, "connect in progress");
        let transfer = TcpTransfer::new(handler.clone(), TcpAction::Connecting);
        suspend(ctx, transfer, IoState::NeedWrite).await?;
    }
    Ok(handler)
}

/// Sends a query and reads its answer, both with a length prefix.
pub async fn tcp_exchange(
    ctx: &WorkerContext,
    handler: &Rc<dyn TcpIoHandler>,
    query: &[u8],
) -> Result<Vec<u8>, Error> {
    let len =
        u16::try_from(query.len()).map_err(|_| Error::PermanentError(None))?;
    let mut msg = Vec::with_capacity(query.len() + 2);
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(query);
    async_send(ctx, handler, &msg).await?;

    let prefix = async_receive(ctx, handler, 2, false).await?;
    let len = usize::from(u16::from_be_bytes([prefix[0], prefix[1]]));
    if len == 0 {
        return Err(Error::PermanentError(None));
    }
    async_receive(ctx, handler, len, false).await
}

/// Suspends the calling task until a transfer completes.
async fn suspend(
    ctx: &WorkerContext,
    mut transfer: TcpTransfer,
    state: IoState,
) -> Result<Vec<u8>, Error> {
    let fd = transfer.handler.descriptor();
    transfer.registered = state;
    let wait = ctx
        .sched()
        .wait_event(WaitKey::tcp(fd, transfer), ctx.config().network_timeout())
        .map_err(|_| Error::PermanentError(None))?;
    let guard = Registration {
        ctx,
        fd,
        waiter: wait.id(),
    };
    state_change(ctx, guard.waiter, fd, IoState::Done, state)
        .map_err(|_| Error::PermanentError(None))?;
    let completion = wait.await;
    drop(guard);
    match completion.outcome {
        Outcome::TimedOut => Err(Error::Timeout),
        Outcome::Delivered(payload) if payload.is_empty() => {
            Err(Error::PermanentError(None))
        }
        Outcome::Delivered(payload) => Ok(payload),
    }
}

/// Removes the registration of a pending transfer when dropped.
struct Registration<'a> {
    ctx: &'a WorkerContext,
    fd: RawFd,
    waiter: WaiterId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut mplex = self.ctx.mplex();
        let ours = matches!(
            mplex.context(self.fd),
            Some(ConnectionContext::TcpClientIo(id)) if id == self.waiter
        );
        if ours {
            let _ = match mplex.direction(self.fd) {
                Some(Direction::Read) => mplex.remove_read(self.fd),
                Some(Direction::Write) => mplex.remove_write(self.fd),
                None => Ok(()),
            };
        }
    }
}

/// Moves the registration of a descriptor to the needed readiness.
fn state_change(
    ctx: &WorkerContext,
    waiter: WaiterId,
    fd: RawFd,
    old: IoState,
    new: IoState,
) -> Result<(), MplexError> {
    let mut mplex = ctx.mplex();
    let cx = ConnectionContext::TcpClientIo(waiter);
    match (old, new) {
        (IoState::Done, IoState::NeedRead) => mplex.add_read(fd, cx, None),
        (IoState::Done, IoState::NeedWrite) => mplex.add_write(fd, cx, None),
        (IoState::NeedRead, IoState::NeedWrite) => {
            mplex.alter_to_write(fd, cx, None)
        }
        (IoState::NeedWrite, IoState::NeedRead) => {
            mplex.alter_to_read(fd, cx, None)
        }
        (IoState::NeedRead, IoState::Done) => mplex.remove_read(fd),
        (IoState::NeedWrite, IoState::Done) => mplex.remove_write(fd),
        _ => Ok(()),
    }
}

/// Advances the pending transfer of a waiter after a readiness event.
pub fn handle_io(ctx: &WorkerContext, waiter: WaiterId) {
    let sched = ctx.sched();
    let (fd, old, step) = {
        let mut waiters = sched.waiters_mut();
        let Some(transfer) = waiters.transfer_mut(waiter) else {
            return;
        };
        let step = transfer.advance();
        let old = transfer.registered;
        if let Step::Pending(new) = step {
            transfer.registered = new;
        } else {
            transfer.registered = IoState::Done;
        }
        (transfer.handler.descriptor(), old, step)
    };
    match step {
        Step::Pending(new) => {
            if let Err(err) = state_change(ctx, waiter, fd, old, new) {
                debug!(fd, "re-registering TCP socket failed: {}", err);
                sched.deliver(waiter, Vec::new());
            }
        }
        Step::Finished(payload) => {
            let _ = state_change(ctx, waiter, fd, old, IoState::Done);
            trace!(fd, len = payload.len(), "TCP transfer complete");
            sched.deliver(waiter, payload);
        }
        Step::Failed(err) => {
            let _ = state_change(ctx, waiter, fd, old, IoState::Done);
            debug!(fd, "TCP transfer failed: {}", err);
            sched.deliver(waiter, Vec::new());
        }
    }
}

//============ Tests =========================================================
