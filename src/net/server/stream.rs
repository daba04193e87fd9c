//! Answering queries received over TCP.
//!
//! Every thread that serves TCP watches the listen sockets for incoming
//! connections. An accepted connection is registered for reading with an
//! idle deadline. The framer of the [`TcpConnection`] assembles queries
//! from what is read, and each query is answered by a task of its own, so
//! a client can have several queries in flight on one connection. Once
//! `max_tcp_in_flight` queries are outstanding, the connection is no
//! longer read from until one of them has been answered.
//!
//! A connection is terminated by removing its read registration. The
//! socket itself is closed once the last task answering one of its queries
//! has finished.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, enabled, trace, Level};

use super::connection::{Frame, FrameError, StreamFramer, TcpConnection};
use super::proxy::ProxyHeader;
use super::service::{self, Request, Transport};
use crate::base::{error_response, rcode, Header};
use crate::metrics::Counter;
use crate::net::mplex::ConnectionContext;
use crate::net::util::to_pcap_text;
use crate::worker::{WorkerContext, WorkerRef};

/// The size of the buffer used for reading from a connection.
const READ_BUF_SIZE: usize = 4096;

//------------ Accepting -----------------------------------------------------

/// Accepts all pending connections on a listen socket.
pub fn handle_accept(ctx: &WorkerRef, idx: usize) {
    let Some(listener) = ctx.tcp_listener(idx).cloned() else {
        return;
    };
    loop {
        match listener.accept() {
            Ok((stream, remote)) => accept_connection(ctx, stream, remote),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!("accepting TCP connection failed: {}", err);
                break;
            }
        }
    }
}

fn accept_connection(
    ctx: &WorkerRef,
    stream: TcpStream,
    remote: SocketAddr,
) {
    let config = ctx.config();
    if ctx.sched().runnable_count() > config.max_tasks() {
        ctx.counters().inc(Counter::OverCapacityDrops);
        debug!(remote = %remote, "dropping TCP connection, over capacity");
        return;
    }

    let from_proxy = config.proxy_protocol_from().matches(&remote.ip());
    if !from_proxy && !ctx.acl().matches(&remote.ip()) {
        ctx.counters().inc(Counter::UnauthorizedTcp);
        if config.log_common_errors() {
            debug!(remote = %remote, "dropping TCP connection, not allowed");
        }
        return;
    }

    let max_per_client = config.max_tcp_per_client();
    if max_per_client > 0 {
        let open = ctx
            .client_counts()
            .borrow()
            .get(&remote.ip())
            .copied()
            .unwrap_or(0);
        if open >= max_per_client {
            ctx.counters().inc(Counter::TcpClientOverflow);
            debug!(
                remote = %remote, open,
                "dropping TCP connection, too many from client"
            );
            return;
        }
    }

    let framer =
        StreamFramer::new(from_proxy, config.proxy_protocol_max_size());
    let conn = match TcpConnection::new(
        stream,
        remote,
        framer,
        ctx.client_counts().clone(),
        ctx.counters().clone(),
    ) {
        Ok(conn) => Rc::new(conn),
        Err(err) => {
            debug!(remote = %remote, "setting up TCP connection failed: {}", err);
            return;
        }
    };
    let deadline = Instant::now() + config.tcp_idle_timeout();
    let res = ctx.mplex().add_read(
        conn.fd(),
        ConnectionContext::TcpConnection(conn.clone()),
        Some(deadline),
    );
    match res {
        Ok(()) => trace!(fd = conn.fd(), remote = %remote, "accepted TCP connection"),
        Err(err) => debug!(remote = %remote, "registering TCP connection failed: {}", err),
    }
}

//------------ Listener throttling -------------------------------------------

/// Stops or resumes accepting depending on the number of open connections.
///
/// While more connections than `max_tcp_clients` are open in the process,
/// the listen sockets of this thread are not watched.
pub fn update_listeners(ctx: &WorkerContext) {
    if ctx.tcp_listener_count() == 0 {
        return;
    }
    let open = ctx.counters().current_tcp_connections();
    let over = open > ctx.config().max_tcp_clients();
    if over == !ctx.tcp_listening() {
        return;
    }
    let mut mplex = ctx.mplex();
    for idx in 0..ctx.tcp_listener_count() {
        let Some(listener) = ctx.tcp_listener(idx) else {
            continue;
        };
        let fd = listener.as_raw_fd();
        let res = if over {
            mplex.remove_read(fd)
        } else {
            mplex.add_read(fd, ConnectionContext::TcpListener(idx), None)
        };
        if let Err(err) = res {
            debug!(fd, "updating TCP listener failed: {}", err);
        }
    }
    ctx.set_tcp_listening(!over);
    debug!(
        open,
        "{} accepting TCP connections",
        if over { "stopped" } else { "resumed" }
    );
}

//------------ Reading -------------------------------------------------------

/// Reads from a connection until it would block.
pub fn handle_readable(ctx: &WorkerRef, conn: Rc<TcpConnection>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        if conn.state().closed {
            return;
        }
        let want = conn.state().framer.wanted().min(buf.len());
        let len = match conn.read(&mut buf[..want]) {
            Ok(0) => {
                trace!(fd = conn.fd(), remote = %conn.remote(), "connection closed by peer");
                terminate(ctx, &conn);
                return;
            }
            Ok(len) => len,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                continue
            }
            Err(err) => {
                debug!(remote = %conn.remote(), "reading from connection failed: {}", err);
                terminate(ctx, &conn);
                return;
            }
        };

        let mut data = &buf[..len];
        while !data.is_empty() {
            let res = conn.state_mut().framer.feed(data);
            let (used, frame) = match res {
                Ok(res) => res,
                Err(err) => {
                    framing_failed(ctx, &conn, err);
                    return;
                }
            };
            data = &data[used..];
            let keep_reading = match frame {
                Some(Frame::Proxy(header)) => accept_proxy(ctx, &conn, header),
                Some(Frame::Message(msg)) => handle_query(ctx, &conn, msg),
                None => true,
            };
            if !keep_reading {
                return;
            }
        }
    }
}

fn framing_failed(ctx: &WorkerContext, conn: &TcpConnection, err: FrameError) {
    match err {
        FrameError::ProxyInvalid | FrameError::ProxyTooLarge => {
            ctx.counters().inc(Counter::ProxyProtocolInvalid);
            if ctx.config().log_common_errors() {
                debug!(remote = %conn.remote(), "{}", err);
            }
        }
        FrameError::EmptyMessage => {
            trace!(remote = %conn.remote(), "{}", err);
        }
    }
    terminate(ctx, conn);
}

/// Takes the client addresses from a proxy protocol header.
///
/// Returns whether the connection is still to be read from.
fn accept_proxy(
    ctx: &WorkerContext,
    conn: &TcpConnection,
    header: ProxyHeader,
) -> bool {
    let source = {
        let mut state = conn.state_mut();
        if let Some(source) = header.source {
            state.source = source;
        }
        if let Some(destination) = header.destination {
            state.destination = destination;
        }
        state.proxy_values = header.values;
        state.source
    };
    if !ctx.acl().matches(&source.ip()) {
        ctx.counters().inc(Counter::UnauthorizedTcp);
        if ctx.config().log_common_errors() {
            debug!(
                remote = %conn.remote(), source = %source,
                "dropping proxied TCP connection, not allowed"
            );
        }
        terminate(ctx, conn);
        return false;
    }
    true
}

/// Checks a query and starts answering it.
///
/// Returns whether the connection is still to be read from.
fn handle_query(
    ctx: &WorkerRef,
    conn: &Rc<TcpConnection>,
    msg: Vec<u8>,
) -> bool {
    if enabled!(Level::TRACE) {
        trace!(
            fd = conn.fd(), remote = %conn.remote(),
            "received query: {}", to_pcap_text(&msg, msg.len())
        );
    }
    let header = match Header::from_message(&msg) {
        Ok(header) => header,
        Err(_) => {
            ctx.counters().inc(Counter::ClientParseErrors);
            if ctx.config().log_common_errors() {
                debug!(remote = %conn.remote(), "query too short");
            }
            terminate(ctx, conn);
            return false;
        }
    };
    if header.qr() {
        ctx.counters().inc(Counter::IgnoredCount);
        if ctx.config().log_common_errors() {
            debug!(remote = %conn.remote(), "ignoring answer on TCP connection");
        }
        terminate(ctx, conn);
        return false;
    }
    if header.opcode() != 0 {
        ctx.counters().inc(Counter::IgnoredCount);
        debug!(
            remote = %conn.remote(), opcode = header.opcode(),
            "refusing unsupported opcode"
        );
        return send_error(ctx, conn, &msg, rcode::NOTIMP);
    }
    if header.qdcount() == 0 {
        ctx.counters().inc(Counter::EmptyQueries);
        debug!(remote = %conn.remote(), "refusing query without question");
        return send_error(ctx, conn, &msg, rcode::NOTIMP);
    }

    ctx.counters().inc(Counter::Queries);
    ctx.counters().inc(Counter::TcpQueries);

    if let Some(response) = service::cache_lookup(ctx, &msg) {
        let had_error = send(conn, &response);
        return finish_reply(ctx, conn, had_error, false);
    }

    let config = ctx.config();
    let in_flight = {
        let mut state = conn.state_mut();
        state.in_flight += 1;
        state.in_flight
    };
    let keep_reading = if in_flight >= config.max_tcp_in_flight() {
        trace!(fd = conn.fd(), in_flight, "pausing reads, too many queries in flight");
        if let Err(err) = ctx.mplex().remove_read(conn.fd()) {
            debug!(fd = conn.fd(), "pausing connection failed: {}", err);
        }
        false
    } else {
        let deadline = Instant::now() + config.tcp_idle_timeout();
        if let Err(err) = ctx.mplex().set_deadline(conn.fd(), deadline) {
            debug!(fd = conn.fd(), "updating deadline failed: {}", err);
        }
        true
    };

    let request = {
        let state = conn.state();
        Request {
            message: msg,
            source: state.source,
            destination: state.destination,
            remote: conn.remote(),
            transport: Transport::Tcp,
            tcp_fd: Some(conn.fd()),
            received_at: Instant::now(),
            proxy_values: state.proxy_values.clone(),
        }
    };
    let task_ctx = ctx.clone();
    let task_conn = conn.clone();
    ctx.sched().spawn(async move {
        let had_error = match service::answer(task_ctx.clone(), request).await
        {
            Some(response) => send(&task_conn, &response),
            None => false,
        };
        finish_reply(&task_ctx, &task_conn, had_error, true);
    });
    keep_reading
}

/// Writes a response. Returns whether that failed.
fn send(conn: &TcpConnection, response: &[u8]) -> bool {
    if enabled!(Level::TRACE) {
        trace!(
            fd = conn.fd(), remote = %conn.remote(),
            "sending answer: {}", to_pcap_text(response, response.len())
        );
    }
    match conn.send_response(response) {
        Ok(()) => false,
        Err(err) => {
            debug!(remote = %conn.remote(), "sending answer failed: {}", err);
            true
        }
    }
}

/// Answers a query with an error right away.
///
/// Returns whether the connection is still to be read from.
fn send_error(
    ctx: &WorkerContext,
    conn: &TcpConnection,
    query: &[u8],
    rcode: u8,
) -> bool {
    let failed = match error_response(query, rcode) {
        Ok(response) => send(conn, &response),
        Err(err) => {
            debug!(remote = %conn.remote(), "building error response failed: {}", err);
            true
        }
    };
    if failed {
        terminate(ctx, conn);
    }
    !failed
}

/// Does the book keeping after a response has been written.
///
/// `update` is set for answers produced by a task, i.e., for queries that
/// counted as in flight. Returns whether the connection is being read from
/// afterwards.
pub fn finish_reply(
    ctx: &WorkerContext,
    conn: &Rc<TcpConnection>,
    had_error: bool,
    update: bool,
) -> bool {
    let config = ctx.config();
    let (in_flight, answered) = {
        let mut state = conn.state_mut();
        if update {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        if state.closed {
            return false;
        }
        state.queries_answered += 1;
        (state.in_flight, state.queries_answered)
    };
    if had_error {
        terminate(ctx, conn);
        return false;
    }

    let max_queries = config.max_tcp_queries_per_connection();
    if max_queries > 0 && answered >= max_queries {
        debug!(
            remote = %conn.remote(), answered,
            "closing connection after maximum number of queries"
        );
        terminate(ctx, conn);
        return false;
    }

    let deadline = Instant::now() + config.tcp_idle_timeout();
    let mut mplex = ctx.mplex();
    if update && in_flight + 1 == config.max_tcp_in_flight() {
        let res = mplex.add_read(
            conn.fd(),
            ConnectionContext::TcpConnection(conn.clone()),
            Some(deadline),
        );
        if let Err(err) = res {
            debug!(fd = conn.fd(), "resuming connection failed: {}", err);
            drop(mplex);
            terminate(ctx, conn);
            return false;
        }
        trace!(fd = conn.fd(), in_flight, "resuming reads");
    } else if mplex.set_deadline(conn.fd(), deadline).is_err() {
        let res = mplex.add_read(
            conn.fd(),
            ConnectionContext::TcpConnection(conn.clone()),
            Some(deadline),
        );
        if let Err(err) = res {
            debug!(fd = conn.fd(), "re-registering connection failed: {}", err);
        }
    }
    true
}

//------------ Terminating ---------------------------------------------------

/// Stops reading from a connection.
///
/// The socket closes once nothing refers to the connection any more.
pub fn terminate(ctx: &WorkerContext, conn: &TcpConnection) {
    conn.state_mut().closed = true;
    let fd = conn.fd();
    let mut mplex = ctx.mplex();
    let registered = match mplex.context(fd) {
        Some(ConnectionContext::TcpConnection(reg)) => {
            core::ptr::eq(Rc::as_ptr(&reg), conn)
        }
        _ => false,
    };
    if registered {
        if let Err(err) = mplex.remove_read(fd) {
            debug!(fd, "removing connection failed: {}", err);
        }
    }
}

/// Closes a connection that has been idle for too long.
pub fn handle_timeout(ctx: &WorkerContext, conn: &TcpConnection) {
    ctx.counters().inc(Counter::TcpTimeouts);
    debug!(remote = %conn.remote(), "TCP connection timed out");
    terminate(ctx, conn);
}
