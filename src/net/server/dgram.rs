//! Answering queries received over UDP.
//!
//! A thread that listens on UDP reads datagrams from its listen sockets
//! whenever they become readable, checks that they look like queries from
//! an allowed client, and either answers them itself or, if it is a
//! distributor, hands them to one of the workers.
//!
//! Readiness is edge triggered, so a socket is normally read until it has
//! nothing left. To keep one busy socket from starving everything else, at
//! most `max_udp_queries_per_round` datagrams are read per event. If the
//! limit is hit, the socket is re-armed so another event is reported for
//! what is left.

use core::time::Duration;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, enabled, trace, Level};

use super::proxy::{parse_header, Parsed};
use super::service::{self, Request, Transport};
use crate::base::{question_hash, Header, HEADER_LEN};
use crate::metrics::Counter;
use crate::net::mplex::ConnectionContext;
use crate::net::util::to_pcap_text;
use crate::worker::pipes::ThreadMessage;
use crate::worker::{Role, WorkerContext, WorkerRef};

/// The largest query accepted without a proxy protocol header.
const MAX_QUERY_SIZE: usize = 512;

/// How long a distributed query may wait before it is dropped.
const MAX_QUERY_AGE: Duration = Duration::from_secs(1);

//------------ Reading -------------------------------------------------------

/// Reads datagrams from a UDP listen socket.
pub fn handle_readable(ctx: &WorkerRef, idx: usize) {
    let Some(sock) = ctx.udp_listener(idx).cloned() else {
        return;
    };
    let config = ctx.config();
    let max_len = if config.proxy_protocol_from().is_empty() {
        MAX_QUERY_SIZE
    } else {
        MAX_QUERY_SIZE + config.proxy_protocol_max_size()
    };

    // One extra octet tells an oversized datagram from one that fits.
    let mut buf = vec![0; max_len + 1];
    let mut first = true;
    for _ in 0..config.max_udp_queries_per_round() {
        let (len, remote) = match sock.recv_from(&mut buf) {
            Ok(res) => res,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                if first {
                    ctx.counters().inc(Counter::NoPacketError);
                }
                return;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                continue
            }
            Err(err) => {
                debug!(idx, "receiving query failed: {}", err);
                return;
            }
        };
        first = false;
        if len > max_len {
            ctx.counters().inc(Counter::TruncatedDrops);
            if config.log_common_errors() {
                debug!(remote = %remote, "dropping oversized query");
            }
            continue;
        }
        handle_datagram(ctx, &sock, &buf[..len], remote);
    }

    trace!(idx, "read limit reached, re-arming listener");
    let res = ctx.mplex().alter_to_read(
        sock.as_raw_fd(),
        ConnectionContext::UdpListener(idx),
        None,
    );
    if let Err(err) = res {
        debug!(idx, "re-arming UDP listener failed: {}", err);
    }
}

/// Checks a datagram and sends it on for processing.
fn handle_datagram(
    ctx: &WorkerRef,
    sock: &Arc<UdpSocket>,
    data: &[u8],
    remote: SocketAddr,
) {
    let config = ctx.config();
    let mut source = remote;
    let mut destination = match sock.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            debug!("getting listener address failed: {}", err);
            return;
        }
    };
    let mut proxy_values = Vec::new();
    let mut payload = data;

    if config.proxy_protocol_from().matches(&remote.ip()) {
        match parse_header(data) {
            Parsed::Complete(header)
                if header.consumed <= config.proxy_protocol_max_size() =>
            {
                payload = &data[header.consumed..];
                if let Some(addr) = header.source {
                    source = addr;
                }
                if let Some(addr) = header.destination {
                    destination = addr;
                }
                proxy_values = header.values;
            }
            _ => {
                ctx.counters().inc(Counter::ProxyProtocolInvalid);
                if config.log_common_errors() {
                    debug!(remote = %remote, "invalid proxy protocol header");
                }
                return;
            }
        }
    } else if data.len() > MAX_QUERY_SIZE {
        ctx.counters().inc(Counter::TruncatedDrops);
        if config.log_common_errors() {
            debug!(remote = %remote, "dropping oversized query");
        }
        return;
    }

    if payload.len() < HEADER_LEN {
        ctx.counters().inc(Counter::IgnoredCount);
        if config.log_common_errors() {
            debug!(remote = %remote, len = payload.len(), "ignoring short query");
        }
        return;
    }
    if !ctx.acl().matches(&source.ip()) {
        ctx.counters().inc(Counter::UnauthorizedUdp);
        if config.log_common_errors() {
            debug!(source = %source, "dropping query, not allowed");
        }
        return;
    }
    if remote.port() == 0 {
        ctx.counters().inc(Counter::ClientParseErrors);
        debug!(remote = %remote, "dropping query from port 0");
        return;
    }
    let header = match Header::from_message(payload) {
        Ok(header) => header,
        Err(_) => {
            ctx.counters().inc(Counter::IgnoredCount);
            return;
        }
    };
    if header.qr() {
        ctx.counters().inc(Counter::IgnoredCount);
        if config.log_common_errors() {
            debug!(remote = %remote, "ignoring answer on listen socket");
        }
        return;
    }
    if header.opcode() != 0 {
        ctx.counters().inc(Counter::IgnoredCount);
        if config.log_common_errors() {
            debug!(
                remote = %remote, opcode = header.opcode(),
                "ignoring query with unsupported opcode"
            );
        }
        return;
    }
    if header.qdcount() == 0 {
        ctx.counters().inc(Counter::EmptyQueries);
        if config.log_common_errors() {
            debug!(remote = %remote, "ignoring query without question");
        }
        return;
    }
    if enabled!(Level::TRACE) {
        trace!(
            remote = %remote,
            "received query: {}", to_pcap_text(payload, payload.len())
        );
    }

    let request = Request {
        message: payload.to_vec(),
        source,
        destination,
        remote,
        transport: Transport::Udp,
        tcp_fd: None,
        received_at: Instant::now(),
        proxy_values,
    };
    let sock = sock.clone();
    match ctx.topology() {
        Some(topology) if ctx.role() == Role::Distributor => {
            let hash = question_hash(ctx.hash_key(), &request.message);
            topology.distribute(
                ctx.role(),
                hash,
                ThreadMessage::new(move |ctx| process_query(ctx, request, sock)),
            );
        }
        _ => process_query(ctx, request, sock),
    }
}

//------------ Processing ----------------------------------------------------

/// Answers a query from the packet cache or starts a task for it.
pub fn process_query(ctx: &WorkerRef, request: Request, sock: Arc<UdpSocket>) {
    if request.received_at.elapsed() > MAX_QUERY_AGE {
        ctx.counters().inc(Counter::TooOldDrops);
        debug!(remote = %request.remote, "dropping query that waited too long");
        return;
    }
    ctx.counters().inc(Counter::Queries);

    if let Some(response) = service::cache_lookup(ctx, &request.message) {
        send_reply(&sock, &response, request.remote);
        return;
    }

    if ctx.sched().runnable_count() > ctx.config().max_tasks() {
        ctx.counters().inc(Counter::OverCapacityDrops);
        debug!(remote = %request.remote, "dropping query, over capacity");
        return;
    }

    let task_ctx = ctx.clone();
    ctx.sched().spawn(async move {
        let remote = request.remote;
        if let Some(response) = service::answer(task_ctx, request).await {
            send_reply(&sock, &response, remote);
        }
    });
}

/// Sends a response back to a client.
fn send_reply(sock: &UdpSocket, response: &[u8], remote: SocketAddr) {
    if enabled!(Level::TRACE) {
        trace!(
            remote = %remote,
            "sending answer: {}", to_pcap_text(response, response.len())
        );
    }
    if let Err(err) = sock.send_to(response, remote) {
        debug!(remote = %remote, "sending answer failed: {}", err);
    }
}
