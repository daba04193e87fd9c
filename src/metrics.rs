//! Process wide counters.
//!
//! All threads share one [`Counters`] value through an `Arc`. Updates use
//! relaxed atomics: the values are statistics, nothing synchronizes on them.

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

//------------ Counter -------------------------------------------------------

/// The events counted by the core.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Counter {
    /// Answers discarded because too many near misses preceded them.
    SpoofCount,

    /// Answers copied to chained waiters.
    ChainResends,

    /// Upstream answers no waiter was interested in.
    UnexpectedCount,

    /// Upstream answers that could not be parsed.
    ServerParseErrors,

    /// Client queries that could not be parsed.
    ClientParseErrors,

    /// Queries shed because the pipes to two workers were full.
    QueryPipeFullDrops,

    /// Queries moved away from their hashed worker by load balancing.
    RebalancedQueries,

    /// Queries dropped because too many tasks were running.
    OverCapacityDrops,

    /// TCP connections refused because of the per client limit.
    TcpClientOverflow,

    /// Proxy protocol headers that were invalid or too large.
    ProxyProtocolInvalid,

    /// UDP queries refused by the access list.
    UnauthorizedUdp,

    /// TCP connections or queries refused by the access list.
    UnauthorizedTcp,

    /// UDP queries that did not fit the receive buffer.
    TruncatedDrops,

    /// Queries ignored because they were responses, too short, or used an
    /// unsupported opcode.
    IgnoredCount,

    /// Queries without a question.
    EmptyQueries,

    /// Readiness events on a UDP listener that yielded no datagram.
    NoPacketError,

    /// Queries answered from the packet cache.
    PacketCacheHits,

    /// Queries received over any transport.
    Queries,

    /// Queries received over TCP.
    TcpQueries,

    /// TCP client connections closed for being idle too long.
    TcpTimeouts,

    /// Distributed queries that waited too long in a pipe.
    TooOldDrops,
}

impl Counter {
    /// All counters in reporting order.
    pub const ALL: [Counter; 21] = [
        Counter::SpoofCount,
        Counter::ChainResends,
        Counter::UnexpectedCount,
        Counter::ServerParseErrors,
        Counter::ClientParseErrors,
        Counter::QueryPipeFullDrops,
        Counter::RebalancedQueries,
        Counter::OverCapacityDrops,
        Counter::TcpClientOverflow,
        Counter::ProxyProtocolInvalid,
        Counter::UnauthorizedUdp,
        Counter::UnauthorizedTcp,
        Counter::TruncatedDrops,
        Counter::IgnoredCount,
        Counter::EmptyQueries,
        Counter::NoPacketError,
        Counter::PacketCacheHits,
        Counter::Queries,
        Counter::TcpQueries,
        Counter::TcpTimeouts,
        Counter::TooOldDrops,
    ];

    /// Returns the name used when reporting the counter.
    pub fn name(self) -> &'static str {
        match self {
            Counter::SpoofCount => "spoof-prevents",
            Counter::ChainResends => "chain-resends",
            Counter::UnexpectedCount => "unexpected-packets",
            Counter::ServerParseErrors => "server-parse-errors",
            Counter::ClientParseErrors => "client-parse-errors",
            Counter::QueryPipeFullDrops => "query-pipe-full-drops",
            Counter::RebalancedQueries => "rebalanced-queries",
            Counter::OverCapacityDrops => "over-capacity-drops",
            Counter::TcpClientOverflow => "tcp-client-overflow",
            Counter::ProxyProtocolInvalid => "proxy-protocol-invalid",
            Counter::UnauthorizedUdp => "unauthorized-udp",
            Counter::UnauthorizedTcp => "unauthorized-tcp",
            Counter::TruncatedDrops => "truncated-drops",
            Counter::IgnoredCount => "ignored-packets",
            Counter::EmptyQueries => "empty-queries",
            Counter::NoPacketError => "no-packet-error",
            Counter::PacketCacheHits => "packetcache-hits",
            Counter::Queries => "questions",
            Counter::TcpQueries => "tcp-questions",
            Counter::TcpTimeouts => "tcp-client-timeouts",
            Counter::TooOldDrops => "too-old-drops",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

//--- Display

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

//------------ Counters ------------------------------------------------------

/// The counters of the whole process.
#[derive(Debug, Default)]
pub struct Counters {
    /// One slot per [`Counter`] variant.
    values: [AtomicU64; Counter::ALL.len()],

    /// The number of currently open inbound TCP connections.
    current_tcp_connections: AtomicUsize,
}

impl Counters {
    /// Creates a set of counters all at zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// Increments a counter by one.
    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1)
    }

    /// Increments a counter by `value`.
    pub fn add(&self, counter: Counter, value: u64) {
        self.values[counter.index()].fetch_add(value, Ordering::Relaxed);
    }

    /// Returns the current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.index()].load(Ordering::Relaxed)
    }

    /// Returns the name and value of every counter.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        Counter::ALL
            .iter()
            .map(|counter| (counter.name(), self.get(*counter)))
            .collect()
    }

    /// The number of currently open inbound TCP connections.
    pub fn current_tcp_connections(&self) -> usize {
        self.current_tcp_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn tcp_connection_opened(&self) {
        self.current_tcp_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tcp_connection_closed(&self) {
        self.current_tcp_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

//============ Tests =========================================================
