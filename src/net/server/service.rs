//! The collaborators that answer queries.
//!
//! The network core does not resolve anything itself. For every query that
//! passes the transport level checks and is not answered from the packet
//! cache, it spawns a task on the worker's scheduler that runs the
//! [`Resolve`] engine of that worker. The engine gets the worker context so
//! it can use the upstream exchanges of [`net::client`] from within the
//! task.
//!
//! [`net::client`]: crate::net::client

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use futures_util::future::LocalBoxFuture;
use tracing::trace;

use super::proxy::ProxyValue;
use crate::base::{question_hash, set_message_id, Header, HEADER_LEN};
use crate::metrics::Counter;
use crate::worker::{WorkerContext, WorkerRef};

/// The tag all packet cache entries are stored under.
const CACHE_TAG: u32 = 0;

//------------ Transport -----------------------------------------------------

/// The transport a query was received over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    /// A datagram.
    Udp,

    /// A TCP connection.
    Tcp,
}

//------------ Request -------------------------------------------------------

/// A query handed to the engine.
#[derive(Clone, Debug)]
pub struct Request {
    /// The query message.
    pub message: Vec<u8>,

    /// The address of the client.
    ///
    /// If the query arrived through a relay using the proxy protocol, this
    /// is the address the relay reported.
    pub source: SocketAddr,

    /// The address the client sent the query to.
    pub destination: SocketAddr,

    /// The address the query actually came from.
    pub remote: SocketAddr,

    /// The transport the query arrived over.
    pub transport: Transport,

    /// The descriptor of the TCP connection, if any.
    pub tcp_fd: Option<RawFd>,

    /// When the query was received.
    pub received_at: Instant,

    /// The values of a proxy protocol header.
    pub proxy_values: Vec<ProxyValue>,
}

//------------ Answer --------------------------------------------------------

/// The response produced by the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Answer {
    /// The response message.
    pub message: Vec<u8>,

    /// How long the response may be served from the packet cache.
    ///
    /// `None` if it must not be cached at all.
    pub cache_ttl: Option<u32>,
}

//------------ Resolve -------------------------------------------------------

/// The engine that answers queries on one worker.
///
/// Returning `None` drops the query without a response.
pub trait Resolve {
    /// Answers a query.
    fn resolve(
        &self,
        worker: WorkerRef,
        request: Request,
    ) -> LocalBoxFuture<'static, Option<Answer>>;
}

impl<F> Resolve for F
where
    F: Fn(WorkerRef, Request) -> LocalBoxFuture<'static, Option<Answer>>,
{
    fn resolve(
        &self,
        worker: WorkerRef,
        request: Request,
    ) -> LocalBoxFuture<'static, Option<Answer>> {
        (self)(worker, request)
    }
}

//------------ ResolveFactory ------------------------------------------------

/// Creates the engine of each worker thread.
///
/// The factory is shared between threads while the engines it creates stay
/// on the thread they were created on.
pub trait ResolveFactory: Send + Sync {
    /// Creates the engine for the worker with the given index.
    fn make(&self, worker: usize) -> Rc<dyn Resolve>;
}

impl<F, R> ResolveFactory for F
where
    F: Fn(usize) -> R + Send + Sync,
    R: Resolve + 'static,
{
    fn make(&self, worker: usize) -> Rc<dyn Resolve> {
        Rc::new((self)(worker))
    }
}

//------------ PacketCache ---------------------------------------------------

/// A cache of complete responses shared by all threads.
pub trait PacketCache: Send + Sync {
    /// Returns a cached response for a query.
    ///
    /// The transaction ID of the returned response is replaced by that of
    /// the query before it is sent.
    fn lookup(&self, tag: u32, hash: u64, query: &[u8]) -> Option<Vec<u8>>;

    /// Stores a response.
    fn insert(
        &self,
        tag: u32,
        hash: u64,
        query: &[u8],
        response: &[u8],
        ttl: u32,
    );
}

/// A packet cache that never has anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl PacketCache for NoCache {
    fn lookup(&self, _tag: u32, _hash: u64, _query: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn insert(
        &self,
        _tag: u32,
        _hash: u64,
        _query: &[u8],
        _response: &[u8],
        _ttl: u32,
    ) {
    }
}

//------------ Helpers for the transports ------------------------------------

/// Looks up a query in the packet cache.
///
/// Returns the response with the query's transaction ID on a hit.
pub(crate) fn cache_lookup(ctx: &WorkerContext, query: &[u8]) -> Option<Vec<u8>> {
    let id = Header::from_message(query).ok()?.id();
    let hash = question_hash(ctx.hash_key(), query);
    let mut response = ctx.cache().lookup(CACHE_TAG, hash, query)?;
    if response.len() < HEADER_LEN {
        return None;
    }
    set_message_id(&mut response, id);
    ctx.counters().inc(Counter::PacketCacheHits);
    trace!(id, "answered from packet cache");
    Some(response)
}

/// Runs the engine for a request and caches the answer if allowed.
pub(crate) async fn answer(ctx: WorkerRef, request: Request) -> Option<Vec<u8>> {
    let query = request.message.clone();
    let answer = ctx.engine().resolve(ctx.clone(), request).await?;
    if let Some(ttl) = answer.cache_ttl {
        let hash = question_hash(ctx.hash_key(), &query);
        ctx.cache()
            .insert(CACHE_TAG, hash, &query, &answer.message, ttl);
    }
    Some(answer.message)
}
