//! The network concurrency core of a recursive DNS resolver.
//!
//! This crate provides the machinery that moves DNS queries and responses
//! between sockets, lightweight tasks, and OS threads. It does not resolve
//! anything itself: the resolution algorithm and the packet cache are
//! supplied by the user through the traits in [net::server::service].
//!
//! # Modules
//!
//! * [sched] contains the per-thread cooperative [`Scheduler`] and the
//!   [waiter registry][sched::waiters] that matches asynchronous events to
//!   the tasks waiting for them.
//! * [net] contains the readiness [multiplexer][net::mplex], the outgoing
//!   [UDP][net::client::udp] and [TCP][net::client::tcp] exchanges, and the
//!   inbound [datagram][net::server::dgram] and [stream][net::server::stream]
//!   listeners.
//! * [worker] contains the per-thread [`WorkerContext`], the inter-thread
//!   pipes with the query distributor, and the [`Recursor`] runtime that
//!   ties everything together.
//! * [base] contains the small amount of DNS wire format parsing the core
//!   needs to route messages.
//!
//! Supporting modules: [config] holds the configuration surface, [metrics]
//! the process wide counters, and [logging] a helper to install a
//! [tracing] subscriber.
//!
//! # Threading model
//!
//! The crate runs a fixed set of OS threads. Every thread owns exactly one
//! [`WorkerContext`] which in turn owns a scheduler, a multiplexer, a pool of
//! outgoing UDP sockets, and the state of the inbound TCP connections it
//! accepted. Nothing in a context is shared with other threads. Threads only
//! talk to each other through the pipes in [worker::pipes].
//!
//! [`Scheduler`]: sched::Scheduler
//! [`WorkerContext`]: worker::WorkerContext
//! [`Recursor`]: worker::runtime::Recursor
#![cfg(unix)]
#![warn(missing_docs)]

pub mod base;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod sched;
pub mod utils;
pub mod worker;
