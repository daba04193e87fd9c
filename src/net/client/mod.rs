//! Exchanging queries with upstream servers.
//!
//! The functions here are called from within tasks of a worker's
//! [`Scheduler`][crate::sched::Scheduler]. They send a query, suspend the
//! calling task until the answer arrives or the network timeout passes,
//! and return the answer or an [`Error`][error::Error].
//!
//! * [`udp`] sends each query from its own connected socket bound to a
//!   random source port. Identical outstanding queries to the same server
//!   are chained onto the first one and share its answer. Answers that
//!   match a query in everything but the transaction ID are counted as
//!   near misses and too many of them reject the answer as spoofed.
//! * [`tcp`] moves bytes over an established connection, attempting each
//!   operation right away and suspending only if the socket is not ready.
//!
//! The socket readiness that completes the waits is dispatched by the
//! worker run loop to [`udp::handle_response`] and [`tcp::handle_io`].

pub mod error;
pub mod tcp;
pub mod udp;
