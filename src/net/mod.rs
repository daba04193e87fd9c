//! Sending and receiving DNS messages.
//!
//! This module provides the socket level machinery of the core:
//!
//! * [mplex] is the readiness multiplexer every thread waits on,
//! * [client] sends queries to upstream servers over UDP and TCP and
//!   matches the answers to the tasks waiting for them, and
//! * [server] accepts queries from clients over UDP and TCP and writes the
//!   answers back.
//!
//! All of it is driven by the run loop of a [`WorkerContext`].
//!
//! [`WorkerContext`]: crate::worker::WorkerContext

pub mod client;
pub mod mplex;
pub mod server;

mod util;
