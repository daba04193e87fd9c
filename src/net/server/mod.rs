//! Answering queries from clients.
//!
//! Queries arrive over UDP and TCP on the listen sockets configured via
//! [`Config::set_listen`]. Each passes a number of sanity and access checks
//! before it is handed to the engine supplied by the application.
//!
//! # Architecture
//!
//! ```text
//!    --> listen socket          - dgram: one datagram, stream: one frame
//!       --> checks              - size, proxy header, access list, header
//!          --> packet cache     - a hit is answered right away
//!             --> task          - runs the engine on the worker
//!          <-- response         - written back over the same transport
//! ```
//!
//! * [`dgram`] reads datagrams and, on distributor threads, hands queries
//!   to the workers via the [`Topology`].
//! * [`stream`] accepts TCP connections and reads queries from them. The
//!   per connection state lives in [`connection`].
//! * [`proxy`] parses the proxy protocol headers relays may put in front of
//!   queries, [`acl`] decides which clients may query at all.
//! * [`service`] defines the interface to the engine and the packet cache.
//!
//! [`Config::set_listen`]: crate::config::Config::set_listen
//! [`Topology`]: crate::worker::pipes::Topology

pub mod acl;
pub mod connection;
pub mod dgram;
pub mod proxy;
pub mod service;
pub mod stream;
