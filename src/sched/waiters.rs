//! The registry of outstanding asynchronous operations.
//!
//! Every task suspended in [`Scheduler::wait_event`] has exactly one entry
//! here, identified by a [`WaiterId`] and described by a [`WaitKey`]. Event
//! sources find the entry they need to complete through one of two index
//! views:
//!
//! * the exact view, keyed by remote address, socket, transaction ID and
//!   question, used to match an answer to the query it belongs to, and
//! * the partial view, keyed by remote address and question only, used to
//!   find an outstanding query a new, identical query can be chained onto.
//!
//! Entries are also kept in insertion order for the full scans that look
//! for near misses.
//!
//! [`Scheduler::wait_event`]: super::Scheduler::wait_event

use core::fmt;
use core::task::Waker;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::net::client::tcp::TcpTransfer;

//------------ WaiterId ------------------------------------------------------

/// Identifies an entry in the registry.
///
/// Identifiers increase monotonically, so ordering by identifier is
/// ordering by insertion.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WaiterId(u64);

//--- Display

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

//------------ WaitKey -------------------------------------------------------

/// Describes one outstanding asynchronous operation.
///
/// The remote address, descriptors, transaction ID and question are fixed
/// once the key is registered. The chain, the closed flag, the near miss
/// counter and the TCP transfer state are updated while it waits.
#[derive(Debug, Default)]
pub struct WaitKey {
    /// The address of the peer.
    pub remote: Option<SocketAddr>,

    /// The UDP socket the answer is expected on.
    ///
    /// `None` for chained waiters which do not own a socket.
    pub fd: Option<RawFd>,

    /// The TCP socket the operation is pending on.
    pub tcp_fd: Option<RawFd>,

    /// The DNS transaction ID.
    pub id: u16,

    /// The canonical query name, empty if not relevant.
    pub qname: String,

    /// The query type, zero if not relevant.
    pub qtype: u16,

    /// Transaction IDs of identical queries waiting for the same answer.
    pub chain: BTreeSet<u16>,

    /// Whether the chain accepts no more attachments.
    pub closed: bool,

    /// Answers seen that matched everything but the transaction ID.
    pub near_misses: u32,

    /// The partial transfer of a pending TCP operation.
    pub tcp: Option<TcpTransfer>,
}

impl WaitKey {
    /// Creates the key of a query sent over its own UDP socket.
    pub fn udp(
        remote: SocketAddr,
        fd: RawFd,
        id: u16,
        qname: &str,
        qtype: u16,
    ) -> Self {
        WaitKey {
            remote: Some(remote),
            fd: Some(fd),
            id,
            qname: qname.into(),
            qtype,
            ..Default::default()
        }
    }

    /// Creates the key of a query chained onto an outstanding one.
    pub fn chained(
        remote: SocketAddr,
        id: u16,
        qname: &str,
        qtype: u16,
    ) -> Self {
        WaitKey {
            remote: Some(remote),
            id,
            qname: qname.into(),
            qtype,
            ..Default::default()
        }
    }

    /// Creates the key of a pending TCP operation.
    pub fn tcp(tcp_fd: RawFd, transfer: TcpTransfer) -> Self {
        WaitKey {
            tcp_fd: Some(tcp_fd),
            tcp: Some(transfer),
            ..Default::default()
        }
    }

    /// Returns the key of the exact index view.
    pub fn exact_key(&self) -> ExactKey {
        ExactKey {
            remote: self.remote,
            fd: self.fd,
            tcp_fd: self.tcp_fd,
            id: self.id,
            qname: self.qname.clone(),
            qtype: self.qtype,
        }
    }

    fn partial_key(&self) -> PartialKey {
        PartialKey {
            remote: self.remote,
            tcp_fd: self.tcp_fd,
            qname: self.qname.clone(),
            qtype: self.qtype,
        }
    }
}

//------------ ExactKey ------------------------------------------------------

/// The key of the exact index view.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ExactKey {
    /// The address of the peer.
    pub remote: Option<SocketAddr>,

    /// The UDP socket.
    pub fd: Option<RawFd>,

    /// The TCP socket.
    pub tcp_fd: Option<RawFd>,

    /// The DNS transaction ID.
    pub id: u16,

    /// The canonical query name.
    pub qname: String,

    /// The query type.
    pub qtype: u16,
}

//------------ PartialKey ----------------------------------------------------

/// The key of the partial index view: everything but socket and ID.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct PartialKey {
    remote: Option<SocketAddr>,
    tcp_fd: Option<RawFd>,
    qname: String,
    qtype: u16,
}

//------------ Waiter --------------------------------------------------------

/// A registered entry.
#[derive(Debug)]
pub(crate) struct Waiter {
    /// What is waited for.
    pub(crate) key: WaitKey,

    /// When the wait times out.
    pub(crate) deadline: Instant,

    /// Wakes the waiting task, set on its first poll.
    pub(crate) waker: Option<Waker>,
}

//------------ WaiterRegistry ------------------------------------------------

/// The registry of outstanding operations of one thread.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    /// The next identifier to hand out.
    next_id: u64,

    /// All entries in insertion order.
    waiters: BTreeMap<WaiterId, Waiter>,

    /// The exact index view.
    exact: HashMap<ExactKey, WaiterId>,

    /// The partial index view.
    ///
    /// Only entries owning a socket are indexed since only those can have
    /// other queries chained onto them.
    partial: HashMap<PartialKey, BTreeSet<WaiterId>>,
}

impl WaiterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a key.
    ///
    /// Fails if a key with the same exact view is registered already.
    pub(crate) fn insert(
        &mut self,
        key: WaitKey,
        deadline: Instant,
    ) -> Result<WaiterId, WaitError> {
        let exact = key.exact_key();
        if self.exact.contains_key(&exact) {
            return Err(WaitError::DuplicateKey);
        }
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.exact.insert(exact, id);
        if key.fd.is_some() {
            self.partial.entry(key.partial_key()).or_default().insert(id);
        }
        self.waiters.insert(
            id,
            Waiter {
                key,
                deadline,
                waker: None,
            },
        );
        Ok(id)
    }

    /// Removes an entry from the registry and both of its index views.
    pub(crate) fn remove(&mut self, id: WaiterId) -> Option<Waiter> {
        let waiter = self.waiters.remove(&id)?;
        self.exact.remove(&waiter.key.exact_key());
        if waiter.key.fd.is_some() {
            let partial = waiter.key.partial_key();
            if let Some(ids) = self.partial.get_mut(&partial) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.partial.remove(&partial);
                }
            }
        }
        Some(waiter)
    }

    /// Stores the waker of the task waiting on an entry.
    pub(crate) fn set_waker(&mut self, id: WaiterId, waker: &Waker) {
        if let Some(waiter) = self.waiters.get_mut(&id) {
            match waiter.waker {
                Some(ref current) if current.will_wake(waker) => {}
                _ => waiter.waker = Some(waker.clone()),
            }
        }
    }

    /// Returns the key of an entry.
    pub fn get(&self, id: WaiterId) -> Option<&WaitKey> {
        self.waiters.get(&id).map(|waiter| &waiter.key)
    }

    /// Returns the deadline of an entry.
    pub fn deadline(&self, id: WaiterId) -> Option<Instant> {
        self.waiters.get(&id).map(|waiter| waiter.deadline)
    }

    /// Looks up an entry through the exact index view.
    pub fn find_exact(&self, key: &ExactKey) -> Option<WaiterId> {
        self.exact.get(key).copied()
    }

    /// Looks up an outstanding query that an identical one can chain onto.
    ///
    /// Only entries that own a socket and whose chain is still open are
    /// considered. The oldest such entry wins.
    pub fn find_partial(
        &self,
        remote: SocketAddr,
        tcp_fd: Option<RawFd>,
        qname: &str,
        qtype: u16,
    ) -> Option<WaiterId> {
        let key = PartialKey {
            remote: Some(remote),
            tcp_fd,
            qname: qname.into(),
            qtype,
        };
        self.partial.get(&key)?.iter().copied().find(|id| {
            self.waiters
                .get(id)
                .map(|waiter| waiter.key.fd.is_some() && !waiter.key.closed)
                .unwrap_or(false)
        })
    }

    /// Looks up a query by socket, remote address and transaction ID.
    ///
    /// This is the fallback for answers that carry no question. Only
    /// entries that do have a question are considered.
    pub fn find_questionless(
        &self,
        remote: SocketAddr,
        fd: RawFd,
        id: u16,
    ) -> Option<WaiterId> {
        self.waiters.iter().find_map(|(waiter_id, waiter)| {
            let key = &waiter.key;
            (key.remote == Some(remote)
                && key.fd == Some(fd)
                && key.id == id
                && !key.qname.is_empty()
                && key.qtype != 0)
                .then_some(*waiter_id)
        })
    }

    /// Counts a near miss on every entry expecting this question.
    ///
    /// Returns the number of entries affected.
    pub fn record_near_miss(
        &mut self,
        fd: RawFd,
        remote: SocketAddr,
        qname: &str,
        qtype: u16,
    ) -> usize {
        let mut affected = 0;
        for waiter in self.waiters.values_mut() {
            let key = &mut waiter.key;
            if key.fd == Some(fd)
                && key.remote == Some(remote)
                && key.qtype == qtype
                && key.qname == qname
            {
                key.near_misses += 1;
                affected += 1;
            }
        }
        affected
    }

    /// Adds a transaction ID to the chain of an entry.
    ///
    /// Returns whether the entry exists and its chain was still open.
    pub fn attach_to_chain(&mut self, id: WaiterId, tx_id: u16) -> bool {
        match self.waiters.get_mut(&id) {
            Some(waiter) if !waiter.key.closed => {
                waiter.key.chain.insert(tx_id);
                true
            }
            _ => false,
        }
    }

    /// Closes the chain of an entry and returns its members.
    pub fn close_chain(&mut self, id: WaiterId) -> Vec<u16> {
        match self.waiters.get_mut(&id) {
            Some(waiter) => {
                waiter.key.closed = true;
                waiter.key.chain.iter().copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Returns the TCP transfer state of an entry for updating.
    pub(crate) fn transfer_mut(
        &mut self,
        id: WaiterId,
    ) -> Option<&mut TcpTransfer> {
        self.waiters
            .get_mut(&id)
            .and_then(|waiter| waiter.key.tcp.as_mut())
    }

    /// Iterates over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (WaiterId, &WaitKey)> + '_ {
        self.waiters.iter().map(|(id, waiter)| (*id, &waiter.key))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

//------------ WaitError -----------------------------------------------------

/// Registering a wait failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitError {
    /// An identical key is registered already.
    DuplicateKey,
}

//--- Display and Error

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::DuplicateKey => f.write_str("duplicate wait key"),
        }
    }
}

impl std::error::Error for WaitError {}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "192.0.2.53:53".parse().unwrap()
    }

    fn registry_with(keys: Vec<WaitKey>) -> (WaiterRegistry, Vec<WaiterId>) {
        let mut registry = WaiterRegistry::new();
        let now = Instant::now();
        let ids = keys
            .into_iter()
            .map(|key| registry.insert(key, now).unwrap())
            .collect();
        (registry, ids)
    }

    #[test]
    fn exact_lookup_needs_everything_to_match() {
        let (registry, ids) = registry_with(vec![WaitKey::udp(
            remote(),
            7,
            100,
            "example.com.",
            1,
        )]);
        let key = ExactKey {
            remote: Some(remote()),
            fd: Some(7),
            id: 100,
            qname: "example.com.".into(),
            qtype: 1,
            ..Default::default()
        };
        assert_eq!(registry.find_exact(&key), Some(ids[0]));
        assert_eq!(
            registry.find_exact(&ExactKey { id: 101, ..key.clone() }),
            None
        );
        assert_eq!(
            registry.find_exact(&ExactKey { fd: Some(8), ..key.clone() }),
            None
        );
        assert_eq!(
            registry.find_exact(&ExactKey { qtype: 28, ..key }),
            None
        );
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let (mut registry, _) = registry_with(vec![WaitKey::chained(
            remote(),
            5,
            "a.",
            1,
        )]);
        assert_eq!(
            registry.insert(
                WaitKey::chained(remote(), 5, "a.", 1),
                Instant::now()
            ),
            Err(WaitError::DuplicateKey)
        );
    }

    #[test]
    fn partial_lookup_ignores_id_and_skips_closed_and_chained() {
        let (mut registry, ids) = registry_with(vec![
            WaitKey::chained(remote(), 1, "a.", 1),
            WaitKey::udp(remote(), 7, 2, "a.", 1),
            WaitKey::udp(remote(), 8, 3, "a.", 1),
        ]);
        assert_eq!(registry.find_partial(remote(), None, "a.", 1), Some(ids[1]));
        assert!(registry.attach_to_chain(ids[1], 9));
        assert_eq!(registry.close_chain(ids[1]), vec![9]);
        assert!(!registry.attach_to_chain(ids[1], 10));
        assert_eq!(registry.find_partial(remote(), None, "a.", 1), Some(ids[2]));
        assert_eq!(registry.find_partial(remote(), None, "a.", 28), None);
    }

    #[test]
    fn remove_cleans_both_views() {
        let (mut registry, ids) =
            registry_with(vec![WaitKey::udp(remote(), 7, 2, "a.", 1)]);
        let exact = registry.get(ids[0]).unwrap().exact_key();
        assert!(registry.remove(ids[0]).is_some());
        assert!(registry.remove(ids[0]).is_none());
        assert_eq!(registry.find_exact(&exact), None);
        assert_eq!(registry.find_partial(remote(), None, "a.", 1), None);
        assert!(registry.partial.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn near_misses_hit_matching_socket_only() {
        let (mut registry, ids) = registry_with(vec![
            WaitKey::udp(remote(), 7, 2, "a.", 1),
            WaitKey::udp(remote(), 8, 3, "a.", 1),
            WaitKey::chained(remote(), 4, "a.", 1),
        ]);
        assert_eq!(registry.record_near_miss(7, remote(), "a.", 1), 1);
        assert_eq!(registry.record_near_miss(7, remote(), "b.", 1), 0);
        assert_eq!(registry.get(ids[0]).unwrap().near_misses, 1);
        assert_eq!(registry.get(ids[1]).unwrap().near_misses, 0);
        assert_eq!(registry.get(ids[2]).unwrap().near_misses, 0);
    }

    #[test]
    fn questionless_fallback_and_insertion_order() {
        let (registry, ids) = registry_with(vec![
            WaitKey::udp(remote(), 7, 2, "b.", 1),
            WaitKey::udp(remote(), 8, 3, "a.", 1),
        ]);
        assert_eq!(registry.find_questionless(remote(), 8, 3), Some(ids[1]));
        assert_eq!(registry.find_questionless(remote(), 7, 3), None);
        assert_eq!(registry.find_questionless(remote(), 8, 4), None);
        let order: Vec<_> = registry.iter().map(|(id, _)| id).collect();
        assert_eq!(order, ids);
    }
}
