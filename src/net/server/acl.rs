//! Access control by source address.

use core::fmt;
use core::str::FromStr;

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;

//------------ NetmaskGroup --------------------------------------------------

/// A set of networks an address can be checked against.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetmaskGroup {
    nets: Vec<IpNet>,
}

impl NetmaskGroup {
    /// Creates an empty group that matches nothing.
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a network to the group.
    pub fn add(&mut self, net: IpNet) {
        self.nets.push(net.trunc());
    }

    /// Returns whether an address falls into any network of the group.
    ///
    /// IPv4-mapped IPv6 addresses are matched as IPv4 addresses.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.nets.iter().any(|net| net.contains(&addr))
    }

    /// Returns whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Returns the networks of the group.
    pub fn nets(&self) -> &[IpNet] {
        &self.nets
    }
}

//--- FromStr

impl FromStr for NetmaskGroup {
    type Err = AclError;

    /// Parses a comma separated list of networks or single addresses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut res = NetmaskGroup::new();
        for item in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let net = match item.parse::<IpNet>() {
                Ok(net) => net,
                Err(_) => item
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|_| AclError(item.into()))?,
            };
            res.add(net);
        }
        Ok(res)
    }
}

//--- Display

impl fmt::Display for NetmaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, net) in self.nets.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", net)?;
        }
        Ok(())
    }
}

//------------ SharedAcl -----------------------------------------------------

/// An access list all threads read and the controlling thread can replace.
#[derive(Clone, Debug)]
pub struct SharedAcl {
    inner: Arc<ArcSwap<NetmaskGroup>>,
}

impl SharedAcl {
    /// Creates a shared list with initial content.
    pub fn new(group: NetmaskGroup) -> Self {
        SharedAcl {
            inner: Arc::new(ArcSwap::from_pointee(group)),
        }
    }

    /// Returns whether an address is allowed by the current list.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        self.inner.load().matches(addr)
    }

    /// Replaces the list.
    pub fn store(&self, group: NetmaskGroup) {
        self.inner.store(Arc::new(group));
    }

    /// Returns the current list.
    pub fn load(&self) -> Arc<NetmaskGroup> {
        self.inner.load_full()
    }
}

//------------ AclError ------------------------------------------------------

/// A network in a list could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AclError(String);

impl fmt::Display for AclError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid network '{}'", self.0)
    }
}

impl std::error::Error for AclError {}

//============ Tests =========================================================
