//! Configuration of the network core.
//!
//! The core does not read configuration files or command lines. A
//! [`Config`] is assembled by the embedding application and handed to
//! [`Recursor::start`]. Every numeric setting is trimmed into a sane range
//! by its setter, so a `Config` can never hold a value the core cannot work
//! with. Settings that only make sense in combination are checked by
//! [`Config::validate`].
//!
//! The defaults follow those of widely deployed recursors.
//!
//! [`Recursor::start`]: crate::worker::runtime::Recursor::start

use core::fmt;
use core::time::Duration;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::net::server::acl::NetmaskGroup;
use crate::utils::config::DefMinMax;

/// Limit on the time to wait for an answer from an upstream server.
///
/// The value has to be between 1 millisecond and 1 hour with a default of
/// 1.5 seconds.
const NETWORK_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(1500),
    Duration::from_millis(1),
    Duration::from_secs(60 * 60),
);

/// Limit on the number of simultaneous tasks per thread.
const MAX_TASKS: DefMinMax<usize> = DefMinMax::new(2048, 1, 1 << 20);

/// The number of near misses tolerated before an answer counts as spoofed.
///
/// Zero disables the check.
const SPOOF_NEARMISS_MAX: DefMinMax<u32> = DefMinMax::new(1, 0, u32::MAX);

/// Limit on the number of queries in flight on a single TCP connection.
const MAX_TCP_IN_FLIGHT: DefMinMax<usize> = DefMinMax::new(10, 1, 1024);

/// Limit on concurrent TCP connections from one client address.
///
/// Zero means unlimited.
const MAX_TCP_PER_CLIENT: DefMinMax<usize> = DefMinMax::new(0, 0, 1 << 20);

/// Limit on the number of queries answered on one TCP connection.
///
/// Zero means unlimited.
const MAX_TCP_QUERIES_PER_CONNECTION: DefMinMax<u64> =
    DefMinMax::new(0, 0, u64::MAX);

/// Limit on the amount of time a TCP client may stay idle.
const TCP_IDLE_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(2),
    Duration::from_millis(1),
    Duration::from_secs(24 * 60 * 60),
);

/// Limit on the number of concurrent TCP connections of the whole process.
const MAX_TCP_CLIENTS: DefMinMax<usize> = DefMinMax::new(128, 1, 1 << 20);

/// The number of worker threads.
const NUM_WORKERS: DefMinMax<usize> = DefMinMax::new(2, 1, 1024);

/// The number of distributor threads. Zero lets workers listen themselves.
const NUM_DISTRIBUTORS: DefMinMax<usize> = DefMinMax::new(0, 0, 1024);

/// The load balancing factor of the distributor. Zero disables balancing.
const LOAD_BALANCING_FACTOR: DefMinMax<f64> = DefMinMax::new(0.0, 0.0, 100.0);

/// Capacity of each inter-thread query pipe in messages.
const DISTRIBUTION_PIPE_CAPACITY: DefMinMax<usize> =
    DefMinMax::new(1024, 1, 1 << 20);

/// Limit on datagrams read from one UDP socket per readiness event.
const MAX_UDP_QUERIES_PER_ROUND: DefMinMax<usize> =
    DefMinMax::new(10_000, 1, 1_000_000);

/// Limit on the size of a proxy protocol header.
///
/// The smallest possible header is 16 octets long.
const PROXY_PROTOCOL_MAX_SIZE: DefMinMax<usize> =
    DefMinMax::new(512, 16, 65_535);

/// The lowest UDP source port used for outgoing queries by default.
const DEFAULT_MIN_SOURCE_PORT: u16 = 1025;

/// The networks allowed to query the resolver by default.
const DEFAULT_ALLOW_FROM: &str = "127.0.0.0/8, 10.0.0.0/8, 100.64.0.0/10, \
    169.254.0.0/16, 192.168.0.0/16, 172.16.0.0/12, ::1/128, fc00::/7, \
    fe80::/10";

//------------ Config --------------------------------------------------------

/// Configuration for the network core.
#[derive(Clone, Debug)]
pub struct Config {
    /// The addresses to listen on for both UDP and TCP.
    listen: Vec<SocketAddr>,

    /// The local addresses outgoing queries are sent from.
    query_local_addresses: Vec<IpAddr>,

    /// The range of UDP source ports for outgoing queries.
    udp_source_ports: (u16, u16),

    /// UDP source ports never used for outgoing queries.
    udp_source_port_avoid: HashSet<u16>,

    /// Limit on the time to wait for an upstream answer.
    network_timeout: Duration,

    /// Limit on the number of simultaneous tasks per thread.
    max_tasks: usize,

    /// The near miss threshold for spoofing detection.
    spoof_nearmiss_max: u32,

    /// Limit on queries in flight per TCP connection.
    max_tcp_in_flight: usize,

    /// Limit on TCP connections per client address.
    max_tcp_per_client: usize,

    /// Limit on queries answered per TCP connection.
    max_tcp_queries_per_connection: u64,

    /// Limit on the idle time of a TCP client.
    tcp_idle_timeout: Duration,

    /// Limit on concurrent TCP connections of the process.
    max_tcp_clients: usize,

    /// The number of worker threads.
    num_workers: usize,

    /// The number of distributor threads.
    num_distributors: usize,

    /// The load balancing factor.
    load_balancing_factor: f64,

    /// Capacity of the inter-thread query pipes.
    distribution_pipe_capacity: usize,

    /// Limit on datagrams read per UDP readiness event.
    max_udp_queries_per_round: usize,

    /// Clients allowed to query.
    allow_from: NetmaskGroup,

    /// Clients expected to send a proxy protocol header.
    proxy_protocol_from: NetmaskGroup,

    /// Limit on the size of a proxy protocol header.
    proxy_protocol_max_size: usize,

    /// Whether to log errors that are commonly caused by broken peers.
    log_common_errors: bool,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the listen addresses.
    pub fn listen(&self) -> &[SocketAddr] {
        &self.listen
    }

    /// Sets the addresses to listen on for both UDP and TCP.
    ///
    /// Port zero picks an ephemeral port, separately for UDP and TCP.
    pub fn set_listen(&mut self, value: Vec<SocketAddr>) {
        self.listen = value;
    }

    /// Returns the local addresses outgoing queries are sent from.
    pub fn query_local_addresses(&self) -> &[IpAddr] {
        &self.query_local_addresses
    }

    /// Sets the local addresses outgoing queries are sent from.
    ///
    /// For every outgoing query one address of the matching family is
    /// picked at random. If there is none, the unspecified address of the
    /// family is used.
    pub fn set_query_local_addresses(&mut self, value: Vec<IpAddr>) {
        self.query_local_addresses = value;
    }

    /// Returns a query local address for the family of `remote`.
    pub(crate) fn query_local_address_for(
        &self,
        remote: &SocketAddr,
        pick: usize,
    ) -> IpAddr {
        let candidates: Vec<_> = self
            .query_local_addresses
            .iter()
            .filter(|addr| addr.is_ipv4() == remote.is_ipv4())
            .collect();
        match candidates.len() {
            0 if remote.is_ipv4() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            0 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            len => *candidates[pick % len],
        }
    }

    /// Returns the inclusive range of UDP source ports.
    pub fn udp_source_ports(&self) -> (u16, u16) {
        self.udp_source_ports
    }

    /// Sets the inclusive range of UDP source ports for outgoing queries.
    ///
    /// Port zero is not a valid source port and is moved up to one.
    pub fn set_udp_source_ports(&mut self, min: u16, max: u16) {
        self.udp_source_ports = (min.max(1), max.max(1));
    }

    /// Returns the UDP source ports that are never used.
    pub fn udp_source_port_avoid(&self) -> &HashSet<u16> {
        &self.udp_source_port_avoid
    }

    /// Sets the UDP source ports that are never used.
    pub fn set_udp_source_port_avoid(&mut self, value: HashSet<u16>) {
        self.udp_source_port_avoid = value;
    }

    /// Returns the limit on the time to wait for an upstream answer.
    pub fn network_timeout(&self) -> Duration {
        self.network_timeout
    }

    /// Sets the limit on the time to wait for an upstream answer.
    ///
    /// The value has to be between 1 millisecond and 1 hour with a default
    /// of 1.5 seconds.
    pub fn set_network_timeout(&mut self, value: Duration) {
        self.network_timeout = NETWORK_TIMEOUT.limit(value);
    }

    /// Returns the limit on the number of simultaneous tasks per thread.
    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Sets the limit on the number of simultaneous tasks per thread.
    ///
    /// Queries arriving while the limit is exceeded are dropped. The
    /// default is 2048.
    pub fn set_max_tasks(&mut self, value: usize) {
        self.max_tasks = MAX_TASKS.limit(value);
    }

    /// Returns the near miss threshold for spoofing detection.
    pub fn spoof_nearmiss_max(&self) -> u32 {
        self.spoof_nearmiss_max
    }

    /// Sets the near miss threshold for spoofing detection.
    ///
    /// An answer is considered spoofed if more than this many answers with a
    /// wrong message ID arrived before it. Zero disables the check. The
    /// default is 1.
    pub fn set_spoof_nearmiss_max(&mut self, value: u32) {
        self.spoof_nearmiss_max = SPOOF_NEARMISS_MAX.limit(value);
    }

    /// Returns the limit on queries in flight per TCP connection.
    pub fn max_tcp_in_flight(&self) -> usize {
        self.max_tcp_in_flight
    }

    /// Sets the limit on queries in flight per TCP connection.
    ///
    /// While the limit is reached, no further queries are read from the
    /// connection. The value has to be between 1 and 1024 with a default of
    /// 10.
    pub fn set_max_tcp_in_flight(&mut self, value: usize) {
        self.max_tcp_in_flight = MAX_TCP_IN_FLIGHT.limit(value);
    }

    /// Returns the limit on TCP connections per client address.
    pub fn max_tcp_per_client(&self) -> usize {
        self.max_tcp_per_client
    }

    /// Sets the limit on TCP connections per client address.
    ///
    /// Zero, the default, means unlimited.
    pub fn set_max_tcp_per_client(&mut self, value: usize) {
        self.max_tcp_per_client = MAX_TCP_PER_CLIENT.limit(value);
    }

    /// Returns the limit on queries answered per TCP connection.
    pub fn max_tcp_queries_per_connection(&self) -> u64 {
        self.max_tcp_queries_per_connection
    }

    /// Sets the limit on queries answered per TCP connection.
    ///
    /// Once reached, the connection is no longer read from and closes after
    /// the last answer was written. Zero, the default, means unlimited.
    pub fn set_max_tcp_queries_per_connection(&mut self, value: u64) {
        self.max_tcp_queries_per_connection =
            MAX_TCP_QUERIES_PER_CONNECTION.limit(value);
    }

    /// Returns the limit on the idle time of a TCP client.
    pub fn tcp_idle_timeout(&self) -> Duration {
        self.tcp_idle_timeout
    }

    /// Sets the limit on the idle time of a TCP client.
    ///
    /// The value has to be between 1 millisecond and one day with a default
    /// of 2 seconds.
    pub fn set_tcp_idle_timeout(&mut self, value: Duration) {
        self.tcp_idle_timeout = TCP_IDLE_TIMEOUT.limit(value);
    }

    /// Returns the limit on concurrent TCP connections of the process.
    pub fn max_tcp_clients(&self) -> usize {
        self.max_tcp_clients
    }

    /// Sets the limit on concurrent TCP connections of the process.
    ///
    /// While the limit is exceeded, new connections are not accepted. The
    /// default is 128.
    pub fn set_max_tcp_clients(&mut self, value: usize) {
        self.max_tcp_clients = MAX_TCP_CLIENTS.limit(value);
    }

    /// Returns the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Sets the number of worker threads.
    pub fn set_num_workers(&mut self, value: usize) {
        self.num_workers = NUM_WORKERS.limit(value);
    }

    /// Returns the number of distributor threads.
    pub fn num_distributors(&self) -> usize {
        self.num_distributors
    }

    /// Sets the number of distributor threads.
    ///
    /// With zero distributors, the default, every worker reads from the UDP
    /// listen sockets itself. Otherwise only the distributors do and hand
    /// the queries to the workers.
    pub fn set_num_distributors(&mut self, value: usize) {
        self.num_distributors = NUM_DISTRIBUTORS.limit(value);
    }

    /// Returns the load balancing factor.
    pub fn load_balancing_factor(&self) -> f64 {
        self.load_balancing_factor
    }

    /// Sets the load balancing factor of the distributor.
    ///
    /// If non-zero, a query whose hashed worker is loaded more than this
    /// factor times the average load is sent to the next worker that is
    /// not. Values below 1.0 cannot work and disable balancing.
    pub fn set_load_balancing_factor(&mut self, value: f64) {
        let value = LOAD_BALANCING_FACTOR.limit(value);
        self.load_balancing_factor = if value < 1.0 { 0.0 } else { value };
    }

    /// Returns the capacity of the inter-thread query pipes.
    pub fn distribution_pipe_capacity(&self) -> usize {
        self.distribution_pipe_capacity
    }

    /// Sets the capacity of the inter-thread query pipes in messages.
    pub fn set_distribution_pipe_capacity(&mut self, value: usize) {
        self.distribution_pipe_capacity =
            DISTRIBUTION_PIPE_CAPACITY.limit(value);
    }

    /// Returns the limit on datagrams read per UDP readiness event.
    pub fn max_udp_queries_per_round(&self) -> usize {
        self.max_udp_queries_per_round
    }

    /// Sets the limit on datagrams read per UDP readiness event.
    ///
    /// This keeps one busy socket from starving all others.
    pub fn set_max_udp_queries_per_round(&mut self, value: usize) {
        self.max_udp_queries_per_round = MAX_UDP_QUERIES_PER_ROUND.limit(value);
    }

    /// Returns the clients allowed to query.
    pub fn allow_from(&self) -> &NetmaskGroup {
        &self.allow_from
    }

    /// Sets the clients allowed to query.
    pub fn set_allow_from(&mut self, value: NetmaskGroup) {
        self.allow_from = value;
    }

    /// Returns the clients expected to send a proxy protocol header.
    pub fn proxy_protocol_from(&self) -> &NetmaskGroup {
        &self.proxy_protocol_from
    }

    /// Sets the clients expected to send a proxy protocol header.
    ///
    /// Empty by default.
    pub fn set_proxy_protocol_from(&mut self, value: NetmaskGroup) {
        self.proxy_protocol_from = value;
    }

    /// Returns the limit on the size of a proxy protocol header.
    pub fn proxy_protocol_max_size(&self) -> usize {
        self.proxy_protocol_max_size
    }

    /// Sets the limit on the size of a proxy protocol header.
    pub fn set_proxy_protocol_max_size(&mut self, value: usize) {
        self.proxy_protocol_max_size = PROXY_PROTOCOL_MAX_SIZE.limit(value);
    }

    /// Returns whether errors commonly caused by broken peers are logged.
    pub fn log_common_errors(&self) -> bool {
        self.log_common_errors
    }

    /// Sets whether errors commonly caused by broken peers are logged.
    pub fn set_log_common_errors(&mut self, value: bool) {
        self.log_common_errors = value;
    }

    /// Checks that the settings can work together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::NoListenAddresses);
        }
        if self.query_local_addresses.is_empty() {
            return Err(ConfigError::NoQueryLocalAddresses);
        }
        let (min, max) = self.udp_source_ports;
        if min > max {
            return Err(ConfigError::EmptyPortRange);
        }
        if (min..=max).all(|port| self.udp_source_port_avoid.contains(&port))
        {
            return Err(ConfigError::AllPortsAvoided);
        }
        Ok(())
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 53)],
            query_local_addresses: vec![
                Ipv4Addr::UNSPECIFIED.into(),
                Ipv6Addr::UNSPECIFIED.into(),
            ],
            udp_source_ports: (DEFAULT_MIN_SOURCE_PORT, u16::MAX),
            udp_source_port_avoid: HashSet::new(),
            network_timeout: NETWORK_TIMEOUT.default(),
            max_tasks: MAX_TASKS.default(),
            spoof_nearmiss_max: SPOOF_NEARMISS_MAX.default(),
            max_tcp_in_flight: MAX_TCP_IN_FLIGHT.default(),
            max_tcp_per_client: MAX_TCP_PER_CLIENT.default(),
            max_tcp_queries_per_connection: MAX_TCP_QUERIES_PER_CONNECTION
                .default(),
            tcp_idle_timeout: TCP_IDLE_TIMEOUT.default(),
            max_tcp_clients: MAX_TCP_CLIENTS.default(),
            num_workers: NUM_WORKERS.default(),
            num_distributors: NUM_DISTRIBUTORS.default(),
            load_balancing_factor: LOAD_BALANCING_FACTOR.default(),
            distribution_pipe_capacity: DISTRIBUTION_PIPE_CAPACITY.default(),
            max_udp_queries_per_round: MAX_UDP_QUERIES_PER_ROUND.default(),
            allow_from: DEFAULT_ALLOW_FROM
                .parse()
                .unwrap_or_else(|_| NetmaskGroup::new()),
            proxy_protocol_from: NetmaskGroup::new(),
            proxy_protocol_max_size: PROXY_PROTOCOL_MAX_SIZE.default(),
            log_common_errors: true,
        }
    }
}

//------------ ConfigError ---------------------------------------------------

/// Settings that cannot work together.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// There is nothing to listen on.
    NoListenAddresses,

    /// There is no address to send outgoing queries from.
    NoQueryLocalAddresses,

    /// The lower bound of the source port range exceeds the upper bound.
    EmptyPortRange,

    /// Every port of the source port range is avoided.
    AllPortsAvoided,
}

//--- Display and Error

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::NoListenAddresses => {
                write!(f, "no listen addresses configured")
            }
            ConfigError::NoQueryLocalAddresses => {
                write!(f, "no query local addresses configured")
            }
            ConfigError::EmptyPortRange => {
                write!(f, "empty UDP source port range")
            }
            ConfigError::AllPortsAvoided => {
                write!(f, "all UDP source ports are avoided")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.network_timeout(), Duration::from_millis(1500));
        assert_eq!(config.max_tasks(), 2048);
        assert_eq!(config.spoof_nearmiss_max(), 1);
        assert_eq!(config.max_tcp_in_flight(), 10);
        assert_eq!(config.tcp_idle_timeout(), Duration::from_secs(2));
        assert_eq!(config.udp_source_ports(), (1025, 65535));
        assert!(config.allow_from().matches(&"127.0.0.1".parse().unwrap()));
        assert!(!config.allow_from().matches(&"192.0.2.1".parse().unwrap()));
        assert!(config.proxy_protocol_from().is_empty());
    }

    #[test]
    fn setters_clamp() {
        let mut config = Config::new();
        config.set_max_tcp_in_flight(0);
        assert_eq!(config.max_tcp_in_flight(), 1);
        config.set_num_workers(0);
        assert_eq!(config.num_workers(), 1);
        config.set_proxy_protocol_max_size(3);
        assert_eq!(config.proxy_protocol_max_size(), 16);
        config.set_network_timeout(Duration::ZERO);
        assert_eq!(config.network_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn small_balancing_factor_disables_balancing() {
        let mut config = Config::new();
        config.set_load_balancing_factor(0.5);
        assert_eq!(config.load_balancing_factor(), 0.0);
        config.set_load_balancing_factor(1.25);
        assert_eq!(config.load_balancing_factor(), 1.25);
        config.set_load_balancing_factor(f64::NAN);
        assert_eq!(config.load_balancing_factor(), 0.0);
    }

    #[test]
    fn validate_rejects_unusable_port_ranges() {
        let mut config = Config::new();
        config.set_udp_source_ports(2000, 1000);
        assert_eq!(config.validate(), Err(ConfigError::EmptyPortRange));

        config.set_udp_source_ports(5000, 5002);
        config.set_udp_source_port_avoid([5000, 5001, 5002].into());
        assert_eq!(config.validate(), Err(ConfigError::AllPortsAvoided));

        config.set_udp_source_port_avoid([5001].into());
        assert_eq!(config.validate(), Ok(()));

        config.set_listen(Vec::new());
        assert_eq!(config.validate(), Err(ConfigError::NoListenAddresses));
    }

    #[test]
    fn query_local_address_follows_family() {
        let mut config = Config::new();
        config.set_query_local_addresses(vec!["192.0.2.1".parse().unwrap()]);
        let v4: SocketAddr = "198.51.100.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(
            config.query_local_address_for(&v4, 7),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            config.query_local_address_for(&v6, 7),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        );
    }
}
