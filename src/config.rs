use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::dht::ID_LENGTH;

pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

pub const DEFAULT_PORT: u16 = 6882;
pub const DEFAULT_NODE_POOL_MAX: usize = 500;
pub const REJOIN_INTERVAL: Duration = Duration::from_secs(3);
pub const TRANSACTION_ID_LENGTH: usize = 2;
pub const TOKEN_LENGTH: usize = 2;

#[derive(Clone, Debug)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Capacity of the node pool, also the number of `find_node` probes sent per second.
    pub node_pool_max: usize,
    pub rejoin_interval: Duration,
    pub transaction_id_length: usize,
    pub token_length: usize,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            node_pool_max: DEFAULT_NODE_POOL_MAX,
            rejoin_interval: REJOIN_INTERVAL,
            transaction_id_length: TRANSACTION_ID_LENGTH,
            token_length: TOKEN_LENGTH,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|&node| node.to_owned()).collect(),
        }
    }
}

impl Config {
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Delay between two drain iterations.
    pub fn pace(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.node_pool_max as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_pool_max == 0 {
            return Err(Error::InvalidConfig("node pool capacity must be at least 1".to_owned()));
        }
        if self.transaction_id_length == 0 {
            return Err(Error::InvalidConfig("transaction id length must be at least 1".to_owned()));
        }
        if !(1..=ID_LENGTH).contains(&self.token_length) {
            return Err(Error::InvalidConfig(format!("token length must be within 1..={}", ID_LENGTH)));
        }
        if self.rejoin_interval.is_zero() {
            return Err(Error::InvalidConfig("rejoin interval must not be zero".to_owned()));
        }
        if self.bootstrap_nodes.is_empty() {
            return Err(Error::InvalidConfig("at least one bootstrap node is required".to_owned()));
        }
        Ok(())
    }
}
