use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;
use structopt::StructOpt;

use crate::config::Config;
use crate::error::Result;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "dht-sniffer",
    about = "Crawl the BitTorrent mainline DHT and print the infohashes peers announce."
)]
pub struct Opt {
    #[structopt(long = "host", value_name = "IP", default_value = "0.0.0.0", help = "Address to bind the UDP socket to.")]
    host: IpAddr,
    #[structopt(long = "port", value_name = "PORT", default_value = "6882", help = "UDP port to listen on.")]
    port: u16,
    #[structopt(
        long = "node-pool-max",
        value_name = "N",
        default_value = "500",
        help = "Number of discovered nodes kept for probing, also the probes sent per second."
    )]
    node_pool_max: usize,
    #[structopt(
        long = "rejoin-interval",
        value_name = "SECONDS",
        default_value = "3",
        help = "How often to check whether the node pool ran dry and bootstrap again."
    )]
    rejoin_interval: u64,
    #[structopt(
        long = "bootstrap",
        value_name = "HOST:PORT",
        number_of_values = 1,
        help = "Bootstrap node. May be given several times and replaces the built-in list."
    )]
    bootstrap: Vec<String>,
    #[structopt(long = "log-level", value_name = "LEVEL", default_value = "info", help = "One of off, error, warn, info, debug, trace.")]
    pub log_level: LevelFilter,
    #[structopt(long = "log-file", value_name = "PATH", parse(from_os_str), help = "Also append log output to PATH.")]
    pub log_file: Option<PathBuf>,
}

impl Opt {
    pub fn config(&self) -> Result<Config> {
        let mut config = Config {
            host: self.host,
            port: self.port,
            node_pool_max: self.node_pool_max,
            rejoin_interval: Duration::from_secs(self.rejoin_interval),
            ..Config::default()
        };

        if !self.bootstrap.is_empty() {
            config.bootstrap_nodes = self.bootstrap.clone();
        }

        config.validate()?;
        Ok(config)
    }
}
