use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};

use super::transport::{Transport, UdpTransport};
use super::Crawler;
use crate::error::Result;

/// Stops every loop started by [`Crawler::start`] once triggered or dropped.
pub struct Shutdown {
    trigger: Option<Sender<()>>,
    signal: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Shutdown { trigger: Some(trigger), signal }
    }

    pub fn signal(&self) -> Receiver<()> {
        self.signal.clone()
    }

    pub fn trigger(&mut self) {
        // receivers observe the disconnect
        self.trigger.take();
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

/// Reports its thread's name on drop, which also covers unwinding out of a panic.
struct ExitNotice {
    name: &'static str,
    exited: Sender<&'static str>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.exited.send(self.name);
    }
}

pub struct Workers {
    handles: Vec<JoinHandle<()>>,
    /// Yields the name of every loop that has stopped running.
    pub exited: Receiver<&'static str>,
}

impl Workers {
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

fn spawn_worker(name: &'static str, exited: &Sender<&'static str>, work: impl FnOnce() + Send + 'static) -> io::Result<JoinHandle<()>> {
    let notice = ExitNotice { name, exited: exited.clone() };
    thread::Builder::new().name(name.to_owned()).spawn(move || {
        let _notice = notice;
        work();
    })
}

impl Crawler<UdpTransport> {
    /// Starts receiving, joins the DHT and spawns the rejoin and drain loops.
    pub fn start(self: &Arc<Self>, shutdown: &Shutdown) -> Result<Workers> {
        let (exit_notices, exited) = unbounded();
        let mut handles = Vec::with_capacity(3);

        let crawler = Arc::clone(self);
        let signal = shutdown.signal();
        handles.push(spawn_worker("receive", &exit_notices, move || {
            let result = crawler.transport.receive_loop(&signal, |buf, from| crawler.recv_message(buf, from));
            if let Err(e) = result {
                error!("receive loop failed: {}", e);
            }
        })?);

        self.join_dht();

        let crawler = Arc::clone(self);
        let signal = shutdown.signal();
        handles.push(spawn_worker("rejoin", &exit_notices, move || crawler.rejoin_loop(&signal))?);

        let crawler = Arc::clone(self);
        let signal = shutdown.signal();
        handles.push(spawn_worker("drain", &exit_notices, move || crawler.drain_loop(&signal))?);

        Ok(Workers { handles, exited })
    }
}

impl<T: Transport> Crawler<T> {
    /// Sends an unbiased `find_node` to every bootstrap node.
    pub fn join_dht(&self) {
        for node in &self.config.bootstrap_nodes {
            match self.resolve(node) {
                Some(addr) => self.send_find_node(addr, None),
                None => warn!("could not resolve bootstrap node {}", node),
            }
        }
    }

    fn resolve(&self, node: &str) -> Option<SocketAddr> {
        let addrs = match node.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("resolving {} failed: {}", node, e);
                return None;
            }
        };
        let family_matches = |addr: &SocketAddr| addr.is_ipv4() == self.config.host.is_ipv4();
        addrs.into_iter().find(family_matches)
    }

    /// Rejoins when the pool ran dry. Returns whether it did.
    pub fn rejoin_if_empty(&self) -> bool {
        if !self.pool.is_empty() {
            trace!("node pool holds {} contacts", self.pool.len());
            return false;
        }
        debug!("node pool empty, rejoining");
        self.join_dht();
        true
    }

    /// Probes the oldest pooled contact, posing as its neighbor. Returns false on an empty pool.
    pub fn drain_once(&self) -> bool {
        match self.pool.pop_front() {
            Some(contact) => {
                self.send_find_node(contact.address, Some(contact.id));
                true
            }
            None => false,
        }
    }

    pub fn rejoin_loop(&self, shutdown: &Receiver<()>) {
        let interval = self.config.rejoin_interval;
        loop {
            select! {
                recv(shutdown) -> _ => break,
                default(interval) => {
                    self.rejoin_if_empty();
                }
            }
        }
        info!("rejoin loop stopped");
    }

    /// Sends at most `node_pool_max` probes per second, sleeping whether or not there was work.
    pub fn drain_loop(&self, shutdown: &Receiver<()>) {
        let pace = self.config.pace();
        loop {
            self.drain_once();
            select! {
                recv(shutdown) -> _ => break,
                default(pace) => {}
            }
        }
        info!("drain loop stopped");
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use serde_bencode::value::Value;

    use crossbeam_channel::unbounded;

    use super::Shutdown;
    use crate::config::Config;
    use crate::dht::message::{Message, MessageType, QueryType};
    use crate::dht::test::{compact_node, crawler, response};
    use crate::dht::{Crawler, Id};

    #[test]
    fn test_response_to_probe() {
        let (crawler, _) = crawler();
        let node_id = Id([0x42; 20]);
        let nodes = compact_node(node_id, [5, 6, 7, 8], 6969);
        let raw = response(b"aa", vec![("id", Value::Bytes(vec![1; 20])), ("nodes", Value::Bytes(nodes))]);

        crawler.recv_message(&raw, "67.215.246.10:6881".parse().unwrap());
        assert_eq!(crawler.pool.len(), 1);

        assert!(crawler.drain_once());
        assert!(crawler.pool.is_empty());
        assert!(!crawler.drain_once());

        let sent = crawler.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "5.6.7.8:6969".parse::<std::net::SocketAddr>().unwrap());

        let probe = serde_bencoded::from_bytes::<Message>(&sent[0].0).unwrap();
        assert_eq!(probe.message_type, MessageType::Request);
        assert_eq!(probe.query_type, QueryType::FindNode);
        assert_eq!(probe.transaction_id.map(|t| t.len()), Some(2));
        let args = probe.request.unwrap();
        assert_eq!(args.id.map(|i| i.as_ref()), Some(crawler.id().near(&node_id).as_bytes()));
        assert_eq!(args.target.map(|t| t.len()), Some(20));
    }

    #[test]
    fn test_join_uses_own_id() {
        let (crawler, _) = crawler();
        crawler.join_dht();

        let sent = crawler.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "127.0.0.1:6881".parse::<std::net::SocketAddr>().unwrap());

        let probe = serde_bencoded::from_bytes::<Message>(&sent[0].0).unwrap();
        assert_eq!(probe.query_type, QueryType::FindNode);
        assert_eq!(probe.request.unwrap().id.map(|i| i.as_ref()), Some(crawler.id().as_bytes()));
    }

    #[test]
    fn test_rejoin_only_when_empty() {
        let (crawler, _) = crawler();
        let nodes = compact_node(Id([0x42; 20]), [5, 6, 7, 8], 6969);
        crawler.recv_message(&response(b"aa", vec![("nodes", Value::Bytes(nodes))]), "67.215.246.10:6881".parse().unwrap());

        assert!(!crawler.rejoin_if_empty());
        assert!(crawler.transport.sent().is_empty());

        crawler.drain_once();
        assert!(crawler.rejoin_if_empty());
        assert_eq!(crawler.transport.sent().len(), 2);
    }

    #[test]
    fn test_loops_stop_on_shutdown() {
        let (crawler, _) = crawler();
        let crawler = Arc::new(crawler);
        let mut shutdown = Shutdown::new();

        let drain = {
            let crawler = Arc::clone(&crawler);
            let signal = shutdown.signal();
            thread::spawn(move || crawler.drain_loop(&signal))
        };
        let rejoin = {
            let crawler = Arc::clone(&crawler);
            let signal = shutdown.signal();
            thread::spawn(move || crawler.rejoin_loop(&signal))
        };

        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();

        drain.join().unwrap();
        rejoin.join().unwrap();
    }

    #[test]
    fn test_start_over_loopback() {
        let bootstrap = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        bootstrap.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let bootstrap_addr = bootstrap.local_addr().unwrap();

        // unspecified host, so loopback contacts pass the self-address check
        let mut config = Config::default();
        config.host = "0.0.0.0".parse().unwrap();
        config.port = 0;
        config.rejoin_interval = Duration::from_secs(60);
        config.bootstrap_nodes = vec![bootstrap_addr.to_string()];

        let (tx, _discoveries) = unbounded();
        let crawler = Arc::new(Crawler::bind(config, tx).unwrap());
        let mut shutdown = Shutdown::new();
        let workers = crawler.start(&shutdown).unwrap();

        let mut buf = [0u8; 1500];
        let (len, from) = bootstrap.recv_from(&mut buf).expect("join find_node");
        let join = serde_bencoded::from_bytes::<Message>(&buf[..len]).unwrap();
        assert_eq!(join.query_type, QueryType::FindNode);
        assert_eq!(join.request.as_ref().and_then(|a| a.id).map(|i| i.as_ref()), Some(crawler.id().as_bytes()));
        let tid = join.transaction_id.unwrap().to_vec();

        let node_id = Id([0x42; 20]);
        let nodes = compact_node(node_id, [127, 0, 0, 1], bootstrap_addr.port());
        let reply = response(&tid, vec![("id", Value::Bytes(vec![1; 20])), ("nodes", Value::Bytes(nodes))]);
        bootstrap.send_to(&reply, from).unwrap();

        let (len, _) = bootstrap.recv_from(&mut buf).expect("biased probe");
        let probe = serde_bencoded::from_bytes::<Message>(&buf[..len]).unwrap();
        assert_eq!(probe.query_type, QueryType::FindNode);
        assert_eq!(probe.request.and_then(|a| a.id).map(|i| i.as_ref()), Some(crawler.id().near(&node_id).as_bytes()));

        assert!(workers.exited.try_recv().is_err());
        shutdown.trigger();

        let exited = workers.exited.clone();
        workers.join();
        let mut names: Vec<_> = exited.try_iter().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["drain", "receive", "rejoin"]);
    }
}
