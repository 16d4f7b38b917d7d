use std::array::TryFromSliceError;
use std::convert::{TryFrom, TryInto};
use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crossbeam_channel::Sender;
use log::{debug, info, trace};
use rand::rngs::OsRng;
use rand::{thread_rng, RngCore};
use serde::Serialize;
use serde_bytes::Bytes;
use sha1::Sha1;

use crate::config::Config;
use crate::error::{Error, Result};
use message::*;
use pool::NodePool;
use transport::{Transport, UdpTransport};

pub mod message;
mod utils;
pub mod pool;
mod token;
pub mod transport;
pub mod crawl;

pub const ID_LENGTH: usize = 20;
const COMPACT_NODE_LENGTH: usize = 26;
/// Number of leading bytes borrowed from the target when faking closeness to it.
const NEAR_PREFIX: usize = 10;
/// KRPC needs four levels at most.
const MAX_NESTING: usize = 32;


#[derive(PartialEq, Eq, Ord, PartialOrd, Copy, Clone, Hash)]
pub struct Id(pub [u8; ID_LENGTH]);

impl Id {
    /// SHA1 over 20 bytes from the OS rng.
    pub fn random() -> Self {
        let mut seed = [0u8; ID_LENGTH];
        OsRng.fill_bytes(&mut seed);

        let mut hasher = Sha1::new();
        hasher.update(&seed);
        Id(hasher.digest().bytes())
    }

    /// Returns an ID with the high-order bytes of `target` and the low-order bytes of `self`.
    ///
    /// Under the XOR metric the result looks like a close neighbor of `target`, which
    /// makes remote nodes more willing to hand out contacts and to send us announces.
    pub fn near(&self, target: &Id) -> Id {
        let mut id = self.0;
        id[..NEAR_PREFIX].copy_from_slice(&target.0[..NEAR_PREFIX]);
        Id(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = TryFromSliceError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        let inner: [u8; ID_LENGTH] = value.try_into()?;
        Ok(Id(inner))
    }
}

/// A node learned from a `find_node` response, waiting in the pool for a probe.
#[derive(PartialEq, Eq, Clone, Debug, Hash)]
pub struct Contact {
    pub address: SocketAddr,
    pub id: Id,
}

impl Contact {
    /// Decodes compact node info. A blob that isn't a whole number of records yields nothing.
    pub fn from_bytes(raw: &[u8]) -> impl Iterator<Item=Contact> + '_ {
        let usable = if raw.len() % COMPACT_NODE_LENGTH == 0 { raw.len() } else { 0 };

        raw[..usable].chunks_exact(COMPACT_NODE_LENGTH).map(|raw| {
            let mut id = [0u8; ID_LENGTH];
            id.copy_from_slice(&raw[0..20]);
            let ip = Ipv4Addr::new(raw[20], raw[21], raw[22], raw[23]);
            let port = u16::from_be_bytes([raw[24], raw[25]]);
            Contact { id: Id(id), address: SocketAddr::V4(SocketAddrV4::new(ip, port)) }
        })
    }
}

/// An infohash some peer announced, together with where that peer can be reached.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Discovery {
    pub info_hash: Id,
    pub address: SocketAddr,
}

impl Discovery {
    pub fn magnet(&self) -> String {
        format!("magnet:?xt=urn:btih:{}", hex::encode(self.info_hash.0))
    }
}

impl Display for Discovery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, address:{}:{}", self.magnet(), self.address.ip(), self.address.port())
    }
}

fn decode(buf: &[u8]) -> Result<Message<'_>> {
    if !check_nesting(buf, MAX_NESTING) {
        return Err(Error::Malformed("bencode nested too deep"));
    }
    serde_bencoded::from_bytes::<Message>(buf).map_err(|e| Error::Decode(e.to_string()))
}

fn transaction_id(length: usize) -> Vec<u8> {
    let mut tid = vec![0u8; length];
    thread_rng().fill_bytes(&mut tid);
    tid
}

/// Passive DHT participant: probes nodes with `find_node` and collects `announce_peer` traffic.
///
/// Nothing about outstanding queries is remembered. Responses are trusted by shape alone,
/// their transaction ids are never matched against what was sent.
pub struct Crawler<T> {
    id: Id,
    config: Config,
    pool: NodePool,
    transport: T,
    discoveries: Sender<Discovery>,
}

impl Crawler<UdpTransport> {
    pub fn bind(config: Config, discoveries: Sender<Discovery>) -> Result<Self> {
        config.validate()?;
        let transport = UdpTransport::bind(config.bind_address())?;
        Ok(Crawler::new(config, transport, discoveries))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }
}

impl<T: Transport> Crawler<T> {
    pub fn new(config: Config, transport: T, discoveries: Sender<Discovery>) -> Self {
        let id = Id::random();
        let pool = NodePool::new(config.node_pool_max, config.host, id);

        Crawler {
            id,
            config,
            pool,
            transport,
            discoveries,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    /// Handles one inbound datagram. Anything malformed is dropped here and never escapes.
    pub fn recv_message(&self, buf: &[u8], from_address: SocketAddr) {
        trace!("{:>21} -> {}", from_address, utils::strip(buf));

        if from_address.port() == 0 {
            debug!("source port is zero, discarding");
            return;
        }

        let message = match decode(buf) {
            Ok(message) => message,
            Err(e) => {
                debug!("{:>21} -> {}", from_address, e);
                return;
            }
        };

        let result = match message.message_type {
            MessageType::Response => self.response(&message),
            MessageType::Request => self.request(&message, from_address),
            MessageType::Error => {
                trace!("{:>21} -> ignoring error", from_address);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("{:>21} -> dropped: {}", from_address, e);
        }
    }

    fn response(&self, response: &Message) -> Result<()> {
        let nodes = match response.response.as_ref().and_then(|r| r.nodes) {
            Some(nodes) => nodes,
            None => return Ok(()),
        };

        let mut admitted = 0;
        for contact in Contact::from_bytes(nodes) {
            if self.pool.try_push(contact) {
                admitted += 1;
            }
        }
        trace!("admitted {} of {} nodes into pool", admitted, nodes.len() / COMPACT_NODE_LENGTH);

        Ok(())
    }

    fn request(&self, request: &Message, from_address: SocketAddr) -> Result<()> {
        match request.query_type {
            QueryType::GetPeers => self.on_get_peers(request, from_address),
            QueryType::AnnouncePeer => self.on_announce_peer(request, from_address),
            QueryType::None => Err(Error::Malformed("query without method")),
            ref query => {
                trace!("{:>21} -> playing dead on {:?}", from_address, query);
                self.play_dead(request, from_address)
            }
        }
    }

    fn on_get_peers(&self, request: &Message, from_address: SocketAddr) -> Result<()> {
        let transaction_id = request.transaction_id.ok_or(Error::Malformed("get_peers without transaction id"))?;
        let args = request.request.as_ref().ok_or(Error::Malformed("get_peers without arguments"))?;
        args.id.ok_or(Error::Malformed("get_peers without id"))?;
        let info_hash = args.info_hash.ok_or(Error::Malformed("get_peers without info_hash"))?;
        let info_hash = Id::try_from(info_hash.as_ref()).map_err(|_| Error::Malformed("info_hash is not 20 bytes"))?;

        let id = self.id.near(&info_hash);
        let token = token::announce_token(&info_hash, self.config.token_length);

        let reply = Message::response(transaction_id, Response {
            id: Some(Bytes::new(id.as_bytes())),
            nodes: Some(Bytes::new(&[])),
            token: Some(Bytes::new(token)),
        });

        self.send_message(&reply, from_address);
        Ok(())
    }

    fn on_announce_peer(&self, request: &Message, from_address: SocketAddr) -> Result<()> {
        let args = request.request.as_ref().ok_or(Error::Malformed("announce_peer without arguments"))?;
        let info_hash = args.info_hash.ok_or(Error::Malformed("announce_peer without info_hash"))?;
        let token = args.token.ok_or(Error::Malformed("announce_peer without token"))?;
        let id = args.id.ok_or(Error::Malformed("announce_peer without id"))?;
        let transaction_id = request.transaction_id.ok_or(Error::Malformed("announce_peer without transaction id"))?;

        let info_hash = Id::try_from(info_hash.as_ref()).map_err(|_| Error::Malformed("info_hash is not 20 bytes"))?;
        let remote_id = Id::try_from(id.as_ref()).map_err(|_| Error::Malformed("announce_peer id is not 20 bytes"))?;

        match self.announced_peer(args, info_hash, token, from_address) {
            Ok(discovery) => {
                info!("{}", discovery);
                if self.discoveries.send(discovery).is_err() {
                    debug!("discovery receiver is gone");
                }
            }
            Err(reason) => debug!("{:>21} -> announce_peer rejected: {}", from_address, reason),
        }

        // acknowledge either way so we keep looking responsive
        let id = self.id.near(&remote_id);
        let reply = Message::response(transaction_id, Response {
            id: Some(Bytes::new(id.as_bytes())),
            ..Default::default()
        });
        self.send_message(&reply, from_address);

        Ok(())
    }

    fn announced_peer(&self, args: &Request, info_hash: Id, token: &[u8], from_address: SocketAddr) -> std::result::Result<Discovery, &'static str> {
        if !token::check_token(token, &info_hash, self.config.token_length) {
            return Err("invalid token");
        }

        let port = match args.implied_port {
            Some(implied) if implied != 0 => i64::from(from_address.port()),
            _ => args.port.ok_or("missing port")?,
        };

        let port = u16::try_from(port).ok().filter(|&port| port != 0).ok_or("port out of range")?;

        Ok(Discovery {
            info_hash,
            address: SocketAddr::new(from_address.ip(), port),
        })
    }

    fn play_dead(&self, request: &Message, from_address: SocketAddr) -> Result<()> {
        let transaction_id = request.transaction_id.ok_or(Error::Malformed("query without transaction id"))?;
        self.send_message(&ErrorMessage::server_error(transaction_id), from_address);
        Ok(())
    }

    /// Sends a `find_node` with a random target. With `remote_id` set we pose as its neighbor.
    pub(crate) fn send_find_node(&self, addr: SocketAddr, remote_id: Option<Id>) {
        let id = match remote_id {
            Some(remote_id) => self.id.near(&remote_id),
            None => self.id,
        };
        let target = Id::random();
        let transaction_id = transaction_id(self.config.transaction_id_length);

        let msg = Message::query(&transaction_id, QueryType::FindNode, Request {
            id: Some(Bytes::new(id.as_bytes())),
            target: Some(Bytes::new(target.as_bytes())),
            ..Default::default()
        });

        self.send_message(&msg, addr);
    }

    /// Fire and forget. Failures are expected noise and only logged.
    fn send_message(&self, msg: &impl Serialize, addr: SocketAddr) {
        if let Err(e) = self.try_send(msg, addr) {
            debug!("failed to send to {}: {}", addr, e);
        }
    }

    fn try_send(&self, msg: &impl Serialize, addr: SocketAddr) -> Result<()> {
        let serialized = serde_bencode::to_bytes(msg)?;

        trace!("{:>21} <- {}", addr, utils::strip(serialized.as_slice()));

        self.transport.send_to(&serialized, addr)?;
        Ok(())
    }
}
