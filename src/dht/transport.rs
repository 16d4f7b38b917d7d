use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use log::debug;
use mio::net::UdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};

/// Large enough for any UDP payload.
const RECV_BUFFER_SIZE: usize = 65536;
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const SOCKET: Token = Token(0);

/// Outbound half of the network. Split out so the crawler can run against a recorder in tests.
pub trait Transport: Send + Sync {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(UdpTransport { socket: UdpSocket::from_std(socket.into()) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Feeds every received datagram to `on_datagram` until `shutdown` fires or disconnects.
    ///
    /// Per-datagram problems never end the loop, only a failing poll does.
    pub fn receive_loop(&self, shutdown: &Receiver<()>, mut on_datagram: impl FnMut(&[u8], SocketAddr)) -> io::Result<()> {
        let mut poll = Poll::new()?;
        let fd = self.socket.as_raw_fd();
        poll.registry().register(&mut SourceFd(&fd), SOCKET, Interest::READABLE)?;

        let mut events = Events::with_capacity(16);
        let mut recv_buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            match shutdown.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => return Ok(()),
            }

            match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            // readiness is edge triggered, drain everything that is queued
            loop {
                match self.socket.recv_from(&mut recv_buf) {
                    Ok((received, addr)) => on_datagram(&recv_buf[..received], addr),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("encountered recv error {}", e);
                        break;
                    }
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let sent = self.socket.send_to(buf, addr)?;
        if sent != buf.len() {
            return Err(io::Error::new(ErrorKind::WriteZero, "datagram truncated"));
        }
        Ok(sent)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingTransport {
    sent: parking_lot::Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().clone()
    }
}

#[cfg(test)]
impl Transport for RecordingTransport {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((buf.to_vec(), addr));
        Ok(buf.len())
    }
}
