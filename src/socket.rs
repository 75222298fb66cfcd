//! The socket façade: one API over both transports.
//!
//! A [`Socket`] is a thin adapter around a host's UDP or TCP engine,
//! picked at creation time by the usual `(domain, type, protocol)` triple.
//! It is a leaky abstraction — datagram sockets reject stream calls and
//! vice versa — but it lets application code stay transport-agnostic.
//!
//! Misuse (binding twice, streaming on an unconnected socket, an unknown
//! domain) surfaces as [`SocketError`]; data-plane emptiness stays a
//! `None` result, never an error.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::protocol::{BindError, Ipv4Addr, ANY_ADDR, ETHERTYPE_IPV4};
use crate::tcp::{Tcp, TcpBinding, TcpConnection};
use crate::udp::{Udp, UdpBinding};

/// The only supported address family.
pub const AF_INET: u8 = 0;

/// Datagram channel selector (UDP).
pub const SOCK_DGRAM: u8 = 0;

/// Stream channel selector (TCP).
pub const SOCK_STREAM: u8 = 1;

/// Anything that can hand a socket its transport engines.
pub trait Host: Send + Sync {
    fn udp(&self) -> Arc<Udp>;
    fn tcp(&self) -> Arc<Tcp>;
}

/// Which transport a socket was created over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Udp,
    Tcp,
}

/// Errors surfaced by the socket API.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("unsupported domain {0}")]
    UnsupportedDomain(u8),
    #[error("unsupported channel type {0} / protocol {1}")]
    UnsupportedChannel(u8, u8),
    #[error("operation requires a {0} socket")]
    WrongSocketType(&'static str),
    #[error("socket is not bound")]
    NotBound,
    #[error("socket is not connected")]
    NotConnected,
    #[error("nothing to accept: socket is not listening")]
    NotListening,
    #[error(transparent)]
    Bind(#[from] BindError),
}

pub struct Socket {
    host: Arc<dyn Host>,
    kind: SocketKind,
    udp_binding: Mutex<Option<Arc<UdpBinding>>>,
    tcp_binding: Mutex<Option<Arc<TcpBinding>>>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    /// Datagram bytes pulled but not yet returned by `recv`.
    staged: Mutex<Vec<u8>>,
}

impl Socket {
    /// Open a socket on `host`.
    ///
    /// `domain` must be [`AF_INET`]; `(channel, protocol)` must be
    /// `(SOCK_DGRAM, 0)` for UDP or `(SOCK_STREAM, 0)` for TCP.
    pub fn new(host: Arc<dyn Host>, domain: u8, channel: u8, protocol: u8) -> Result<Self, SocketError> {
        if domain != AF_INET {
            return Err(SocketError::UnsupportedDomain(domain));
        }
        let kind = match (channel, protocol) {
            (SOCK_DGRAM, 0) => SocketKind::Udp,
            (SOCK_STREAM, 0) => SocketKind::Tcp,
            _ => return Err(SocketError::UnsupportedChannel(channel, protocol)),
        };
        Ok(Self {
            host,
            kind,
            udp_binding: Mutex::new(None),
            tcp_binding: Mutex::new(None),
            connection: Mutex::new(None),
            staged: Mutex::new(Vec::new()),
        })
    }

    /// Wrap an accepted connection in a socket of the listener's flavour.
    fn accepted(listener: &Socket, connection: Arc<TcpConnection>) -> Socket {
        Socket {
            host: listener.host.clone(),
            kind: listener.kind,
            udp_binding: Mutex::new(None),
            tcp_binding: Mutex::new(listener.tcp_binding.lock().unwrap().clone()),
            connection: Mutex::new(Some(connection)),
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Claim `addr:port` on this socket's transport.
    pub fn bind(&self, addr: Ipv4Addr, port: u16) -> Result<(), SocketError> {
        match self.kind {
            SocketKind::Udp => {
                let binding = self.host.udp().bind(addr, port, ETHERTYPE_IPV4)?;
                *self.udp_binding.lock().unwrap() = Some(binding);
            }
            SocketKind::Tcp => {
                let binding = self.host.tcp().bind(addr, port, ETHERTYPE_IPV4)?;
                *self.tcp_binding.lock().unwrap() = Some(binding);
            }
        }
        Ok(())
    }

    /// Enter the listening role (stream sockets only).
    pub fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        if self.kind != SocketKind::Tcp {
            return Err(SocketError::WrongSocketType("stream"));
        }
        let binding = self.tcp_binding.lock().unwrap().clone();
        binding.ok_or(SocketError::NotBound)?.listen(backlog);
        Ok(())
    }

    /// Take the next pending connection, returning a socket wrapping it.
    pub async fn accept(&self) -> Result<Socket, SocketError> {
        if self.kind != SocketKind::Tcp {
            return Err(SocketError::WrongSocketType("stream"));
        }
        let binding = self
            .tcp_binding
            .lock()
            .unwrap()
            .clone()
            .ok_or(SocketError::NotBound)?;
        let connection = binding.accept().await.ok_or(SocketError::NotListening)?;
        Ok(Socket::accepted(self, connection))
    }

    /// Open a connection, auto-binding to an ephemeral port if needed.
    pub async fn connect(&self, addr: Ipv4Addr, port: u16) -> Result<(), SocketError> {
        if self.kind != SocketKind::Tcp {
            return Err(SocketError::WrongSocketType("stream"));
        }
        if self.tcp_binding.lock().unwrap().is_none() {
            self.bind(ANY_ADDR, self.random_free_port())?;
        }
        let binding = self
            .tcp_binding
            .lock()
            .unwrap()
            .clone()
            .ok_or(SocketError::NotBound)?;
        let connection = binding.connect(addr, port).await.ok_or(SocketError::NotConnected)?;
        *self.connection.lock().unwrap() = Some(connection);
        Ok(())
    }

    /// Send one datagram (datagram sockets), or fall through to [`send`]
    /// on a stream socket.
    pub fn send_to(
        &self,
        dst_addr: Ipv4Addr,
        dst_port: u16,
        src_port: Option<u16>,
        data: &[u8],
    ) -> Result<(), SocketError> {
        match self.kind {
            SocketKind::Udp => {
                let src_port = src_port.unwrap_or_else(|| self.random_free_port());
                self.host
                    .udp()
                    .send_to(data, dst_addr, dst_port, src_port, ETHERTYPE_IPV4);
                Ok(())
            }
            SocketKind::Tcp => self.send(data),
        }
    }

    /// Push bytes into the connection's outgoing stream.
    pub fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        if self.kind != SocketKind::Tcp {
            return Err(SocketError::WrongSocketType("stream"));
        }
        let connection = self
            .connection
            .lock()
            .unwrap()
            .clone()
            .ok_or(SocketError::NotConnected)?;
        for byte in data {
            connection.send(*byte);
        }
        Ok(())
    }

    /// Read up to `max_bytes`.
    ///
    /// Datagram sockets drain the staging buffer first and then pull one
    /// datagram at a time, staging any excess; when buffer and queue empty
    /// out, the short concatenation collected so far is returned rather
    /// than blocking. Stream sockets read byte-wise and stop at the first
    /// gap. `None` means nothing was available at all.
    pub fn recv(&self, max_bytes: usize) -> Option<Vec<u8>> {
        match self.kind {
            SocketKind::Udp => self.recv_datagram(max_bytes),
            SocketKind::Tcp => self.recv_stream(max_bytes),
        }
    }

    fn recv_datagram(&self, max_bytes: usize) -> Option<Vec<u8>> {
        let binding = self.udp_binding.lock().unwrap().clone();
        let Some(binding) = binding else {
            log::debug!("[sock] recv on an unbound datagram socket");
            return None;
        };

        let mut staged = self.staged.lock().unwrap();
        loop {
            if staged.len() >= max_bytes {
                let rest = staged.split_off(max_bytes);
                let out = std::mem::replace(&mut *staged, rest);
                return Some(out);
            }
            match binding.recv() {
                Some(datagram) => staged.extend_from_slice(&datagram),
                None => {
                    if staged.is_empty() {
                        return None;
                    }
                    return Some(std::mem::take(&mut *staged));
                }
            }
        }
    }

    fn recv_stream(&self, max_bytes: usize) -> Option<Vec<u8>> {
        let connection = self.connection.lock().unwrap().clone();
        let Some(connection) = connection else {
            log::debug!("[sock] recv on an unconnected stream socket");
            return None;
        };

        let mut out = Vec::with_capacity(max_bytes);
        while out.len() < max_bytes {
            match connection.recv() {
                Some(byte) => out.push(byte),
                None => break,
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Close the binding (datagram) or the connection (stream).
    pub fn close(&self) {
        match self.kind {
            SocketKind::Udp => {
                if let Some(binding) = self.udp_binding.lock().unwrap().take() {
                    binding.close();
                }
            }
            SocketKind::Tcp => {
                if let Some(connection) = self.connection.lock().unwrap().clone() {
                    connection.close();
                }
            }
        }
    }

    /// The connection behind a stream socket, for callers that need
    /// endpoint details.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    fn random_free_port(&self) -> u16 {
        loop {
            let port = rand::random::<u16>();
            let in_use = match self.kind {
                SocketKind::Udp => self.host.udp().is_port_in_use(port),
                SocketKind::Tcp => self.host.tcp().is_port_in_use(port),
            };
            if !in_use {
                return port;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DatagramMeta, L4Protocol};
    use crate::util::checksum;

    struct StubHost {
        udp: Arc<Udp>,
        tcp: Arc<Tcp>,
    }

    impl StubHost {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                udp: Udp::new(),
                tcp: Tcp::new(),
            })
        }
    }

    impl Host for StubHost {
        fn udp(&self) -> Arc<Udp> {
            self.udp.clone()
        }

        fn tcp(&self) -> Arc<Tcp> {
            self.tcp.clone()
        }
    }

    /// Feed a well-formed datagram straight into the host's UDP engine.
    fn deliver(host: &StubHost, dst_port: u16, payload: &[u8]) {
        let mut seg = Vec::new();
        seg.extend_from_slice(&9999u16.to_be_bytes());
        seg.extend_from_slice(&dst_port.to_be_bytes());
        seg.extend_from_slice(&((7 + payload.len()) as u16).to_be_bytes());
        seg.push(0);
        seg.extend_from_slice(payload);
        seg[6] = checksum(&seg);
        host.udp.send_up(
            &seg,
            DatagramMeta {
                src_addr: [10, 0, 0, 1],
                dst_addr: [10, 0, 0, 2],
            },
        );
    }

    #[test]
    fn rejects_unknown_domain_and_channel() {
        let host = StubHost::new();
        assert!(matches!(
            Socket::new(host.clone(), 7, SOCK_DGRAM, 0),
            Err(SocketError::UnsupportedDomain(7))
        ));
        assert!(matches!(
            Socket::new(host.clone(), AF_INET, 9, 0),
            Err(SocketError::UnsupportedChannel(9, 0))
        ));
        assert!(matches!(
            Socket::new(host, AF_INET, SOCK_DGRAM, 1),
            Err(SocketError::UnsupportedChannel(0, 1))
        ));
    }

    #[test]
    fn udp_recv_stages_excess_bytes() {
        let host = StubHost::new();
        let socket = Socket::new(host.clone(), AF_INET, SOCK_DGRAM, 0).unwrap();
        socket.bind(ANY_ADDR, 80).unwrap();

        deliver(&host, 80, b"this_is_a_test");
        deliver(&host, 80, b"hope_this_works");

        assert_eq!(socket.recv(10), Some(b"this_is_a_".to_vec()));
        assert_eq!(socket.recv(10), Some(b"test".to_vec()));
        assert_eq!(socket.recv(10), Some(b"hope_this_".to_vec()));
        assert_eq!(socket.recv(10), Some(b"works".to_vec()));
        assert_eq!(socket.recv(10), None);
    }

    #[test]
    fn udp_recv_spans_datagram_boundaries() {
        let host = StubHost::new();
        let socket = Socket::new(host.clone(), AF_INET, SOCK_DGRAM, 0).unwrap();
        socket.bind(ANY_ADDR, 80).unwrap();

        deliver(&host, 80, b"abc");
        deliver(&host, 80, b"defgh");

        // One read pulls from both datagrams.
        assert_eq!(socket.recv(6), Some(b"abcdef".to_vec()));
        assert_eq!(socket.recv(6), Some(b"gh".to_vec()));
    }

    #[test]
    fn udp_recv_unbound_returns_none() {
        let host = StubHost::new();
        let socket = Socket::new(host, AF_INET, SOCK_DGRAM, 0).unwrap();
        assert_eq!(socket.recv(10), None);
    }

    #[test]
    fn stream_calls_on_datagram_socket_fail() {
        let host = StubHost::new();
        let socket = Socket::new(host, AF_INET, SOCK_DGRAM, 0).unwrap();
        assert!(matches!(
            socket.listen(4),
            Err(SocketError::WrongSocketType(_))
        ));
        assert!(matches!(
            socket.send(b"x"),
            Err(SocketError::WrongSocketType(_))
        ));
    }

    #[test]
    fn udp_close_releases_the_port() {
        let host = StubHost::new();
        let socket = Socket::new(host.clone(), AF_INET, SOCK_DGRAM, 0).unwrap();
        socket.bind(ANY_ADDR, 80).unwrap();
        assert!(host.udp.is_port_in_use(80));
        socket.close();
        assert!(!host.udp.is_port_in_use(80));
    }

    #[test]
    fn listen_before_bind_fails() {
        let host = StubHost::new();
        let socket = Socket::new(host, AF_INET, SOCK_STREAM, 0).unwrap();
        assert!(matches!(socket.listen(4), Err(SocketError::NotBound)));
    }
}
