//! UDP: a connectionless port demultiplexer.
//!
//! Deliberately simpler than a real OS transport: exactly one binding may
//! own a port at a time (no `SO_REUSEADDR`), and a host is assumed to sit
//! behind a single interface.
//!
//! Datagram format:
//!
//! ```text
//! src port(2) | dst port(2) | length(2) | checksum(1) | payload
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::protocol::{
    BindError, DatagramMeta, Ipv4Addr, L3Protocol, L4Protocol, SendOptions, ANY_ADDR, IPPROTO_UDP,
};
use crate::queue::PacketQueue;
use crate::util::{checksum, fmt_ip};

/// Fixed header length.
pub const UDP_HEADER_LEN: usize = 7;

/// Default receive-queue capacity, in datagrams.
pub const DEFAULT_RECV_CAPACITY: usize = 100;

const OFF_DST_PORT: usize = 2;
const OFF_CHECKSUM: usize = 6;

/// The UDP engine: a port → binding table over the registered L3s.
pub struct Udp {
    self_ref: Weak<Udp>,
    l3_protocols: Mutex<Vec<Arc<dyn L3Protocol>>>,
    bindings: Mutex<HashMap<u16, Arc<UdpBinding>>>,
}

impl Udp {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            l3_protocols: Mutex::new(Vec::new()),
            bindings: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_l3_protocol(&self, l3: Arc<dyn L3Protocol>) {
        self.l3_protocols.lock().unwrap().push(l3);
    }

    /// Claim `port`, receiving datagrams addressed to `addr` (or to anyone
    /// when `addr` is `0.0.0.0`).
    pub fn bind(
        &self,
        addr: Ipv4Addr,
        port: u16,
        network_protocol: [u8; 2],
    ) -> Result<Arc<UdpBinding>, BindError> {
        let mut bindings = self.bindings.lock().unwrap();
        if bindings.contains_key(&port) {
            log::debug!("[udp] port {port} already in use");
            return Err(BindError::PortInUse(port));
        }
        let binding = Arc::new(UdpBinding {
            udp: self.self_ref.clone(),
            addr,
            port,
            network_protocol,
            queue: PacketQueue::new(DEFAULT_RECV_CAPACITY),
        });
        bindings.insert(port, binding.clone());
        Ok(binding)
    }

    pub fn is_port_in_use(&self, port: u16) -> bool {
        self.bindings.lock().unwrap().contains_key(&port)
    }

    /// Build a datagram and hand it to the L3 matching `network_protocol`.
    pub fn send_to(
        &self,
        data: &[u8],
        dst_addr: Ipv4Addr,
        dst_port: u16,
        src_port: u16,
        network_protocol: [u8; 2],
    ) {
        let Some(l3) = self.find_l3(network_protocol) else {
            log::debug!("[udp] no network protocol {network_protocol:02X?}, dropping");
            return;
        };

        let length = (UDP_HEADER_LEN + data.len()) as u16;
        let mut segment = Vec::with_capacity(UDP_HEADER_LEN + data.len());
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&length.to_be_bytes());
        segment.push(0);
        segment.extend_from_slice(data);
        segment[OFF_CHECKSUM] = checksum(&segment);

        log::debug!(
            "[udp] → {} bytes to {}:{dst_port}",
            data.len(),
            fmt_ip(&dst_addr)
        );
        l3.send_down(&segment, dst_addr, SendOptions::default(), IPPROTO_UDP);
    }

    fn find_l3(&self, identifier: [u8; 2]) -> Option<Arc<dyn L3Protocol>> {
        self.l3_protocols
            .lock()
            .unwrap()
            .iter()
            .find(|l3| l3.identifier() == identifier)
            .cloned()
    }

    fn valid_checksum(segment: &[u8]) -> bool {
        let actual = segment[OFF_CHECKSUM];
        checksum(segment).wrapping_sub(actual) == actual
    }
}

impl L4Protocol for Udp {
    fn identifier(&self) -> u8 {
        IPPROTO_UDP
    }

    fn send_up(&self, segment: &[u8], meta: DatagramMeta) {
        if segment.len() < UDP_HEADER_LEN || !Self::valid_checksum(segment) {
            log::debug!("[udp] got corrupted datagram, dropping");
            return;
        }

        let dst_port = u16::from_be_bytes([segment[OFF_DST_PORT], segment[OFF_DST_PORT + 1]]);
        let binding = self.bindings.lock().unwrap().get(&dst_port).cloned();
        let Some(binding) = binding else {
            log::debug!("[udp] nobody listening on port {dst_port}, dropping");
            return;
        };

        if binding.matches(meta.dst_addr, dst_port) {
            binding.queue.put(segment[UDP_HEADER_LEN..].to_vec());
        } else {
            log::debug!("[udp] datagram for a different address, dropping");
        }
    }
}

/// The per-(address, port) state owned by the engine.
#[derive(Debug)]
pub struct UdpBinding {
    udp: Weak<Udp>,
    addr: Ipv4Addr,
    port: u16,
    network_protocol: [u8; 2],
    queue: PacketQueue,
}

impl UdpBinding {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn network_protocol(&self) -> [u8; 2] {
        self.network_protocol
    }

    /// Dequeue the oldest datagram payload without waiting.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.queue.try_get()
    }

    /// Release the port.
    pub fn close(&self) {
        if let Some(udp) = self.udp.upgrade() {
            udp.bindings.lock().unwrap().remove(&self.port);
        }
    }

    fn matches(&self, dst_addr: Ipv4Addr, port: u16) -> bool {
        port == self.port && (self.addr == ANY_ADDR || self.addr == dst_addr)
    }
}
