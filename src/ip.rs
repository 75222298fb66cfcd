//! An IP-like L3 with fragmentation, reassembly, and forwarding.
//!
//! Differences from real IP, chosen to keep the wire format simple:
//! the header is fixed-length (no options, no HLen), every field is at
//! least one byte, and the checksum is the one-byte folded sum used by
//! every other layer of the simulator.
//!
//! Packet format (20-byte header):
//!
//! ```text
//! version(1) | tos(1) | length(2) | ident(2) | flags(1) | offset(2) |
//! ttl(1) | proto(1) | checksum(1) | src addr(4) | dst addr(4) | payload
//! ```
//!
//! `ident == 0` marks an unfragmented packet, which bypasses the reassembly
//! table entirely. Fragments of one original payload share a non-zero
//! `ident`, carry their byte offset into the payload, and clear the `flags`
//! bit on every fragment except the last.
//!
//! One [`Ip`] engine owns any number of interfaces (hosts have one, routers
//! several). Each interface owns its address, its per-destination ident
//! counter, and its reassembly table; the engine owns the route provider,
//! the address resolver, the registered L4 protocols, and the forwarding
//! flag. A raw packet tap ahead of local/forward handling lets a NAT
//! gateway interpose on everything the engine hears.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{
    AddressResolver, DatagramMeta, Ipv4Addr, L2Protocol, L3Protocol, L4Protocol, PacketConsumer,
    RouteProvider, SendOptions, ETHERTYPE_IPV4,
};
use crate::util::{checksum, fmt_ip};

/// Fixed header length.
pub const IP_HEADER_LEN: usize = 20;

/// Largest representable packet (the length field is two bytes).
pub const MAX_PACKET_LEN: usize = 65536;

/// How long a partial reassembly may sit idle before eviction.
pub const REASSEMBLY_EXPIRY: Duration = Duration::from_secs(10);

/// Period of the reassembly-table cleanup sweep.
pub const REASSEMBLY_SWEEP_PERIOD: Duration = Duration::from_secs(600);

const IP_VERSION: u8 = 4;

// Header byte offsets.
const OFF_TOS: usize = 1;
const OFF_LEN: usize = 2;
const OFF_IDENT: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_OFFSET: usize = 7;
const OFF_TTL: usize = 9;
const OFF_PROTO: usize = 10;
const OFF_CHECKSUM: usize = 11;
const OFF_SRC: usize = 12;
const OFF_DST: usize = 16;

/// `flags` value on the last (or only) fragment.
const FLAG_LAST: u8 = 1;
/// `flags` value when more fragments follow.
const FLAG_MORE: u8 = 0;

struct FragmentTracker {
    last_arrival: Instant,
    packets: Vec<Vec<u8>>,
}

struct InterfaceState {
    /// Next outgoing ident per destination, wrapping 1..=65535.
    ident_by_dest: HashMap<Ipv4Addr, u16>,
    /// Partial reassemblies keyed by `(source address, ident)`.
    reassembly: HashMap<(Ipv4Addr, u16), FragmentTracker>,
}

/// One addressed attachment point of the engine.
pub struct IpInterface {
    address: Ipv4Addr,
    l2: Mutex<Option<Arc<dyn L2Protocol>>>,
    state: Mutex<InterfaceState>,
}

impl IpInterface {
    fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            l2: Mutex::new(None),
            state: Mutex::new(InterfaceState {
                ident_by_dest: HashMap::new(),
                reassembly: HashMap::new(),
            }),
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn l2(&self) -> Option<Arc<dyn L2Protocol>> {
        self.l2.lock().unwrap().clone()
    }

    /// Claim the next ident for `dst`, skipping 0 on wrap.
    fn next_ident(&self, dst: Ipv4Addr) -> u16 {
        let mut state = self.state.lock().unwrap();
        let next = match state.ident_by_dest.get(&dst) {
            Some(prev) => prev % 65535 + 1,
            None => 1,
        };
        state.ident_by_dest.insert(dst, next);
        next
    }

    /// Build one packet sourced from this interface.
    fn build_packet(
        &self,
        payload: &[u8],
        dst: Ipv4Addr,
        options: SendOptions,
        proto: u8,
        ident: u16,
        flags: u8,
        offset: u16,
    ) -> Vec<u8> {
        let length = (IP_HEADER_LEN + payload.len()) as u16;
        let mut packet = Vec::with_capacity(IP_HEADER_LEN + payload.len());
        packet.push(IP_VERSION);
        packet.push(options.tos);
        packet.extend_from_slice(&length.to_be_bytes());
        packet.extend_from_slice(&ident.to_be_bytes());
        packet.push(flags);
        packet.extend_from_slice(&offset.to_be_bytes());
        packet.push(options.ttl);
        packet.push(proto);
        packet.push(0);
        packet.extend_from_slice(&self.address);
        packet.extend_from_slice(&dst);
        packet.extend_from_slice(payload);
        packet[OFF_CHECKSUM] = checksum(&packet[..IP_HEADER_LEN]);
        packet
    }

    /// Emit `segment` out of this interface, fragmenting when it exceeds
    /// what one frame can carry.
    fn send_down(
        &self,
        engine: &Ip,
        segment: &[u8],
        dst: Ipv4Addr,
        options: SendOptions,
        l4_protocol: u8,
    ) {
        let Some(l2) = self.l2() else {
            log::debug!("[ip] {}: interface not wired to L2, dropping", fmt_ip(&self.address));
            return;
        };
        let Some(gateway) = engine.routes.gateway_for(dst) else {
            log::debug!("[ip] no route to {}, dropping", fmt_ip(&dst));
            return;
        };
        let Some(mac) = engine.resolver.resolve(gateway) else {
            log::debug!("[ip] cannot resolve {}, dropping", fmt_ip(&gateway));
            return;
        };

        let max_fragment = l2.mtu() - IP_HEADER_LEN;
        if segment.len() <= max_fragment {
            let packet = self.build_packet(segment, dst, options, l4_protocol, 0, FLAG_LAST, 0);
            l2.send_down(&packet, mac, ETHERTYPE_IPV4);
            return;
        }

        let ident = self.next_ident(dst);
        let mut consumed = 0;
        while consumed < segment.len() {
            let end = (consumed + max_fragment).min(segment.len());
            let flags = if end == segment.len() { FLAG_LAST } else { FLAG_MORE };
            let packet = self.build_packet(
                &segment[consumed..end],
                dst,
                options,
                l4_protocol,
                ident,
                flags,
                consumed as u16,
            );
            l2.send_down(&packet, mac, ETHERTYPE_IPV4);
            consumed = end;
        }
    }

    /// Fold `packet` into the reassembly table; returns the complete
    /// payload once every fragment from offset zero through the last-flagged
    /// one has arrived. Unfragmented packets pass straight through.
    fn reassemble(&self, packet: &[u8], mtu: usize) -> Option<Vec<u8>> {
        let ident = u16::from_be_bytes([packet[OFF_IDENT], packet[OFF_IDENT + 1]]);
        if ident == 0 {
            return Some(packet[IP_HEADER_LEN..].to_vec());
        }

        let src: Ipv4Addr = packet[OFF_SRC..OFF_SRC + 4].try_into().unwrap();
        let key = (src, ident);
        let max_fragment = mtu - IP_HEADER_LEN;
        let max_fragments = (MAX_PACKET_LEN - IP_HEADER_LEN) / max_fragment;

        let mut state = self.state.lock().unwrap();
        let tracker = state
            .reassembly
            .entry(key)
            .or_insert_with(|| FragmentTracker {
                last_arrival: Instant::now(),
                packets: Vec::new(),
            });
        tracker.last_arrival = Instant::now();
        tracker.packets.push(packet.to_vec());

        // Sort fragments into offset slots and look for a gap-free prefix
        // ending in a last-flagged fragment.
        let assembled = {
            let mut slots: Vec<Option<&[u8]>> = vec![None; max_fragments];
            for p in &tracker.packets {
                let offset = u16::from_be_bytes([p[OFF_OFFSET], p[OFF_OFFSET + 1]]) as usize;
                let slot = offset / max_fragment;
                if slot < max_fragments {
                    slots[slot] = Some(p.as_slice());
                }
            }

            let mut payload = Vec::new();
            let mut complete = false;
            for slot in &slots {
                match slot {
                    None => break,
                    Some(p) => {
                        payload.extend_from_slice(&p[IP_HEADER_LEN..]);
                        if p[OFF_FLAGS] == FLAG_LAST {
                            complete = true;
                            break;
                        }
                    }
                }
            }
            complete.then_some(payload)
        };

        if assembled.is_some() {
            state.reassembly.remove(&key);
        }
        assembled
    }

    /// Evict partial reassemblies whose last arrival has aged out.
    fn sweep(&self, expiry: Duration) {
        let mut state = self.state.lock().unwrap();
        let before = state.reassembly.len();
        state
            .reassembly
            .retain(|_, tracker| tracker.last_arrival.elapsed() <= expiry);
        let evicted = before - state.reassembly.len();
        if evicted > 0 {
            log::debug!("[ip] {}: evicted {evicted} stale reassemblies", fmt_ip(&self.address));
        }
    }
}

/// The L3 engine.
pub struct Ip {
    forwarding: bool,
    interfaces: Vec<IpInterface>,
    l4_protocols: Mutex<Vec<Weak<dyn L4Protocol>>>,
    raw_consumer: Mutex<Option<Weak<dyn PacketConsumer>>>,
    routes: Arc<dyn RouteProvider>,
    resolver: Arc<dyn AddressResolver>,
}

impl Ip {
    /// Create an engine with one interface per address and spawn its
    /// reassembly sweeper.
    pub fn new(
        addresses: &[Ipv4Addr],
        forwarding: bool,
        routes: Arc<dyn RouteProvider>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Arc<Self> {
        let ip = Arc::new(Self {
            forwarding,
            interfaces: addresses.iter().map(|a| IpInterface::new(*a)).collect(),
            l4_protocols: Mutex::new(Vec::new()),
            raw_consumer: Mutex::new(None),
            routes,
            resolver,
        });

        let weak = Arc::downgrade(&ip);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REASSEMBLY_SWEEP_PERIOD).await;
                let Some(ip) = weak.upgrade() else { break };
                for interface in &ip.interfaces {
                    interface.sweep(REASSEMBLY_EXPIRY);
                }
            }
        });

        ip
    }

    /// Wire interface `index` to its L2.
    pub fn set_l2_for_interface(&self, index: usize, l2: Arc<dyn L2Protocol>) {
        *self.interfaces[index].l2.lock().unwrap() = Some(l2);
    }

    pub fn l2_for_interface(&self, index: usize) -> Option<Arc<dyn L2Protocol>> {
        self.interfaces.get(index).and_then(|i| i.l2())
    }

    pub fn address_for_interface(&self, index: usize) -> Ipv4Addr {
        self.interfaces[index].address
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Register an upper protocol for protocol-byte demux.
    pub fn add_l4_protocol(&self, protocol: &Arc<dyn L4Protocol>) {
        self.l4_protocols.lock().unwrap().push(Arc::downgrade(protocol));
    }

    /// Install the raw packet tap (NAT gateways interpose this way).
    pub fn set_raw_consumer(&self, consumer: Weak<dyn PacketConsumer>) {
        *self.raw_consumer.lock().unwrap() = Some(consumer);
    }

    /// Index of the interface wired to `source`, if any.
    pub fn interface_of(&self, source: &Arc<dyn L2Protocol>) -> Option<usize> {
        self.interfaces.iter().position(|i| {
            i.l2()
                .map(|l2| Arc::ptr_eq(&l2, source))
                .unwrap_or(false)
        })
    }

    fn valid_checksum(packet: &[u8]) -> bool {
        let mut header = [0u8; IP_HEADER_LEN];
        header.copy_from_slice(&packet[..IP_HEADER_LEN]);
        header[OFF_CHECKSUM] = 0;
        checksum(&header) == packet[OFF_CHECKSUM]
    }

    fn interface_matching(&self, dst: Ipv4Addr) -> Option<usize> {
        self.interfaces.iter().position(|i| i.address == dst)
    }

    fn deliver_local(&self, index: usize, packet: &[u8]) {
        let interface = &self.interfaces[index];
        let Some(l2) = interface.l2() else { return };
        let Some(payload) = interface.reassemble(packet, l2.mtu()) else {
            return;
        };

        let meta = DatagramMeta {
            src_addr: packet[OFF_SRC..OFF_SRC + 4].try_into().unwrap(),
            dst_addr: packet[OFF_DST..OFF_DST + 4].try_into().unwrap(),
        };
        let proto = packet[OFF_PROTO];
        let upper = self
            .l4_protocols
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|p| p.identifier() == proto);

        match upper {
            Some(protocol) => protocol.send_up(&payload, meta),
            None => log::debug!(
                "[ip] {}: unrecognised packet type {proto:#04X}, dropping",
                fmt_ip(&interface.address)
            ),
        }
    }

    /// Forward a packet that is not addressed to this engine.
    fn forward(&self, packet: &[u8], source: &Arc<dyn L2Protocol>) {
        let mut packet = packet.to_vec();

        let ttl = packet[OFF_TTL].saturating_sub(1);
        if ttl == 0 {
            log::debug!("[ip] ttl exhausted, dropping");
            return;
        }
        packet[OFF_TTL] = ttl;
        packet[OFF_CHECKSUM] = 0;
        packet[OFF_CHECKSUM] = checksum(&packet[..IP_HEADER_LEN]);

        let dst: Ipv4Addr = packet[OFF_DST..OFF_DST + 4].try_into().unwrap();
        let Some(egress) = self.routes.interface_for(dst) else {
            log::debug!("[ip] no route to {}, dropping", fmt_ip(&dst));
            return;
        };
        if Some(egress) == self.interface_of(source) {
            log::debug!("[ip] egress equals ingress for {}, dropping", fmt_ip(&dst));
            return;
        }
        let Some(l2) = self.l2_for_interface(egress) else {
            return;
        };
        let Some(gateway) = self.routes.gateway_for(dst) else {
            log::debug!("[ip] no gateway for {}, dropping", fmt_ip(&dst));
            return;
        };
        let Some(mac) = self.resolver.resolve(gateway) else {
            log::debug!("[ip] cannot resolve {}, dropping", fmt_ip(&gateway));
            return;
        };

        l2.send_down(&packet, mac, ETHERTYPE_IPV4);
    }
}

impl L3Protocol for Ip {
    fn identifier(&self) -> [u8; 2] {
        ETHERTYPE_IPV4
    }

    fn send_down(&self, segment: &[u8], dst: Ipv4Addr, options: SendOptions, l4_protocol: u8) {
        let Some(index) = self.routes.interface_for(dst) else {
            log::debug!("[ip] no route to {}, dropping", fmt_ip(&dst));
            return;
        };
        let Some(interface) = self.interfaces.get(index) else {
            log::debug!("[ip] route names unknown interface {index}, dropping");
            return;
        };
        interface.send_down(self, segment, dst, options, l4_protocol);
    }

    fn send_up(&self, packet: &[u8], source: &Arc<dyn L2Protocol>) {
        if packet.len() < IP_HEADER_LEN || !Self::valid_checksum(packet) {
            log::debug!("[ip] got corrupted packet, dropping");
            return;
        }

        if let Some(tap) = self.raw_consumer.lock().unwrap().clone() {
            if let Some(tap) = tap.upgrade() {
                tap.receive(packet, source);
            }
        }

        if let Some(index) = self.interface_matching(packet[OFF_DST..OFF_DST + 4].try_into().unwrap())
        {
            self.deliver_local(index, packet);
        } else if self.forwarding {
            self.forward(packet, source);
        } else {
            log::debug!("[ip] packet for someone else and forwarding is off, dropping");
        }
    }
}
