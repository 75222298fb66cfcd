//! The trait seams between layers, plus the wire identifiers they demux on.
//!
//! Layers are wired together at construction time: ownership flows downward
//! (a host owns its engines, an engine owns its lower layer), while upward
//! dispatch edges and raw-frame taps are weak back-pointers installed by the
//! `add_*` / `set_*` calls. Demultiplexing is byte-equality on identifiers —
//! an EtherType for L2→L3, a protocol byte for L3→L4 — so new protocols can
//! be registered without the core knowing about them.

use std::sync::Arc;

use thiserror::Error;

use crate::adapter::EthernetAdapter;

/// A 6-byte link-layer address.
pub type MacAddr = [u8; 6];

/// A 4-byte network-layer address.
pub type Ipv4Addr = [u8; 4];

/// EtherType carried in frames for IP traffic.
pub const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];

/// IP protocol byte for TCP segments.
pub const IPPROTO_TCP: u8 = 0x06;

/// IP protocol byte for UDP datagrams.
pub const IPPROTO_UDP: u8 = 0x11;

/// The all-ones broadcast MAC.
pub const BROADCAST_MAC: MacAddr = [0xFF; 6];

/// Leading bytes of the multicast MAC range.
pub const MULTICAST_PREFIX: [u8; 3] = [0x01, 0x00, 0x5E];

/// The address that matches any destination when used as a bind address.
pub const ANY_ADDR: Ipv4Addr = [0, 0, 0, 0];

/// Default type-of-service byte stamped on outgoing packets.
pub const DEFAULT_TOS: u8 = 0;

/// Default time-to-live stamped on outgoing packets.
pub const DEFAULT_TTL: u8 = 16;

/// Downward metadata handed from L4 into L3.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub tos: u8,
    pub ttl: u8,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            tos: DEFAULT_TOS,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Upward metadata handed from L3 into L4 alongside a reassembled payload.
#[derive(Debug, Clone, Copy)]
pub struct DatagramMeta {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

/// An L2 endpoint: frames go down into it, and it exposes the adapter the
/// physical links attach to.
pub trait L2Protocol: Send + Sync {
    /// Maximum payload this interface will frame.
    fn mtu(&self) -> usize;

    /// The adapter this interface sits atop.
    fn adapter(&self) -> &Arc<EthernetAdapter>;

    /// Frame `payload` for `dst_mac` under `ethertype` and queue it on the
    /// adapter.
    fn send_down(&self, payload: &[u8], dst_mac: MacAddr, ethertype: [u8; 2]);
}

/// An L3 engine reachable both from below (parsed frames) and above
/// (segments to emit).
pub trait L3Protocol: Send + Sync {
    /// The EtherType this protocol registers under at L2.
    fn identifier(&self) -> [u8; 2];

    /// Emit `segment` toward `dst_addr` on behalf of the L4 protocol
    /// identified by `l4_protocol`.
    fn send_down(&self, segment: &[u8], dst_addr: Ipv4Addr, options: SendOptions, l4_protocol: u8);

    /// Accept a packet parsed out of a frame by `source`.
    fn send_up(&self, packet: &[u8], source: &Arc<dyn L2Protocol>);
}

/// An L4 protocol registered with an L3 engine.
pub trait L4Protocol: Send + Sync {
    /// The protocol byte this transport registers under at L3.
    fn identifier(&self) -> u8;

    /// Accept a reassembled segment and its addressing metadata.
    fn send_up(&self, segment: &[u8], meta: DatagramMeta);
}

/// Consumer of raw frames ahead of normal L2 demux (bridges).
pub trait FrameConsumer: Send + Sync {
    fn receive(&self, frame: &[u8], sender: &Arc<crate::ethernet::Ethernet>);
}

/// Consumer of raw packets ahead of normal L3 handling (NAT gateways).
pub trait PacketConsumer: Send + Sync {
    fn receive(&self, packet: &[u8], source: &Arc<dyn L2Protocol>);
}

/// Longest-prefix route lookup, injected into every L3 engine.
pub trait RouteProvider: Send + Sync {
    /// Next-hop address for `addr`, or `None` when no route matches.
    fn gateway_for(&self, addr: Ipv4Addr) -> Option<Ipv4Addr>;

    /// Index of the interface `addr` is reachable through.
    fn interface_for(&self, addr: Ipv4Addr) -> Option<usize>;
}

/// Static address resolution (the simulator's stand-in for ARP).
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, addr: Ipv4Addr) -> Option<MacAddr>;
}

/// Failure to claim a transport port.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("port {0} already in use")]
    PortInUse(u16),
}
