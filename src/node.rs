//! An end host: the full stack assembled into one device.
//!
//! A [`Node`] owns one adapter, one Ethernet, an IP engine with a single
//! interface, and both transports, wired the way every host in a topology
//! needs them. Its static route and address tables are filled by the
//! topology code (`add_route`, `add_address`), and sockets reach the
//! transports through the [`Host`] impl.

use std::sync::Arc;

use crate::adapter::EthernetAdapter;
use crate::ethernet::{Ethernet, DEFAULT_MTU};
use crate::ip::Ip;
use crate::protocol::{Ipv4Addr, L3Protocol, L4Protocol, MacAddr};
use crate::route::{Cidr, StaticAddressResolver, StaticRouteProvider};
use crate::socket::{Host, Socket, SocketError};
use crate::tcp::Tcp;
use crate::udp::Udp;

pub struct Node {
    self_ref: std::sync::Weak<Node>,
    adapter: Arc<EthernetAdapter>,
    ethernet: Arc<Ethernet>,
    ip: Arc<Ip>,
    udp: Arc<Udp>,
    tcp: Arc<Tcp>,
    routes: Arc<StaticRouteProvider>,
    resolver: Arc<StaticAddressResolver>,
}

impl Node {
    pub fn new(mac: MacAddr, address: Ipv4Addr) -> Arc<Self> {
        Self::with_mtu(mac, address, DEFAULT_MTU)
    }

    /// Build a host whose interface frames at most `mtu` payload bytes.
    pub fn with_mtu(mac: MacAddr, address: Ipv4Addr, mtu: usize) -> Arc<Self> {
        let routes = Arc::new(StaticRouteProvider::new());
        let resolver = Arc::new(StaticAddressResolver::new());

        let adapter = EthernetAdapter::new(mac, false);
        let ethernet = Ethernet::with_mtu(adapter.clone(), mtu);
        let ip = Ip::new(&[address], false, routes.clone(), resolver.clone());
        let udp = Udp::new();
        let tcp = Tcp::new();

        // Wire the stack: IP rides the Ethernet, the transports ride IP.
        ip.set_l2_for_interface(0, ethernet.clone());
        ethernet.add_l3_protocol(&(ip.clone() as Arc<dyn L3Protocol>));
        ip.add_l4_protocol(&(tcp.clone() as Arc<dyn L4Protocol>));
        ip.add_l4_protocol(&(udp.clone() as Arc<dyn L4Protocol>));
        udp.add_l3_protocol(ip.clone());
        tcp.add_l3_protocol(ip.clone());

        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            adapter,
            ethernet,
            ip,
            udp,
            tcp,
            routes,
            resolver,
        })
    }

    /// Add a route; every route leaves through the single interface.
    pub fn add_route(&self, cidr: Cidr, gateway: Ipv4Addr) {
        self.routes.add(cidr, gateway, 0);
    }

    /// Teach the host how to resolve `address` at L2.
    pub fn add_address(&self, address: Ipv4Addr, mac: MacAddr) {
        self.resolver.add(address, mac);
    }

    /// Open a socket on this host.
    pub fn socket(&self, domain: u8, channel: u8, protocol: u8) -> Result<Socket, SocketError> {
        let host = self.self_ref.upgrade().expect("host still alive");
        Socket::new(host, domain, channel, protocol)
    }

    pub fn adapter(&self) -> &Arc<EthernetAdapter> {
        &self.adapter
    }

    pub fn ethernet(&self) -> &Arc<Ethernet> {
        &self.ethernet
    }

    pub fn ip(&self) -> &Arc<Ip> {
        &self.ip
    }

    pub fn turn_on(&self) {
        self.adapter.turn_on();
    }

    pub fn turn_off(&self) {
        self.adapter.turn_off();
    }
}

impl Host for Node {
    fn udp(&self) -> Arc<Udp> {
        self.udp.clone()
    }

    fn tcp(&self) -> Arc<Tcp> {
        self.tcp.clone()
    }
}
