//! A multi-interface L3 forwarder.
//!
//! A router is one IP engine in forwarding mode with an adapter/Ethernet
//! pair per interface. All the work happens in the engine's upward path:
//! TTL decrement, checksum recompute, egress lookup, U-turn suppression.
//! Route learning is out of scope — the injected [`RouteProvider`] is the
//! routing algorithm, and the provided static tables play the part of a
//! network administrator.

use std::sync::Arc;

use crate::adapter::EthernetAdapter;
use crate::ethernet::{Ethernet, DEFAULT_MTU};
use crate::ip::Ip;
use crate::protocol::{AddressResolver, Ipv4Addr, L2Protocol, L3Protocol, MacAddr, RouteProvider};

pub struct Router {
    ip: Arc<Ip>,
    ports: Vec<Arc<Ethernet>>,
}

impl Router {
    /// Build a router with one interface per `(mac, address)` pair.
    pub fn new(
        macs: &[MacAddr],
        addresses: &[Ipv4Addr],
        routes: Arc<dyn RouteProvider>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Arc<Self> {
        Self::with_mtu(macs, addresses, routes, resolver, DEFAULT_MTU)
    }

    /// Same, with every interface framing at most `mtu` payload bytes.
    pub fn with_mtu(
        macs: &[MacAddr],
        addresses: &[Ipv4Addr],
        routes: Arc<dyn RouteProvider>,
        resolver: Arc<dyn AddressResolver>,
        mtu: usize,
    ) -> Arc<Self> {
        assert_eq!(macs.len(), addresses.len(), "one MAC per interface address");

        let ip = Ip::new(addresses, true, routes, resolver);
        let ports: Vec<Arc<Ethernet>> = macs
            .iter()
            .enumerate()
            .map(|(i, mac)| {
                let ethernet = Ethernet::with_mtu(EthernetAdapter::new(*mac, false), mtu);
                ethernet.add_l3_protocol(&(ip.clone() as Arc<dyn L3Protocol>));
                ip.set_l2_for_interface(i, ethernet.clone());
                ethernet
            })
            .collect();

        Arc::new(Self { ip, ports })
    }

    pub fn port(&self, index: usize) -> &Arc<Ethernet> {
        &self.ports[index]
    }

    pub fn ip(&self) -> &Arc<Ip> {
        &self.ip
    }

    pub fn turn_on(&self) {
        for port in &self.ports {
            port.adapter().turn_on();
        }
    }

    pub fn turn_off(&self) {
        for port in &self.ports {
            port.adapter().turn_off();
        }
    }
}
