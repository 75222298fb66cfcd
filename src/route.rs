//! Static route and address-resolution providers.
//!
//! Dynamic routing protocols are out of scope, so the L3 engines consume
//! routes and MAC mappings through the [`RouteProvider`] and
//! [`AddressResolver`] seams and the network administrator (the test, in
//! practice) fills static tables by hand.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::protocol::{AddressResolver, Ipv4Addr, MacAddr, RouteProvider};

/// A routing prefix: 4 address bytes plus a mask width.
///
/// Only whole-byte masks (0, 8, 16, 24, 32) are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub address: Ipv4Addr,
    pub mask: u8,
}

impl Cidr {
    /// The match-everything prefix `0.0.0.0/0`.
    pub const DEFAULT_ROUTE: Cidr = Cidr {
        address: [0, 0, 0, 0],
        mask: 0,
    };

    pub fn new(address: Ipv4Addr, mask: u8) -> Self {
        debug_assert!(mask % 8 == 0 && mask <= 32, "mask must be one of 0/8/16/24/32");
        Self { address, mask }
    }

    /// Prefix match over the mask's whole bytes.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let bytes = usize::from(self.mask / 8);
        self.address[..bytes] == addr[..bytes]
    }
}

struct RouteEntry {
    cidr: Cidr,
    gateway: Ipv4Addr,
    interface: usize,
}

/// Routing table scanned in insertion order; the first prefix match wins,
/// so the default route belongs last.
#[derive(Default)]
pub struct StaticRouteProvider {
    entries: Mutex<Vec<RouteEntry>>,
}

impl StaticRouteProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cidr: Cidr, gateway: Ipv4Addr, interface: usize) {
        self.entries.lock().unwrap().push(RouteEntry {
            cidr,
            gateway,
            interface,
        });
    }

    fn find<T>(&self, addr: Ipv4Addr, pick: impl Fn(&RouteEntry) -> T) -> Option<T> {
        let entries = self.entries.lock().unwrap();
        entries.iter().find(|e| e.cidr.contains(addr)).map(pick)
    }
}

impl RouteProvider for StaticRouteProvider {
    fn gateway_for(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.find(addr, |e| e.gateway)
    }

    fn interface_for(&self, addr: Ipv4Addr) -> Option<usize> {
        self.find(addr, |e| e.interface)
    }
}

/// Direct IP→MAC map standing in for address resolution.
#[derive(Default)]
pub struct StaticAddressResolver {
    table: Mutex<HashMap<Ipv4Addr, MacAddr>>,
}

impl StaticAddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, addr: Ipv4Addr, mac: MacAddr) {
        self.table.lock().unwrap().insert(addr, mac);
    }
}

impl AddressResolver for StaticAddressResolver {
    fn resolve(&self, addr: Ipv4Addr) -> Option<MacAddr> {
        self.table.lock().unwrap().get(&addr).copied()
    }
}
