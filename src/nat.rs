//! A NAT gateway: a router that rewrites private source endpoints.
//!
//! The gateway shares the router's chassis — one IP engine, one
//! adapter/Ethernet per interface — but its engine runs with forwarding
//! *off* and the gateway itself installed as the raw packet tap, so every
//! packet the engine hears passes through [`NatGateway::receive`] where
//! translation and forwarding happen together.
//!
//! Forward direction (private source, public destination): the source
//! endpoint `(addr, port)` is mapped to a gateway-allocated port, the
//! packet's source address becomes the egress interface's address, and the
//! L4 checksum is recomputed. Reverse direction (non-private source): the
//! destination port indexes the reverse table; on a hit the destination
//! endpoint is rewritten back to the private original, on a miss the
//! packet passes through untranslated and usually dies upstream.
//!
//! Port allocation takes the lowest free port; nothing is ever evicted,
//! since a simulation will not exhaust 65536 mappings. The reverse
//! predicate (*any* non-private source) can false-positive on
//! private-to-private traffic transiting the gateway; this matches the
//! translation tables' intent and is kept as a known limitation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::adapter::EthernetAdapter;
use crate::ethernet::Ethernet;
use crate::ip::{Ip, IP_HEADER_LEN};
use crate::protocol::{
    AddressResolver, Ipv4Addr, L2Protocol, L3Protocol, MacAddr, PacketConsumer, RouteProvider,
    ETHERTYPE_IPV4, IPPROTO_TCP,
};
use crate::tcp::TCP_HEADER_LEN;
use crate::udp::UDP_HEADER_LEN;
use crate::util::{checksum, fmt_ip};

// L3 header offsets reused during rewriting.
const OFF_TTL: usize = 9;
const OFF_PROTO: usize = 10;
const OFF_CHECKSUM: usize = 11;
const OFF_SRC: usize = 12;
const OFF_DST: usize = 16;

// L4 offsets relative to the start of the segment.
const OFF_L4_SRC_PORT: usize = 0;
const OFF_L4_DST_PORT: usize = 2;
const OFF_TCP_CHECKSUM: usize = 13;
const OFF_UDP_CHECKSUM: usize = 6;

/// One private endpoint on the inside of the gateway.
type PrivateEndpoint = (Ipv4Addr, u16);

struct NatTable {
    /// Private endpoint → allocated public port.
    by_endpoint: HashMap<PrivateEndpoint, u16>,
    /// Allocated public port → private endpoint.
    by_port: HashMap<u16, PrivateEndpoint>,
}

pub struct NatGateway {
    ip: Arc<Ip>,
    ports: Vec<Arc<Ethernet>>,
    routes: Arc<dyn RouteProvider>,
    resolver: Arc<dyn AddressResolver>,
    table: Mutex<NatTable>,
}

impl NatGateway {
    /// Build a gateway with one interface per `(mac, address)` pair.
    pub fn new(
        macs: &[MacAddr],
        addresses: &[Ipv4Addr],
        routes: Arc<dyn RouteProvider>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Arc<Self> {
        assert_eq!(macs.len(), addresses.len(), "one MAC per interface address");

        Arc::new_cyclic(|weak: &Weak<NatGateway>| {
            let ip = Ip::new(addresses, false, routes.clone(), resolver.clone());
            ip.set_raw_consumer(weak.clone() as Weak<dyn PacketConsumer>);

            let ports: Vec<Arc<Ethernet>> = macs
                .iter()
                .enumerate()
                .map(|(i, mac)| {
                    let ethernet = Ethernet::new(EthernetAdapter::new(*mac, false));
                    ethernet.add_l3_protocol(&(ip.clone() as Arc<dyn L3Protocol>));
                    ip.set_l2_for_interface(i, ethernet.clone());
                    ethernet
                })
                .collect();

            NatGateway {
                ip,
                ports,
                routes,
                resolver,
                table: Mutex::new(NatTable {
                    by_endpoint: HashMap::new(),
                    by_port: HashMap::new(),
                }),
            }
        })
    }

    pub fn port(&self, index: usize) -> &Arc<Ethernet> {
        &self.ports[index]
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

    /// RFC1918 test: 10/8, 172.16/12, 192.168/16.
    fn is_private(addr: Ipv4Addr) -> bool {
        addr[0] == 10
            || (addr[0] == 172 && (16..=31).contains(&addr[1]))
            || (addr[0] == 192 && addr[1] == 168)
    }

    /// Lowest free public port.
    fn allocate_port(table: &NatTable) -> u16 {
        (0..=u16::MAX)
            .find(|p| !table.by_port.contains_key(p))
            .unwrap_or(0)
    }

    /// Zero-and-recompute the L4 checksum after a header rewrite.
    fn fix_l4_checksum(packet: &mut [u8]) {
        let offset = if packet[OFF_PROTO] == IPPROTO_TCP {
            IP_HEADER_LEN + OFF_TCP_CHECKSUM
        } else {
            IP_HEADER_LEN + OFF_UDP_CHECKSUM
        };
        packet[offset] = 0;
        packet[offset] = checksum(&packet[IP_HEADER_LEN..]);
    }

    fn segment_src_port(packet: &[u8]) -> u16 {
        let o = IP_HEADER_LEN + OFF_L4_SRC_PORT;
        u16::from_be_bytes([packet[o], packet[o + 1]])
    }

    fn segment_dst_port(packet: &[u8]) -> u16 {
        let o = IP_HEADER_LEN + OFF_L4_DST_PORT;
        u16::from_be_bytes([packet[o], packet[o + 1]])
    }
}

impl PacketConsumer for NatGateway {
    /// Translate and forward one packet the engine heard.
    fn receive(&self, packet: &[u8], source: &Arc<dyn L2Protocol>) {
        // Rewriting touches the L4 checksum byte, so the whole transport
        // header must be present before anything else happens.
        let l4_header = if packet[OFF_PROTO] == IPPROTO_TCP {
            TCP_HEADER_LEN
        } else {
            UDP_HEADER_LEN
        };
        if packet.len() < IP_HEADER_LEN + l4_header {
            log::debug!("[nat] segment too short to translate, dropping");
            return;
        }
        let mut packet = packet.to_vec();

        let ttl = packet[OFF_TTL].saturating_sub(1);
        if ttl == 0 {
            log::debug!("[nat] ttl exhausted, dropping");
            return;
        }
        packet[OFF_TTL] = ttl;

        let src: Ipv4Addr = packet[OFF_SRC..OFF_SRC + 4].try_into().unwrap();
        let mut dst: Ipv4Addr = packet[OFF_DST..OFF_DST + 4].try_into().unwrap();
        let Some(mut egress) = self.routes.interface_for(dst) else {
            log::debug!("[nat] no route to {}, dropping", fmt_ip(&dst));
            return;
        };

        if Self::is_private(src) && !Self::is_private(dst) {
            // Outbound: replace the private source endpoint.
            let src_port = Self::segment_src_port(&packet);
            let mapped = {
                let mut table = self.table.lock().unwrap();
                match table.by_endpoint.get(&(src, src_port)).copied() {
                    Some(port) => port,
                    None => {
                        let port = Self::allocate_port(&table);
                        table.by_endpoint.insert((src, src_port), port);
                        table.by_port.insert(port, (src, src_port));
                        log::debug!(
                            "[nat] mapped {}:{src_port} → port {port}",
                            fmt_ip(&src)
                        );
                        port
                    }
                }
            };

            let public = self.ip.address_for_interface(egress);
            packet[OFF_SRC..OFF_SRC + 4].copy_from_slice(&public);
            let o = IP_HEADER_LEN + OFF_L4_SRC_PORT;
            packet[o..o + 2].copy_from_slice(&mapped.to_be_bytes());
            Self::fix_l4_checksum(&mut packet);
        }

        // A forward-translated packet re-enters this predicate with its new
        // public source; its destination port only hits the reverse table
        // once that port number has been handed out as a mapping.
        let src_now: Ipv4Addr = packet[OFF_SRC..OFF_SRC + 4].try_into().unwrap();
        if !Self::is_private(src_now) {
            // Inbound: map the destination port back to a private endpoint.
            let dst_port = Self::segment_dst_port(&packet);
            let mapping = self.table.lock().unwrap().by_port.get(&dst_port).copied();
            if let Some((private_addr, private_port)) = mapping {
                dst = private_addr;
                let Some(inside) = self.routes.interface_for(dst) else {
                    log::debug!("[nat] no route back to {}, dropping", fmt_ip(&dst));
                    return;
                };
                egress = inside;

                packet[OFF_DST..OFF_DST + 4].copy_from_slice(&private_addr);
                let o = IP_HEADER_LEN + OFF_L4_DST_PORT;
                packet[o..o + 2].copy_from_slice(&private_port.to_be_bytes());
                Self::fix_l4_checksum(&mut packet);
                log::debug!(
                    "[nat] port {dst_port} → {}:{private_port}",
                    fmt_ip(&private_addr)
                );
            }
        }

        packet[OFF_CHECKSUM] = 0;
        packet[OFF_CHECKSUM] = checksum(&packet[..IP_HEADER_LEN]);

        if Some(egress) == self.ip.interface_of(source) {
            log::debug!("[nat] egress equals ingress, dropping");
            return;
        }
        let Some(gateway) = self.routes.gateway_for(dst) else {
            log::debug!("[nat] no gateway for {}, dropping", fmt_ip(&dst));
            return;
        };
        let Some(mac) = self.resolver.resolve(gateway) else {
            log::debug!("[nat] cannot resolve {}, dropping", fmt_ip(&gateway));
            return;
        };
        let Some(l2) = self.ip.l2_for_interface(egress) else {
            return;
        };
        l2.send_down(&packet, mac, ETHERTYPE_IPV4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Cidr, StaticAddressResolver, StaticRouteProvider};

    #[test]
    fn private_predicate_covers_all_three_ranges() {
        assert!(NatGateway::is_private([10, 1, 2, 3]));
        assert!(NatGateway::is_private([172, 16, 0, 1]));
        assert!(NatGateway::is_private([172, 31, 255, 255]));
        assert!(NatGateway::is_private([192, 168, 4, 4]));

        assert!(!NatGateway::is_private([172, 15, 0, 1]));
        assert!(!NatGateway::is_private([172, 32, 0, 1]));
        assert!(!NatGateway::is_private([192, 169, 0, 1]));
        assert!(!NatGateway::is_private([201, 31, 0, 2]));
        assert!(!NatGateway::is_private([8, 8, 8, 8]));
    }

    #[test]
    fn port_allocation_takes_lowest_free() {
        let mut table = NatTable {
            by_endpoint: HashMap::new(),
            by_port: HashMap::new(),
        };
        assert_eq!(NatGateway::allocate_port(&table), 0);
        table.by_port.insert(0, ([10, 0, 0, 2], 5000));
        table.by_port.insert(1, ([10, 0, 0, 3], 5000));
        assert_eq!(NatGateway::allocate_port(&table), 2);
    }

    #[tokio::test]
    async fn truncated_segment_is_dropped_not_translated() {
        let routes = Arc::new(StaticRouteProvider::new());
        routes.add(Cidr::new([10, 0, 0, 0], 24), [10, 0, 0, 2], 0);
        routes.add(Cidr::DEFAULT_ROUTE, [201, 31, 0, 2], 1);
        let resolver = Arc::new(StaticAddressResolver::new());
        resolver.add([10, 0, 0, 2], [0x02, 0, 0, 0, 0, 0x01]);
        resolver.add([201, 31, 0, 2], [0x02, 0, 0, 0, 0, 0x02]);

        let gateway = NatGateway::new(
            &[[0x02, 0, 0, 0, 0, 0x10], [0x02, 0, 0, 0, 0, 0x11]],
            &[[10, 0, 0, 1], [201, 31, 0, 1]],
            routes,
            resolver,
        );
        gateway.turn_on();

        // A TCP packet carrying only 4 segment bytes: the ports are there
        // but the checksum byte is not.
        let short = {
            let mut p = vec![4, 0];
            p.extend_from_slice(&24u16.to_be_bytes());
            p.extend_from_slice(&[0, 0]); // ident
            p.push(1); // flags: last
            p.extend_from_slice(&[0, 0]); // offset
            p.push(16); // ttl
            p.push(0x06); // tcp
            p.push(0);
            p.extend_from_slice(&[10, 0, 0, 2]);
            p.extend_from_slice(&[201, 31, 0, 2]);
            p.extend_from_slice(&5000u16.to_be_bytes());
            p.extend_from_slice(&80u16.to_be_bytes());
            p[11] = checksum(&p[..20]);
            p
        };

        let inside: Arc<dyn L2Protocol> = gateway.port(0).clone();
        gateway.receive(&short, &inside);

        assert!(gateway.table.lock().unwrap().by_port.is_empty());
        assert_eq!(gateway.port(1).adapter().pull_byte(), None);
    }

    #[tokio::test]
    async fn forward_then_reverse_translation_round_trips() {
        let routes = Arc::new(StaticRouteProvider::new());
        routes.add(Cidr::new([10, 0, 0, 0], 24), [10, 0, 0, 2], 0);
        routes.add(Cidr::DEFAULT_ROUTE, [201, 31, 0, 2], 1);
        let resolver = Arc::new(StaticAddressResolver::new());
        resolver.add([10, 0, 0, 2], [0x02, 0, 0, 0, 0, 0x01]);
        resolver.add([201, 31, 0, 2], [0x02, 0, 0, 0, 0, 0x02]);

        let gateway = NatGateway::new(
            &[[0x02, 0, 0, 0, 0, 0x10], [0x02, 0, 0, 0, 0, 0x11]],
            &[[10, 0, 0, 1], [201, 31, 0, 1]],
            routes,
            resolver,
        );
        gateway.turn_on();

        // Outbound UDP packet: 10.0.0.2:5000 → 201.31.0.2:80.
        let segment = {
            let mut s = Vec::new();
            s.extend_from_slice(&5000u16.to_be_bytes());
            s.extend_from_slice(&80u16.to_be_bytes());
            s.extend_from_slice(&12u16.to_be_bytes());
            s.push(0);
            s.extend_from_slice(b"hello");
            s[6] = checksum(&s);
            s
        };
        let outbound = {
            let mut p = vec![4, 0];
            p.extend_from_slice(&((20 + segment.len()) as u16).to_be_bytes());
            p.extend_from_slice(&[0, 0]); // ident
            p.push(1); // flags: last
            p.extend_from_slice(&[0, 0]); // offset
            p.push(16); // ttl
            p.push(0x11); // udp
            p.push(0);
            p.extend_from_slice(&[10, 0, 0, 2]);
            p.extend_from_slice(&[201, 31, 0, 2]);
            p.extend_from_slice(&segment);
            p[11] = checksum(&p[..20]);
            p
        };

        let inside: Arc<dyn L2Protocol> = gateway.port(0).clone();
        gateway.receive(&outbound, &inside);

        // The translated packet left through port 1.
        let translated = {
            let mut bytes = Vec::new();
            let adapter = gateway.port(1).adapter();
            while let Some(b) = adapter.pull_byte() {
                bytes.push(b);
            }
            assert!(!bytes.is_empty(), "nothing forwarded out the public port");
            // Strip the ethernet framing: preamble..payload..checksum.
            bytes[24..bytes.len() - 1].to_vec()
        };

        assert_eq!(&translated[OFF_SRC..OFF_SRC + 4], &[201, 31, 0, 1]);
        assert_eq!(translated[OFF_TTL], 15);
        let mapped_port = NatGateway::segment_src_port(&translated);
        assert_eq!(
            gateway.table.lock().unwrap().by_port.get(&mapped_port),
            Some(&([10, 0, 0, 2], 5000u16))
        );

        // Build the reply: 201.31.0.2:80 → 201.31.0.1:mapped.
        let reply_segment = {
            let mut s = Vec::new();
            s.extend_from_slice(&80u16.to_be_bytes());
            s.extend_from_slice(&mapped_port.to_be_bytes());
            s.extend_from_slice(&10u16.to_be_bytes());
            s.push(0);
            s.extend_from_slice(b"ack");
            s[6] = checksum(&s);
            s
        };
        let inbound = {
            let mut p = vec![4, 0];
            p.extend_from_slice(&((20 + reply_segment.len()) as u16).to_be_bytes());
            p.extend_from_slice(&[0, 0]);
            p.push(1);
            p.extend_from_slice(&[0, 0]);
            p.push(16);
            p.push(0x11);
            p.push(0);
            p.extend_from_slice(&[201, 31, 0, 2]);
            p.extend_from_slice(&[201, 31, 0, 1]);
            p.extend_from_slice(&reply_segment);
            p[11] = checksum(&p[..20]);
            p
        };

        let outside: Arc<dyn L2Protocol> = gateway.port(1).clone();
        gateway.receive(&inbound, &outside);

        let returned = {
            let mut bytes = Vec::new();
            let adapter = gateway.port(0).adapter();
            while let Some(b) = adapter.pull_byte() {
                bytes.push(b);
            }
            assert!(!bytes.is_empty(), "nothing forwarded back inside");
            bytes[24..bytes.len() - 1].to_vec()
        };

        assert_eq!(&returned[OFF_DST..OFF_DST + 4], &[10, 0, 0, 2]);
        assert_eq!(NatGateway::segment_dst_port(&returned), 5000);
    }
}
