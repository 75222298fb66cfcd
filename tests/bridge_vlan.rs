//! Four hosts on a learning bridge, then VLAN partitioning.
//!
//! Topology: hosts 10.0.0.1..4, each wired to one bridge port by its own
//! duplex link. All ports start as access ports on the default VLAN 0;
//! moving ports into VLAN 1 changes who can hear whom.

use std::sync::Arc;
use std::time::Duration;

use netsim::bridge::Bridge;
use netsim::clock::{Clock, ClockConfig};
use netsim::link::{DuplexLink, LinkConfig};
use netsim::node::Node;
use netsim::protocol::{Ipv4Addr, L2Protocol, MacAddr};
use netsim::route::Cidr;
use netsim::socket::{Socket, AF_INET, SOCK_DGRAM};

const LINK: LinkConfig = LinkConfig {
    length: 100,
    data_rate: 100_000_000,
    byte_error_rate: 0.0,
};

fn host_mac(i: usize) -> MacAddr {
    [0x02, 0, 0, 0, 0xA0, i as u8]
}

fn bridge_mac(i: usize) -> MacAddr {
    [0x02, 0, 0, 0, 0xB0, i as u8]
}

fn host_addr(i: usize) -> Ipv4Addr {
    [10, 0, 0, (i + 1) as u8]
}

/// Four hosts hanging off a four-port bridge, everything powered on.
fn bridged_hosts() -> (Arc<Clock>, Vec<Arc<Node>>, Arc<Bridge>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Clock::new(ClockConfig::default());
    let bridge = Bridge::new(&[bridge_mac(0), bridge_mac(1), bridge_mac(2), bridge_mac(3)]);

    let mut hosts = Vec::new();
    for i in 0..4 {
        let host = Node::new(host_mac(i), host_addr(i));
        // Everyone is on-link: host routes name each peer directly.
        for peer in 0..4 {
            if peer != i {
                host.add_route(Cidr::new(host_addr(peer), 32), host_addr(peer));
                host.add_address(host_addr(peer), host_mac(peer));
            }
        }
        DuplexLink::new(
            LINK,
            host.adapter().clone(),
            bridge.port(i).adapter().clone(),
            &clock,
        );
        hosts.push(host);
    }

    clock.start();
    bridge.turn_on();
    for host in &hosts {
        host.turn_on();
    }
    (clock, hosts, bridge)
}

/// Bind port 80 on `host` and return the socket.
fn listen_udp(host: &Arc<Node>) -> Socket {
    let socket = host.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    socket.bind([0, 0, 0, 0], 80).unwrap();
    socket
}

/// Poll for one datagram for up to `seconds`.
async fn try_recv(socket: &Socket, seconds: u64) -> Option<Vec<u8>> {
    for _ in 0..seconds * 10 {
        if let Some(data) = socket.recv(64) {
            return Some(data);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    None
}

#[tokio::test(start_paused = true)]
async fn flood_then_learned_forwarding() {
    let (_clock, hosts, _bridge) = bridged_hosts();

    let rx0 = listen_udp(&hosts[0]);
    let rx2 = listen_udp(&hosts[2]);

    // Host 0 → host 2: the bridge floods (nothing learned yet) and host 2
    // still receives exactly its copy.
    let tx0 = hosts[0].socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    tx0.send_to(host_addr(2), 80, None, b"flooded").unwrap();
    assert_eq!(try_recv(&rx2, 30).await, Some(b"flooded".to_vec()));

    // Host 2 → host 0: host 0's MAC is in the table now, single-port hit.
    let tx2 = hosts[2].socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    tx2.send_to(host_addr(0), 80, None, b"learned").unwrap();
    assert_eq!(try_recv(&rx0, 30).await, Some(b"learned".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn vlan_membership_gates_delivery() {
    let (_clock, hosts, bridge) = bridged_hosts();

    let rx3 = listen_udp(&hosts[3]);
    let tx1 = hosts[1].socket(AF_INET, SOCK_DGRAM, 0).unwrap();

    // Port 1 moves to VLAN 1; port 3 is still on VLAN 0.
    bridge.add_port_to_vlan(1, 1);

    tx1.send_to(host_addr(3), 80, None, b"into_the_void").unwrap();
    assert_eq!(try_recv(&rx3, 20).await, None, "VLANs must not leak");

    // Port 3 joins VLAN 1: the same send now gets through.
    bridge.add_port_to_vlan(3, 1);

    tx1.send_to(host_addr(3), 80, None, b"same_vlan_now").unwrap();
    assert_eq!(try_recv(&rx3, 30).await, Some(b"same_vlan_now".to_vec()));
}
