//! TCP through a NAT gateway.
//!
//! Topology:
//!
//! ```text
//!  10.0.0.2 ◀────▶ NAT {10.0.0.1 | 201.31.0.1} ◀────▶ 201.31.0.2
//!  (private)                                           (public)
//! ```
//!
//! The private host connects out to a public server. On the public side
//! every segment must appear to come from the gateway's public address and
//! its allocated port; the server's replies, addressed to that port, must
//! be translated back to the private endpoint — the handshake completing
//! at all proves the reverse path, and the payload plus teardown prove it
//! keeps working under load.

use std::sync::Arc;
use std::time::Duration;

use netsim::clock::{Clock, ClockConfig};
use netsim::link::{DuplexLink, LinkConfig};
use netsim::nat::NatGateway;
use netsim::node::Node;
use netsim::protocol::{Ipv4Addr, L2Protocol, MacAddr};
use netsim::route::{Cidr, StaticAddressResolver, StaticRouteProvider};
use netsim::socket::{Socket, AF_INET, SOCK_STREAM};
use netsim::tcp::ConnectionState;

const PRIVATE_HOST: Ipv4Addr = [10, 0, 0, 2];
const PUBLIC_HOST: Ipv4Addr = [201, 31, 0, 2];
const NAT_PRIVATE: Ipv4Addr = [10, 0, 0, 1];
const NAT_PUBLIC: Ipv4Addr = [201, 31, 0, 1];

const PRIVATE_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x01];
const PUBLIC_MAC: MacAddr = [0x02, 0, 0, 0, 0, 0x02];
const NAT_MAC_PRIVATE: MacAddr = [0x02, 0, 0, 0, 0, 0x11];
const NAT_MAC_PUBLIC: MacAddr = [0x02, 0, 0, 0, 0, 0x12];

const LINK: LinkConfig = LinkConfig {
    length: 100,
    data_rate: 100_000_000,
    byte_error_rate: 0.0,
};

fn natted_topology() -> (Arc<Clock>, Arc<Node>, Arc<Node>, Arc<NatGateway>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Clock::new(ClockConfig::default());

    let private = Node::new(PRIVATE_MAC, PRIVATE_HOST);
    private.add_route(Cidr::DEFAULT_ROUTE, NAT_PRIVATE);
    private.add_address(NAT_PRIVATE, NAT_MAC_PRIVATE);

    let public = Node::new(PUBLIC_MAC, PUBLIC_HOST);
    public.add_route(Cidr::DEFAULT_ROUTE, NAT_PUBLIC);
    public.add_address(NAT_PUBLIC, NAT_MAC_PUBLIC);

    let routes = Arc::new(StaticRouteProvider::new());
    routes.add(Cidr::new([10, 0, 0, 0], 24), PRIVATE_HOST, 0);
    routes.add(Cidr::DEFAULT_ROUTE, PUBLIC_HOST, 1);
    let resolver = Arc::new(StaticAddressResolver::new());
    resolver.add(PRIVATE_HOST, PRIVATE_MAC);
    resolver.add(PUBLIC_HOST, PUBLIC_MAC);

    let gateway = NatGateway::new(
        &[NAT_MAC_PRIVATE, NAT_MAC_PUBLIC],
        &[NAT_PRIVATE, NAT_PUBLIC],
        routes,
        resolver,
    );

    DuplexLink::new(
        LINK,
        private.adapter().clone(),
        gateway.port(0).adapter().clone(),
        &clock,
    );
    DuplexLink::new(
        LINK,
        public.adapter().clone(),
        gateway.port(1).adapter().clone(),
        &clock,
    );

    clock.start();
    private.turn_on();
    public.turn_on();
    gateway.turn_on();

    (clock, private, public, gateway)
}

async fn read_exactly(socket: &Socket, expected: usize, seconds: u64) -> Vec<u8> {
    let mut received = Vec::new();
    for _ in 0..seconds * 10 {
        if let Some(data) = socket.recv(expected - received.len()) {
            received.extend_from_slice(&data);
        }
        if received.len() >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    received
}

#[tokio::test(start_paused = true)]
async fn private_client_reaches_public_server_through_translation() {
    let (_clock, private, public, _gateway) = natted_topology();

    let listener = public.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    listener.bind([0, 0, 0, 0], 80).unwrap();
    listener.listen(1).unwrap();
    let accept = tokio::spawn(async move {
        let accepted = listener.accept().await;
        (listener, accepted)
    });

    let client = private.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    tokio::time::timeout(Duration::from_secs(120), client.connect(PUBLIC_HOST, 80))
        .await
        .expect("connect through NAT timed out")
        .expect("connect through NAT failed");

    let (_listener, accepted) = tokio::time::timeout(Duration::from_secs(120), accept)
        .await
        .expect("accept timed out")
        .unwrap();
    let server = accepted.expect("accept failed");

    // The server must see the gateway's public face, not the private host.
    let server_conn = server.connection().unwrap();
    assert_eq!(server_conn.remote_addr(), NAT_PUBLIC);
    // First mapping the gateway hands out is the lowest free port: 0.
    assert_eq!(server_conn.remote_port(), 0);

    client.send(b"Hello").unwrap();
    let received = read_exactly(&server, 5, 120).await;
    assert_eq!(received, b"Hello");

    // Replies ride the reverse translation back in.
    server.send(b"World").unwrap();
    let reply = read_exactly(&client, 5, 120).await;
    assert_eq!(reply, b"World");

    // Teardown crosses the gateway in both directions too.
    client.close();
    let client_conn = client.connection().unwrap();
    for _ in 0..600 {
        if client_conn.state() == ConnectionState::TeardownAcked
            && server_conn.state() == ConnectionState::TeardownAcked
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(client_conn.state(), ConnectionState::TeardownAcked);
    assert_eq!(server_conn.state(), ConnectionState::TeardownAcked);
}
