//! End-to-end TCP transfer over a simulated duplex link.
//!
//! Same two-host topology as the UDP tests. The interesting parts here are
//! the ones UDP cannot show: the blocking accept/connect handshake, ordered
//! byte-stream delivery across multiple sends (with stop-and-wait
//! retransmissions happening underneath, since the link's round trip is
//! longer than the retransmit period), and the four-way teardown.

use std::sync::Arc;
use std::time::Duration;

use netsim::clock::{Clock, ClockConfig};
use netsim::link::{DuplexLink, LinkConfig};
use netsim::node::Node;
use netsim::protocol::{Ipv4Addr, MacAddr};
use netsim::route::Cidr;
use netsim::socket::{Socket, AF_INET, SOCK_STREAM};
use netsim::tcp::ConnectionState;

const HOST_A: Ipv4Addr = [10, 0, 0, 1];
const HOST_B: Ipv4Addr = [10, 0, 0, 2];
const MAC_A: MacAddr = [0x02, 0, 0, 0, 0, 0x01];
const MAC_B: MacAddr = [0x02, 0, 0, 0, 0, 0x02];

const LINK: LinkConfig = LinkConfig {
    length: 100,
    data_rate: 100_000_000,
    byte_error_rate: 0.0,
};

fn two_hosts() -> (Arc<Clock>, Arc<Node>, Arc<Node>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Clock::new(ClockConfig::default());

    let a = Node::new(MAC_A, HOST_A);
    let b = Node::new(MAC_B, HOST_B);

    a.add_route(Cidr::DEFAULT_ROUTE, HOST_B);
    a.add_address(HOST_B, MAC_B);
    b.add_route(Cidr::DEFAULT_ROUTE, HOST_A);
    b.add_address(HOST_A, MAC_A);

    DuplexLink::new(LINK, a.adapter().clone(), b.adapter().clone(), &clock);

    clock.start();
    a.turn_on();
    b.turn_on();
    (clock, a, b)
}

/// Read from `socket` until `expected` bytes arrive or `seconds` elapse.
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
async fn stream_delivers_in_order_and_tears_down() {
    let (_clock, a, b) = two_hosts();

    let listener = b.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    listener.bind([0, 0, 0, 0], 80).unwrap();
    listener.listen(1).unwrap();
    let accept = tokio::spawn(async move {
        let accepted = listener.accept().await;
        (listener, accepted)
    });

    let client = a.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    tokio::time::timeout(Duration::from_secs(60), client.connect(HOST_B, 80))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let (_listener, accepted) = tokio::time::timeout(Duration::from_secs(60), accept)
        .await
        .expect("accept timed out")
        .unwrap();
    let server = accepted.expect("accept failed");

    // Two application writes a second apart; the stream must deliver their
    // exact concatenation.
    client.send(b"this_is_a_test").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.send(b"hope_this_works").unwrap();

    let expected = b"this_is_a_testhope_this_works";
    let received = read_exactly(&server, expected.len(), 60).await;
    assert_eq!(received, expected.to_vec());

    // Wait out the in-flight ACKs, then close from the client side.
    tokio::time::sleep(Duration::from_secs(5)).await;
    client.close();

    // The server side must see the connection leave Established within
    // two seconds of the close landing.
    let server_conn = server.connection().unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_ne!(server_conn.state(), ConnectionState::Established);

    // And the four-way teardown must finish on both ends.
    let client_conn = client.connection().unwrap();
    for _ in 0..100 {
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

#[tokio::test(start_paused = true)]
async fn connect_to_a_closed_port_never_establishes() {
    let (_clock, a, b) = two_hosts();

    // B has a listener on 80 only; A aims at 81.
    let listener = b.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    listener.bind([0, 0, 0, 0], 80).unwrap();
    listener.listen(1).unwrap();

    let client = a.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    let attempt =
        tokio::time::timeout(Duration::from_secs(10), client.connect(HOST_B, 81)).await;
    assert!(attempt.is_err(), "connect to a closed port should hang");
}

#[tokio::test(start_paused = true)]
async fn two_clients_share_one_listener() {
    let (_clock, a, b) = two_hosts();

    let listener = Arc::new(b.socket(AF_INET, SOCK_STREAM, 0).unwrap());
    listener.bind([0, 0, 0, 0], 80).unwrap();
    listener.listen(2).unwrap();

    let acceptor = {
        let listener = listener.clone();
        tokio::spawn(async move {
            let first = listener.accept().await.unwrap();
            let second = listener.accept().await.unwrap();
            (first, second)
        })
    };

    let client1 = a.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    tokio::time::timeout(Duration::from_secs(60), client1.connect(HOST_B, 80))
        .await
        .expect("first connect timed out")
        .expect("first connect failed");

    let client2 = a.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    tokio::time::timeout(Duration::from_secs(60), client2.connect(HOST_B, 80))
        .await
        .expect("second connect timed out")
        .expect("second connect failed");

    let (first, second) = tokio::time::timeout(Duration::from_secs(60), acceptor)
        .await
        .expect("accepts timed out")
        .unwrap();

    client1.send(b"from_one").unwrap();
    client2.send(b"from_two").unwrap();

    let mut got_one = read_exactly(&first, 8, 60).await;
    let mut got_two = read_exactly(&second, 8, 60).await;
    // Accept order follows SYN arrival order; both must arrive intact.
    if got_one != b"from_one" {
        std::mem::swap(&mut got_one, &mut got_two);
    }
    assert_eq!(got_one, b"from_one");
    assert_eq!(got_two, b"from_two");
}
