//! TCP: a connection-oriented reliable byte stream.
//!
//! Reliability here is the simplest discipline that works: **stop-and-wait**.
//! A connection keeps at most one unacknowledged DATA segment in flight,
//! retransmitting it on a timer until the matching ACK arrives. Real TCP
//! pipelines a sliding window instead; everything else — the three-way
//! handshake, the byte-oriented send/recv surface, the four-way teardown —
//! follows the familiar shape.
//!
//! Segment format:
//!
//! ```text
//! src port(2) | dst port(2) | seq(4) | ack(4) | flags(1) | checksum(1) | payload
//! ```
//!
//! The `flags` byte is one of a fixed set of wire values (see
//! [`SegmentKind`]); unknown values are rejected outright.
//!
//! # Connection lifecycle
//!
//! ```text
//!  initiator                              acceptor
//!  ─────────                              ────────
//!  connect() ── SYN ──────────────▶  binding backlog
//!  SynSent                           accept() dequeues
//!            ◀─────────── SYN+ACK ── SynReceived
//!  ── ACK ───────────────────────▶   Established (+ send loop)
//!  Established (+ send loop)
//!      ⋮        DATA / ACK each way       ⋮
//!  close() ── FIN ────────────────▶
//!  Closing   ◀───────── FIN+ACK ──  Closing
//!  ── ACK ───────────────────────▶  TeardownAcked
//!  TeardownAcked
//! ```
//!
//! `accept` and `connect` block on a per-connection single-shot signal that
//! fires when the handshake lands; the send loop is a task spawned on entry
//! to `Established` that wakes every [`RETRANSMIT_PERIOD`] to drain the
//! outgoing buffer or re-send the segment still awaiting its ACK.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use crate::protocol::{
    BindError, DatagramMeta, Ipv4Addr, L3Protocol, L4Protocol, SendOptions, ANY_ADDR, IPPROTO_TCP,
};
use crate::queue::{ByteQueue, PacketQueue};
use crate::util::{checksum, fmt_ip};

/// Fixed header length.
pub const TCP_HEADER_LEN: usize = 14;

/// Default capacity of each connection's read and write buffers, in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 65536;

/// Send-loop wake period; doubles as the retransmission timeout.
pub const RETRANSMIT_PERIOD: Duration = Duration::from_millis(500);

const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_CHECKSUM: usize = 13;

/// The segment kinds observable on the wire, by their exact flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Payload-bearing segment.
    Data,
    /// Handshake open request.
    Syn,
    /// Teardown request.
    Fin,
    /// Acknowledgement (of handshake, data, or teardown).
    Ack,
    /// Handshake reply.
    SynAck,
    /// Teardown reply.
    FinAck,
}

impl SegmentKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Syn => 2,
            Self::Fin => 4,
            Self::Ack => 8,
            Self::SynAck => 9,
            Self::FinAck => 12,
        }
    }

    fn from_wire(flags: u8) -> Option<Self> {
        match flags {
            0 => Some(Self::Data),
            2 => Some(Self::Syn),
            4 => Some(Self::Fin),
            8 => Some(Self::Ack),
            9 => Some(Self::SynAck),
            12 => Some(Self::FinAck),
            _ => None,
        }
    }
}

/// All states of the connection machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake traffic yet; initial state.
    Closed,
    /// SYN sent; waiting for SYN+ACK.
    SynSent,
    /// SYN+ACK sent; waiting for the closing ACK of the handshake.
    SynReceived,
    /// Handshake complete; data may flow.
    Established,
    /// FIN or FIN+ACK sent; teardown in progress.
    Closing,
    /// Teardown acknowledged; the connection is gone.
    TeardownAcked,
}

/// Stop-and-wait send state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataState {
    /// Nothing in flight; the send loop may emit a new segment.
    Idle,
    /// One DATA segment in flight, held for retransmission.
    AwaitingAck,
}

/// Which end of the handshake this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The TCP engine: a port → binding table over the registered L3s.
pub struct Tcp {
    self_ref: Weak<Tcp>,
    l3_protocols: Mutex<Vec<Arc<dyn L3Protocol>>>,
    bindings: Mutex<HashMap<u16, Arc<TcpBinding>>>,
}

impl Tcp {
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

    /// Claim `port` for a new binding.
    pub fn bind(
        &self,
        addr: Ipv4Addr,
        port: u16,
        network_protocol: [u8; 2],
    ) -> Result<Arc<TcpBinding>, BindError> {
        let mut bindings = self.bindings.lock().unwrap();
        if bindings.contains_key(&port) {
            log::debug!("[tcp] port {port} already in use");
            return Err(BindError::PortInUse(port));
        }
        let binding = Arc::new_cyclic(|weak| TcpBinding {
            self_ref: weak.clone(),
            tcp: self.self_ref.clone(),
            addr,
            port,
            network_protocol,
            listening: AtomicBool::new(false),
            backlog: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
        });
        bindings.insert(port, binding.clone());
        Ok(binding)
    }

    pub fn is_port_in_use(&self, port: u16) -> bool {
        self.bindings.lock().unwrap().contains_key(&port)
    }

    fn find_l3(&self, identifier: [u8; 2]) -> Option<Arc<dyn L3Protocol>> {
        self.l3_protocols
            .lock()
            .unwrap()
            .iter()
            .find(|l3| l3.identifier() == identifier)
            .cloned()
    }

    fn remove_binding(&self, port: u16) {
        self.bindings.lock().unwrap().remove(&port);
    }

    fn valid_checksum(segment: &[u8]) -> bool {
        let actual = segment[OFF_CHECKSUM];
        checksum(segment).wrapping_sub(actual) == actual
    }
}

impl L4Protocol for Tcp {
    fn identifier(&self) -> u8 {
        IPPROTO_TCP
    }

    fn send_up(&self, segment: &[u8], meta: DatagramMeta) {
        if segment.len() < TCP_HEADER_LEN || !Self::valid_checksum(segment) {
            log::debug!("[tcp] got corrupted segment, dropping");
            return;
        }

        let dst_port = u16::from_be_bytes([segment[OFF_DST_PORT], segment[OFF_DST_PORT + 1]]);
        let binding = self.bindings.lock().unwrap().get(&dst_port).cloned();
        let Some(binding) = binding else {
            log::debug!("[tcp] nobody listening on port {dst_port}, dropping");
            return;
        };

        if binding.matches(meta.dst_addr, dst_port) {
            binding.handle_segment(segment, meta);
        } else {
            log::debug!("[tcp] segment for a different address, dropping");
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

/// The per-(address, port) state: either a listener with a backlog, or the
/// home of one or more active connections keyed by remote endpoint.
#[derive(Debug)]
pub struct TcpBinding {
    self_ref: Weak<TcpBinding>,
    tcp: Weak<Tcp>,
    addr: Ipv4Addr,
    port: u16,
    network_protocol: [u8; 2],
    listening: AtomicBool,
    backlog: Mutex<Option<Arc<PacketQueue>>>,
    connections: Mutex<HashMap<(Ipv4Addr, u16), Arc<TcpConnection>>>,
}

impl TcpBinding {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Enter the listening role with room for `backlog` pending handshakes.
    pub fn listen(&self, backlog: usize) {
        *self.backlog.lock().unwrap() = Some(Arc::new(PacketQueue::new(backlog + 1)));
        self.listening.store(true, Ordering::SeqCst);
    }

    /// Dequeue the next pending handshake, reply to it, and wait for the
    /// connection to establish.
    pub async fn accept(&self) -> Option<Arc<TcpConnection>> {
        if !self.is_listening() {
            log::warn!("[tcp] accept without listen on port {}", self.port);
            return None;
        }
        let backlog = self.backlog.lock().unwrap().clone()?;

        let request = backlog.get().await;
        if request.len() != 12 {
            log::debug!("[tcp] malformed handshake request, ignoring");
            return None;
        }
        let remote_addr: Ipv4Addr = request[0..4].try_into().unwrap();
        let remote_port = u16::from_be_bytes([request[4], request[5]]);
        let local_addr: Ipv4Addr = request[6..10].try_into().unwrap();
        let local_port = u16::from_be_bytes([request[10], request[11]]);

        let connection = TcpConnection::new(
            self,
            Role::Acceptor,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
        );
        self.connections
            .lock()
            .unwrap()
            .insert((remote_addr, remote_port), connection.clone());

        connection.acknowledge_open();
        connection.wait_connected().await;
        Some(connection)
    }

    /// Open a connection to `addr:port` and wait for it to establish.
    pub async fn connect(&self, addr: Ipv4Addr, port: u16) -> Option<Arc<TcpConnection>> {
        if self.is_listening() {
            log::warn!("[tcp] connect on a listening binding (port {})", self.port);
            return None;
        }

        let connection = TcpConnection::new(self, Role::Initiator, self.addr, self.port, addr, port);
        self.connections
            .lock()
            .unwrap()
            .insert((addr, port), connection.clone());

        connection.request_open();
        connection.wait_connected().await;
        Some(connection)
    }

    /// Route an inbound segment: to its connection when one exists, onto
    /// the backlog when it is a SYN for a listener, to the floor otherwise.
    fn handle_segment(&self, segment: &[u8], meta: DatagramMeta) {
        let remote_port = u16::from_be_bytes([segment[0], segment[1]]);
        let key = (meta.src_addr, remote_port);

        let connection = self.connections.lock().unwrap().get(&key).cloned();
        if let Some(connection) = connection {
            connection.on_segment(segment);
            return;
        }

        match SegmentKind::from_wire(segment[OFF_FLAGS]) {
            Some(SegmentKind::Syn) if self.is_listening() => {
                let Some(backlog) = self.backlog.lock().unwrap().clone() else {
                    return;
                };
                let mut request = Vec::with_capacity(12);
                request.extend_from_slice(&meta.src_addr);
                request.extend_from_slice(&segment[0..2]);
                request.extend_from_slice(&meta.dst_addr);
                request.extend_from_slice(&segment[2..4]);
                backlog.put(request);
                log::debug!(
                    "[tcp] ← SYN from {}:{remote_port}, queued",
                    fmt_ip(&meta.src_addr)
                );
            }
            Some(SegmentKind::Syn) => {
                log::debug!("[tcp] SYN for non-listening port {}, dropping", self.port);
            }
            _ => log::debug!("[tcp] segment for unknown connection, dropping"),
        }
    }

    fn matches(&self, dst_addr: Ipv4Addr, port: u16) -> bool {
        port == self.port && (self.addr == ANY_ADDR || self.addr == dst_addr)
    }

    /// Forget a torn-down connection; an idle non-listening binding
    /// releases its port.
    fn remove_connection(&self, key: (Ipv4Addr, u16)) {
        let mut connections = self.connections.lock().unwrap();
        connections.remove(&key);
        if connections.is_empty() && !self.is_listening() {
            if let Some(tcp) = self.tcp.upgrade() {
                tcp.remove_binding(self.port);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ConnState {
    connection: ConnectionState,
    data: DataState,
    send_seq: u32,
    recv_seq: u32,
    /// Copy of the DATA segment awaiting its ACK, kept for retransmission.
    last_data: Option<Vec<u8>>,
}

/// One reliable byte-stream between two endpoints.
#[derive(Debug)]
pub struct TcpConnection {
    self_ref: Weak<TcpConnection>,
    binding: Weak<TcpBinding>,
    role: Role,
    local_addr: Ipv4Addr,
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    state: Mutex<ConnState>,
    read_buffer: ByteQueue,
    write_buffer: ByteQueue,
    /// Single-shot "handshake / teardown step completed" signal.
    settled: Notify,
}

impl TcpConnection {
    fn new(
        binding: &TcpBinding,
        role: Role,
        local_addr: Ipv4Addr,
        local_port: u16,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            binding: binding.self_ref.clone(),
            role,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state: Mutex::new(ConnState {
                connection: ConnectionState::Closed,
                data: DataState::Idle,
                send_seq: 0,
                recv_seq: 0,
                last_data: None,
            }),
            read_buffer: ByteQueue::new(DEFAULT_BUFFER_CAPACITY),
            write_buffer: ByteQueue::new(DEFAULT_BUFFER_CAPACITY),
            settled: Notify::new(),
        })
    }

    // -- public surface ------------------------------------------------------

    /// Queue one byte for the send loop to pick up.
    pub fn send(&self, byte: u8) {
        self.write_buffer.put(byte);
    }

    /// Pop the next received byte, if any.
    pub fn recv(&self) -> Option<u8> {
        self.read_buffer.try_get()
    }

    /// Begin a graceful teardown.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        let segment = self.build_segment(SegmentKind::Fin, &[], &state);
        self.transmit(&segment);
        state.connection = ConnectionState::Closing;
        log::debug!("[tcp] {:?} → FIN", self.role);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_addr(&self) -> Ipv4Addr {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    // -- handshake -----------------------------------------------------------

    fn request_open(&self) {
        let mut state = self.state.lock().unwrap();
        let segment = self.build_segment(SegmentKind::Syn, &[], &state);
        self.transmit(&segment);
        state.connection = ConnectionState::SynSent;
        log::debug!("[tcp] → SYN to {}:{}", fmt_ip(&self.remote_addr), self.remote_port);
    }

    fn acknowledge_open(&self) {
        let mut state = self.state.lock().unwrap();
        let segment = self.build_segment(SegmentKind::SynAck, &[], &state);
        self.transmit(&segment);
        state.connection = ConnectionState::SynReceived;
        log::debug!("[tcp] → SYN+ACK to {}:{}", fmt_ip(&self.remote_addr), self.remote_port);
    }

    async fn wait_connected(&self) {
        loop {
            {
                let state = self.state.lock().unwrap();
                if !matches!(
                    state.connection,
                    ConnectionState::Closed
                        | ConnectionState::SynSent
                        | ConnectionState::SynReceived
                ) {
                    return;
                }
            }
            self.settled.notified().await;
        }
    }

    // -- inbound -------------------------------------------------------------

    fn on_segment(&self, segment: &[u8]) {
        let Some(kind) = SegmentKind::from_wire(segment[OFF_FLAGS]) else {
            log::debug!("[tcp] unknown flag combination {}, dropping", segment[OFF_FLAGS]);
            return;
        };

        let mut state = self.state.lock().unwrap();
        match kind {
            SegmentKind::Data => {
                let seq = u32::from_be_bytes(segment[OFF_SEQ..OFF_SEQ + 4].try_into().unwrap());
                if seq == state.recv_seq {
                    for byte in &segment[TCP_HEADER_LEN..] {
                        self.read_buffer.put(*byte);
                    }
                    let ack = self.build_ack(seq);
                    self.transmit(&ack);
                    state.recv_seq = state.recv_seq.wrapping_add(1);
                    log::debug!(
                        "[tcp] ← DATA seq={seq} ({} bytes); → ACK {seq}",
                        segment.len() - TCP_HEADER_LEN
                    );
                } else {
                    // A retransmission of a segment already consumed: the
                    // earlier ACK was late or lost, so re-acknowledge
                    // without delivering the payload twice.
                    let ack = self.build_ack(seq);
                    self.transmit(&ack);
                    log::debug!("[tcp] ← duplicate DATA seq={seq}; → ACK {seq}");
                }
            }

            SegmentKind::Syn => {
                log::debug!("[tcp] unexpected SYN on existing connection, dropping");
            }

            SegmentKind::SynAck => {
                if state.connection == ConnectionState::SynSent {
                    let ack = self.build_segment(SegmentKind::Ack, &[], &state);
                    self.transmit(&ack);
                    state.connection = ConnectionState::Established;
                    log::debug!("[tcp] ← SYN+ACK; → ACK, established");
                    drop(state);
                    self.settled.notify_one();
                    self.spawn_send_loop();
                } else {
                    log::debug!("[tcp] unexpected SYN+ACK in {:?}", state.connection);
                }
            }

            SegmentKind::Ack => {
                let ack_num = u32::from_be_bytes(segment[OFF_ACK..OFF_ACK + 4].try_into().unwrap());
                match state.connection {
                    ConnectionState::SynReceived => {
                        state.connection = ConnectionState::Established;
                        log::debug!("[tcp] ← ACK, established");
                        drop(state);
                        self.settled.notify_one();
                        self.spawn_send_loop();
                    }
                    ConnectionState::Closing => {
                        state.connection = ConnectionState::TeardownAcked;
                        log::debug!("[tcp] ← ACK, teardown complete");
                        drop(state);
                        self.cleanup();
                    }
                    ConnectionState::Established => {
                        let acked = state.last_data.as_ref().map(|seg| {
                            u32::from_be_bytes(seg[OFF_SEQ..OFF_SEQ + 4].try_into().unwrap())
                        });
                        if acked == Some(ack_num) {
                            state.data = DataState::Idle;
                            log::debug!("[tcp] ← ACK {ack_num}");
                        } else {
                            log::debug!("[tcp] ← ACK {ack_num} for a different segment, ignoring");
                        }
                    }
                    _ => log::debug!("[tcp] unexpected ACK in {:?}", state.connection),
                }
            }

            SegmentKind::Fin => {
                if state.connection == ConnectionState::Established {
                    let reply = self.build_segment(SegmentKind::FinAck, &[], &state);
                    self.transmit(&reply);
                    state.connection = ConnectionState::Closing;
                    log::debug!("[tcp] ← FIN; → FIN+ACK");
                } else {
                    log::debug!("[tcp] unexpected FIN in {:?}", state.connection);
                }
            }

            SegmentKind::FinAck => {
                if state.connection == ConnectionState::Closing {
                    let ack = self.build_segment(SegmentKind::Ack, &[], &state);
                    self.transmit(&ack);
                    state.connection = ConnectionState::TeardownAcked;
                    log::debug!("[tcp] ← FIN+ACK; → ACK, teardown complete");
                    drop(state);
                    self.cleanup();
                } else {
                    log::debug!("[tcp] unexpected FIN+ACK in {:?}", state.connection);
                }
            }
        }
    }

    // -- outbound ------------------------------------------------------------

    /// Spawn the periodic send loop; runs until the connection leaves
    /// `Established`.
    fn spawn_send_loop(&self) {
        let Some(connection) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RETRANSMIT_PERIOD).await;
                let mut state = connection.state.lock().unwrap();
                if state.connection != ConnectionState::Established {
                    break;
                }
                match state.data {
                    DataState::Idle => {
                        let data = connection.write_buffer.drain();
                        if data.is_empty() {
                            continue;
                        }
                        let segment = connection.build_segment(SegmentKind::Data, &data, &state);
                        connection.transmit(&segment);
                        log::debug!(
                            "[tcp] → DATA seq={} ({} bytes)",
                            state.send_seq,
                            data.len()
                        );
                        state.last_data = Some(segment);
                        state.send_seq = state.send_seq.wrapping_add(1);
                        state.data = DataState::AwaitingAck;
                    }
                    DataState::AwaitingAck => {
                        if let Some(segment) = state.last_data.clone() {
                            log::debug!("[tcp] retransmitting unacked segment");
                            connection.transmit(&segment);
                        }
                    }
                }
            }
        });
    }

    /// Build one segment toward the remote endpoint.
    ///
    /// Only DATA segments carry a sequence number and only ACKs carry an
    /// acknowledgement number; everything else leaves both fields zero.
    fn build_segment(&self, kind: SegmentKind, payload: &[u8], state: &ConnState) -> Vec<u8> {
        let seq = match kind {
            SegmentKind::Data => state.send_seq,
            _ => 0,
        };
        let ack = match kind {
            SegmentKind::Ack => state.recv_seq,
            _ => 0,
        };
        self.build_raw(kind, payload, seq, ack)
    }

    /// An ACK naming a specific segment number (data acknowledgements).
    fn build_ack(&self, ack: u32) -> Vec<u8> {
        self.build_raw(SegmentKind::Ack, &[], 0, ack)
    }

    fn build_raw(&self, kind: SegmentKind, payload: &[u8], seq: u32, ack: u32) -> Vec<u8> {
        let mut segment = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
        segment.extend_from_slice(&self.local_port.to_be_bytes());
        segment.extend_from_slice(&self.remote_port.to_be_bytes());
        segment.extend_from_slice(&seq.to_be_bytes());
        segment.extend_from_slice(&ack.to_be_bytes());
        segment.push(kind.to_wire());
        segment.push(0);
        segment.extend_from_slice(payload);
        segment[OFF_CHECKSUM] = checksum(&segment);
        segment
    }

    /// Hand a built segment to the L3 this connection's binding rides on.
    fn transmit(&self, segment: &[u8]) {
        let Some(binding) = self.binding.upgrade() else { return };
        let Some(tcp) = binding.tcp.upgrade() else { return };
        let Some(l3) = tcp.find_l3(binding.network_protocol) else {
            log::debug!("[tcp] no network protocol for binding, dropping");
            return;
        };
        l3.send_down(segment, self.remote_addr, SendOptions::default(), IPPROTO_TCP);
    }

    fn cleanup(&self) {
        if let Some(binding) = self.binding.upgrade() {
            binding.remove_connection((self.remote_addr, self.remote_port));
        }
        self.settled.notify_one();
    }
}
