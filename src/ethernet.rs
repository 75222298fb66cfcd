//! An ethernet-like L2 for point-to-point links.
//!
//! Carrier sensing is out of scope, so this is the simple variant: frames
//! are delimited by the preamble at the front and an idle slot on the wire
//! at the back, with a one-byte folded checksum as the trailer.
//!
//! Frame format:
//!
//! ```text
//! preamble(8) | dst mac(6) | src mac(6) | vlan id(2) | ethertype(2) | payload | checksum(1)
//! ```
//!
//! Two independent paths per instance: the downward `send_down` framing
//! path, and a byte-driven ingester task that pulls slots off the adapter,
//! accumulating bytes until an idle slot triggers a frame parse. A parsed
//! frame is handed first to the optional raw consumer (bridges tap frames
//! this way) and then to the L3 protocol whose EtherType matches; anything
//! malformed is dropped with a debug log and the buffer cleared.

use std::sync::{Arc, Mutex, Weak};

use crate::adapter::EthernetAdapter;
use crate::protocol::{
    FrameConsumer, L2Protocol, L3Protocol, MacAddr, BROADCAST_MAC, MULTICAST_PREFIX,
};
use crate::util::{checksum, fmt_mac};

/// Default maximum L2 payload size.
pub const DEFAULT_MTU: usize = 1500;

/// The sync pattern opening every frame.
pub const PREAMBLE: [u8; 8] = *b"01020304";

/// Offset of the destination MAC within a frame.
pub const FRAME_DST: usize = 8;
/// Offset of the source MAC within a frame.
pub const FRAME_SRC: usize = 14;
/// Offset of the VLAN id within a frame.
pub const FRAME_VLAN: usize = 20;
/// Offset of the EtherType within a frame.
pub const FRAME_TYPE: usize = 22;
/// Offset of the payload within a frame.
pub const FRAME_PAYLOAD: usize = 24;

const CHECKSUM_LEN: usize = 1;
const MIN_FRAME_LEN: usize = FRAME_PAYLOAD + CHECKSUM_LEN;

pub struct Ethernet {
    adapter: Arc<EthernetAdapter>,
    mtu: usize,
    l3_protocols: Mutex<Vec<Weak<dyn L3Protocol>>>,
    raw_consumer: Mutex<Option<Weak<dyn FrameConsumer>>>,
}

impl Ethernet {
    /// Create an interface with the default MTU and spawn its ingester.
    pub fn new(adapter: Arc<EthernetAdapter>) -> Arc<Self> {
        Self::with_mtu(adapter, DEFAULT_MTU)
    }

    /// Create an interface with a custom MTU (small MTUs force the L3 above
    /// to fragment, which the tests exploit).
    pub fn with_mtu(adapter: Arc<EthernetAdapter>, mtu: usize) -> Arc<Self> {
        let ethernet = Arc::new(Self {
            adapter,
            mtu,
            l3_protocols: Mutex::new(Vec::new()),
            raw_consumer: Mutex::new(None),
        });
        tokio::spawn(Self::ingest(ethernet.clone()));
        ethernet
    }

    /// Register an upper protocol for EtherType demux.
    pub fn add_l3_protocol(&self, protocol: &Arc<dyn L3Protocol>) {
        self.l3_protocols.lock().unwrap().push(Arc::downgrade(protocol));
    }

    /// Install the raw-frame tap (bridges route frames through this).
    pub fn set_raw_consumer(&self, consumer: Weak<dyn FrameConsumer>) {
        *self.raw_consumer.lock().unwrap() = Some(consumer);
    }

    /// Byte ingester: runs for the lifetime of the interface.
    async fn ingest(self: Arc<Self>) {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            match self.adapter.next_slot().await {
                Some(byte) => buffer.push(byte),
                None => Self::check_for_frame(&self, &mut buffer),
            }
        }
    }

    /// Attempt to parse the accumulated bytes as one frame.
    ///
    /// The buffer is cleared no matter the outcome: a failed parse means
    /// the transmission was garbage and resync starts at the next preamble.
    fn check_for_frame(this: &Arc<Self>, buffer: &mut Vec<u8>) {
        if buffer.is_empty() {
            return;
        }
        let frame = std::mem::take(buffer);

        if frame.len() < MIN_FRAME_LEN || !frame.starts_with(&PREAMBLE) {
            log::debug!(
                "[eth] {}: unrecognised transmission ({} bytes), dropping",
                fmt_mac(&this.adapter.mac()),
                frame.len()
            );
            return;
        }

        let trailer = frame[frame.len() - 1];
        if checksum(&frame[..frame.len() - 1]) != trailer {
            log::debug!("[eth] {}: corrupted frame, dropping", fmt_mac(&this.adapter.mac()));
            return;
        }

        if !this.adapter.is_promiscuous() && !this.frame_for_me(&frame[FRAME_DST..FRAME_SRC]) {
            log::debug!(
                "[eth] {}: frame destined elsewhere, dropping",
                fmt_mac(&this.adapter.mac())
            );
            return;
        }

        if let Some(consumer) = this.raw_consumer.lock().unwrap().clone() {
            if let Some(consumer) = consumer.upgrade() {
                consumer.receive(&frame, this);
            }
        }

        Self::dispatch_up(this, &frame);
    }

    fn dispatch_up(this: &Arc<Self>, frame: &[u8]) {
        let protocols: Vec<_> = this.l3_protocols.lock().unwrap().clone();
        if protocols.is_empty() {
            return;
        }

        let ethertype = [frame[FRAME_TYPE], frame[FRAME_TYPE + 1]];
        let upper = protocols
            .iter()
            .filter_map(Weak::upgrade)
            .find(|p| p.identifier() == ethertype);

        match upper {
            Some(protocol) => {
                let payload = &frame[FRAME_PAYLOAD..frame.len() - CHECKSUM_LEN];
                let source: Arc<dyn L2Protocol> = this.clone();
                protocol.send_up(payload, &source);
            }
            None => log::debug!(
                "[eth] {}: unrecognised frame type {ethertype:02X?}, dropping",
                fmt_mac(&this.adapter.mac())
            ),
        }
    }

    fn frame_for_me(&self, dst: &[u8]) -> bool {
        dst == &BROADCAST_MAC[..]
            || dst.starts_with(&MULTICAST_PREFIX)
            || dst == &self.adapter.mac()[..]
    }
}

impl L2Protocol for Ethernet {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn adapter(&self) -> &Arc<EthernetAdapter> {
        &self.adapter
    }

    fn send_down(&self, payload: &[u8], dst_mac: MacAddr, ethertype: [u8; 2]) {
        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
        frame.extend_from_slice(&PREAMBLE);
        frame.extend_from_slice(&dst_mac);
        frame.extend_from_slice(&self.adapter.mac());
        frame.extend_from_slice(&[0, 0]); // default VLAN; bridges retag on ingress
        frame.extend_from_slice(&ethertype);
        frame.extend_from_slice(payload);
        frame.push(checksum(&frame));
        self.adapter.put_in_buffer(&frame);
    }
}
