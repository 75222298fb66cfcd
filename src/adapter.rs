//! Byte-level network adapters.
//!
//! An [`EthernetAdapter`] is the boundary between a node's protocol stack
//! and the simulated medium. Links drive it one byte per eligible tick:
//! they *pull* outgoing bytes from its write side and *push* arriving slots
//! onto its read side. The L2 above deposits whole frames downward and runs
//! an ingester that awaits incoming slots upward.
//!
//! A pushed slot is `Option<u8>`: `Some` carries a byte off the wire, `None`
//! marks an idle slot, which L2 interprets as "end of the current
//! transmission, attempt a frame parse". Each frame deposited into the
//! write side is followed by one idle slot so that back-to-back frames keep
//! their boundaries on the wire.
//!
//! Power state is part of the contract: while off, pulls return nothing,
//! pushes and deposits are dropped, and turning off clears both buffers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::protocol::MacAddr;
use crate::util::fmt_mac;

/// Default capacity of the incoming slot queue.
pub const DEFAULT_READ_CAPACITY: usize = 1000;

struct AdapterState {
    on: bool,
    /// Slots delivered by a link, oldest first. `None` = idle slot.
    incoming: VecDeque<Option<u8>>,
    /// Bytes waiting to be pulled by a link, oldest first. `None` entries
    /// are inter-frame gap markers that reach the wire as idle slots.
    outgoing: VecDeque<Option<u8>>,
}

pub struct EthernetAdapter {
    mac: MacAddr,
    promiscuous: bool,
    read_capacity: usize,
    state: Mutex<AdapterState>,
    rx_ready: Notify,
}

impl EthernetAdapter {
    pub fn new(mac: MacAddr, promiscuous: bool) -> Arc<Self> {
        Self::with_read_capacity(mac, promiscuous, DEFAULT_READ_CAPACITY)
    }

    pub fn with_read_capacity(mac: MacAddr, promiscuous: bool, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            mac,
            promiscuous,
            read_capacity: capacity,
            state: Mutex::new(AdapterState {
                on: false,
                incoming: VecDeque::new(),
                outgoing: VecDeque::new(),
            }),
            rx_ready: Notify::new(),
        })
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous
    }

    /// Remove and return the oldest outgoing byte.
    ///
    /// Called by a link once per eligible tick. Returns `None` when the
    /// adapter is off, the buffer is empty, or the next slot is an
    /// inter-frame gap.
    pub fn pull_byte(&self) -> Option<u8> {
        let mut state = self.state.lock().unwrap();
        if !state.on {
            return None;
        }
        state.outgoing.pop_front().flatten()
    }

    /// Enqueue a slot arriving from the medium.
    ///
    /// Dropped silently while off or when the read queue is full.
    pub fn push_byte(&self, slot: Option<u8>) {
        let mut state = self.state.lock().unwrap();
        if !state.on {
            return;
        }
        if state.incoming.len() >= self.read_capacity {
            log::debug!("[adapter] {}: read queue full, dropping slot", fmt_mac(&self.mac));
            return;
        }
        state.incoming.push_back(slot);
        drop(state);
        self.rx_ready.notify_one();
    }

    /// Append a frame to the outgoing buffer, followed by one gap slot.
    ///
    /// Ignored while off.
    pub fn put_in_buffer(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if !state.on {
            return;
        }
        state.outgoing.extend(bytes.iter().copied().map(Some));
        state.outgoing.push_back(None);
    }

    /// Await the next incoming slot. `None` is the idle-slot marker.
    pub async fn next_slot(&self) -> Option<u8> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(slot) = state.incoming.pop_front() {
                    return slot;
                }
            }
            self.rx_ready.notified().await;
        }
    }

    pub fn turn_on(&self) {
        self.state.lock().unwrap().on = true;
    }

    /// Power off, discarding everything in flight on both sides.
    pub fn turn_off(&self) {
        let mut state = self.state.lock().unwrap();
        state.on = false;
        state.incoming.clear();
        state.outgoing.clear();
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().unwrap().on
    }
}
