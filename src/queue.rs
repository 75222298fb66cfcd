//! Bounded drop-tail queues used by the transports.
//!
//! Both queues share the same contract: `put` never blocks and silently
//! drops the item when the queue is full; `try_get` never blocks and
//! returns `None` when empty; `get` awaits the next item (used by the TCP
//! backlog, whose `accept` is the one genuinely blocking consumer).

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded FIFO of byte vectors (datagram payloads, backlog entries).
#[derive(Debug)]
pub struct PacketQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    ready: Notify,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Enqueue an item, dropping it when the queue is at capacity.
    pub fn put(&self, item: Vec<u8>) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            log::debug!("[queue] full ({} items), dropping", self.capacity);
            return;
        }
        items.push_back(item);
        drop(items);
        self.ready.notify_one();
    }

    /// Dequeue the oldest item without waiting.
    pub fn try_get(&self) -> Option<Vec<u8>> {
        self.items.lock().unwrap().pop_front()
    }

    /// Dequeue the oldest item, waiting for one to arrive if necessary.
    pub async fn get(&self) -> Vec<u8> {
        loop {
            if let Some(item) = self.try_get() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded FIFO of single bytes (the TCP stream buffers).
#[derive(Debug)]
pub struct ByteQueue {
    items: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl ByteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Enqueue one byte, dropping it when the queue is at capacity.
    pub fn put(&self, byte: u8) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            log::debug!("[queue] byte queue full ({} bytes), dropping", self.capacity);
            return;
        }
        items.push_back(byte);
    }

    /// Dequeue the oldest byte without waiting.
    pub fn try_get(&self) -> Option<u8> {
        self.items.lock().unwrap().pop_front()
    }

    /// Drain every buffered byte in order.
    pub fn drain(&self) -> Vec<u8> {
        self.items.lock().unwrap().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}
