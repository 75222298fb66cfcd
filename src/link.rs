//! Point-to-point byte pipelines with propagation delay and error injection.
//!
//! Simulating a medium at bit granularity only pays off when studying
//! carrier sensing and collisions, which this simulator deliberately does
//! not model. A [`Link`] therefore moves whole bytes, is strictly
//! point-to-point, and has exactly one adapter acting as source, so
//! collisions cannot happen.
//!
//! The medium itself is a fixed-length vector of in-flight byte slots sized
//! by the bandwidth-delay product: `max(2, data_rate × length / c)`. On
//! every eligible tick (one per transmitted byte) the vector shifts one
//! slot toward the destination; the slot falling off the end is delivered —
//! after a Bernoulli corruption gate that flips the byte's high bit — and
//! the freed slot is refilled from the source adapter, which may hand back
//! an idle marker.
//!
//! [`DuplexLink`] composes two links with swapped endpoints into one
//! bidirectional medium registered as a single clock consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::adapter::EthernetAdapter;
use crate::clock::{Clock, TickConsumer};

/// Signal propagation speed through the simulated medium, metres/second.
const SPEED_OF_LIGHT: u64 = 200_000_000;

/// Physical parameters of one link.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Cable length in metres.
    pub length: u64,
    /// Throughput in bytes per simulated second.
    pub data_rate: u64,
    /// Probability that a delivered byte has its high bit flipped.
    pub byte_error_rate: f32,
}

/// A unidirectional byte pipeline from one adapter to another.
pub struct Link {
    config: LinkConfig,
    /// Ticks between byte transfers: `clock rate / data rate`.
    ticks_per_byte: u64,
    source: Arc<EthernetAdapter>,
    destination: Arc<EthernetAdapter>,
    /// In-flight slots; front is nearest the source, back is delivered next.
    pulses: Mutex<VecDeque<Option<u8>>>,
}

impl Link {
    /// Create a link and register it with `clock`.
    pub fn new(
        config: LinkConfig,
        source: Arc<EthernetAdapter>,
        destination: Arc<EthernetAdapter>,
        clock: &Arc<Clock>,
    ) -> Arc<Self> {
        let link = Arc::new(Self::unregistered(config, source, destination, clock.rate()));
        clock.register(link.clone());
        link
    }

    fn unregistered(
        config: LinkConfig,
        source: Arc<EthernetAdapter>,
        destination: Arc<EthernetAdapter>,
        clock_rate: u64,
    ) -> Self {
        let volume = (config.data_rate * config.length / SPEED_OF_LIGHT).max(2);
        Self {
            config,
            ticks_per_byte: (clock_rate / config.data_rate).max(1),
            source,
            destination,
            pulses: Mutex::new(vec![None; volume as usize].into()),
        }
    }

    /// One transfer step: deliver the last slot, shift, refill slot zero.
    fn transfer(&self) {
        let mut pulses = self.pulses.lock().unwrap();

        let mut delivered = pulses.pop_back().unwrap_or(None);
        if let Some(byte) = delivered {
            if rand::random::<f32>() < self.config.byte_error_rate {
                log::debug!("[link] corrupting byte {byte:#04X}");
                delivered = Some(byte ^ 0x80);
            }
        }
        self.destination.push_byte(delivered);

        pulses.push_front(self.source.pull_byte());
    }

    fn eligible(&self, tick: u64) -> bool {
        tick % self.ticks_per_byte == 0
    }
}

impl TickConsumer for Link {
    fn on_tick(&self, tick: u64) {
        if self.eligible(tick) {
            self.transfer();
        }
    }
}

/// Two links with swapped endpoints forming one full-duplex medium.
pub struct DuplexLink {
    forward: Link,
    reverse: Link,
}

impl DuplexLink {
    /// Create both directions and register the pair with `clock`.
    pub fn new(
        config: LinkConfig,
        adapter1: Arc<EthernetAdapter>,
        adapter2: Arc<EthernetAdapter>,
        clock: &Arc<Clock>,
    ) -> Arc<Self> {
        let link = Arc::new(Self {
            forward: Link::unregistered(config, adapter1.clone(), adapter2.clone(), clock.rate()),
            reverse: Link::unregistered(config, adapter2, adapter1, clock.rate()),
        });
        clock.register(link.clone());
        link
    }
}

impl TickConsumer for DuplexLink {
    fn on_tick(&self, tick: u64) {
        self.forward.on_tick(tick);
        self.reverse.on_tick(tick);
    }
}
