//! The global simulation clock.
//!
//! Everything time-sensitive in the simulator — links shifting bytes,
//! anything rate-limited — keys off one monotonically increasing tick
//! counter. The clock driver increments the counter on a fixed period and
//! fans the new tick out to every registered consumer as its own task, so
//! consumers observe ticks in order but see no ordering guarantee relative
//! to each other within one tick.
//!
//! The tick period in wall-clock terms is `slowdown / rate` seconds: at the
//! defaults (1 GHz rate, 10^6 slowdown) one tick lasts one millisecond,
//! slow enough to observe the simulation while keeping the arithmetic of
//! "ticks per transmitted byte" exact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A recipient of clock ticks.
///
/// `on_tick` is dispatched from a freshly spawned task on every tick and
/// must therefore be cheap and race-safe; heavy lifting belongs in the
/// consumer's own long-lived tasks.
pub trait TickConsumer: Send + Sync {
    fn on_tick(&self, tick: u64);
}

/// Tick-rate configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClockConfig {
    /// Simulated clock frequency in ticks per simulated second.
    pub rate: u64,
    /// Wall-clock stretch factor: one simulated second takes
    /// `slowdown / rate` real seconds per tick times `rate` ticks.
    pub slowdown: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            rate: 1_000_000_000,
            slowdown: 1_000_000,
        }
    }
}

/// Monotonic tick source shared by one simulation.
///
/// Tests and topologies each build their own clock; there is deliberately
/// no process-wide instance.
pub struct Clock {
    self_ref: std::sync::Weak<Clock>,
    config: ClockConfig,
    counter: AtomicU64,
    consumers: Mutex<Vec<Arc<dyn TickConsumer>>>,
}

impl Clock {
    pub fn new(config: ClockConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            counter: AtomicU64::new(0),
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Clock frequency in ticks per simulated second.
    pub fn rate(&self) -> u64 {
        self.config.rate
    }

    /// The number of ticks elapsed since the simulation started.
    pub fn current_tick(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Register a consumer for tick fan-out.
    ///
    /// Consumers may be registered before or after [`start`](Self::start).
    pub fn register(&self, consumer: Arc<dyn TickConsumer>) {
        self.consumers.lock().unwrap().push(consumer);
    }

    /// Spawn the driver task that advances the counter forever.
    pub fn start(&self) {
        let Some(clock) = self.self_ref.upgrade() else { return };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(clock.tick_period());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let tick = clock.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let consumers: Vec<_> = clock.consumers.lock().unwrap().clone();
                for consumer in consumers {
                    tokio::spawn(async move { consumer.on_tick(tick) });
                }
            }
        });
    }

    fn tick_period(&self) -> Duration {
        let nanos = self
            .config
            .slowdown
            .saturating_mul(1_000_000_000)
            .checked_div(self.config.rate)
            .unwrap_or(1)
            .max(1);
        Duration::from_nanos(nanos)
    }
}
