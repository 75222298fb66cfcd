//! `netsim` — a discrete-time simulator of a layered packet-switched network.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ bind / listen / accept / connect / send / recv
//!  ┌───▼──────┐
//!  │  Socket  │  (uniform façade over both transports)
//!  └───┬──────┘
//!  ┌───▼──────┐  ┌──────────┐
//!  │ UDP      │  │ TCP      │   L4: port demux, reliability
//!  └───┬──────┘  └───┬──────┘
//!      └──────┬──────┘
//!  ┌──────────▼─────────────┐
//!  │ IP                     │   L3: addressing, fragmentation, forwarding
//!  └──────────┬─────────────┘
//!  ┌──────────▼─────────────┐
//!  │ Ethernet               │   L2: framing, checksum, VLAN, demux
//!  └──────────┬─────────────┘
//!  ┌──────────▼─────────────┐
//!  │ EthernetAdapter        │   byte queues, on/off
//!  └──────────┬─────────────┘
//!             │ one byte per eligible tick
//!  ┌──────────▼─────────────┐
//!  │ Link / DuplexLink      │   propagation delay, error injection
//!  └──────────┬─────────────┘
//!             │ driven by
//!  ┌──────────▼─────────────┐
//!  │ Clock                  │   global tick fan-out
//!  └────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`clock`]    — tick source fanning out to registered consumers
//! - [`adapter`]  — byte-level endpoints that links drive
//! - [`link`]     — propagation-delayed byte pipelines with error injection
//! - [`queue`]    — bounded drop-tail queues shared by the transports
//! - [`protocol`] — the trait seams between layers and the wire identifiers
//! - [`ethernet`] — L2 framing and demultiplexing
//! - [`bridge`]   — multi-port learning switch with VLAN scoping
//! - [`ip`]       — L3 engine: fragmentation, reassembly, forwarding
//! - [`route`]    — static route and address-resolution providers
//! - [`router`]   — multi-interface L3 forwarder
//! - [`nat`]      — router with stateful source-endpoint translation
//! - [`udp`]      — connectionless port demultiplexer
//! - [`tcp`]      — connection-oriented reliable byte stream
//! - [`socket`]   — BSD-shaped application surface
//! - [`node`]     — an end host assembling the full stack
//!
//! Nothing here touches a real network: media are simulated byte pipelines
//! and all timing is expressed in ticks of the logical [`clock::Clock`].

pub mod adapter;
pub mod bridge;
pub mod clock;
pub mod ethernet;
pub mod ip;
pub mod link;
pub mod nat;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod route;
pub mod router;
pub mod socket;
pub mod tcp;
pub mod udp;
pub mod util;
