//! A multi-port learning switch with VLAN-scoped forwarding.
//!
//! Each port is a promiscuous [`Ethernet`] whose raw-frame tap points back
//! at the bridge, so every valid frame a port hears lands in
//! [`Bridge::receive`] tagged with the port it arrived on. The bridge
//! learns source MACs as it goes; a known destination is forwarded out its
//! learned port, anything else floods to every other port in the frame's
//! VLAN. Forwarding-table entries never expire — simulations are short and
//! topologies static.
//!
//! VLAN membership per port follows a small convention on the VLAN list:
//! length 1 means an access port on the default VLAN 0, length 2 an access
//! port on the listed non-default VLAN, and longer lists mean a trunk
//! carrying every listed VLAN. Frames entering through an access port are
//! retagged in place with the port's VLAN (and the trailer checksum
//! recomputed); frames entering through a trunk keep the tag they carry.

use std::sync::{Arc, Mutex, Weak};

use crate::adapter::EthernetAdapter;
use crate::ethernet::{Ethernet, FRAME_DST, FRAME_SRC, FRAME_VLAN};
use crate::protocol::{FrameConsumer, L2Protocol, MacAddr};
use crate::util::{checksum, fmt_mac};

struct BridgeState {
    /// Learned MAC → port index.
    forwarding_table: std::collections::HashMap<MacAddr, usize>,
    /// Allowed VLANs per port, under the access/trunk length convention.
    vlan_table: Vec<Vec<u16>>,
}

pub struct Bridge {
    ports: Vec<Arc<Ethernet>>,
    state: Mutex<BridgeState>,
}

impl Bridge {
    /// Build a bridge with one promiscuous port per MAC, every port an
    /// access port on VLAN 0.
    pub fn new(macs: &[MacAddr]) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Bridge>| {
            let ports: Vec<Arc<Ethernet>> = macs
                .iter()
                .map(|mac| {
                    let ethernet = Ethernet::new(EthernetAdapter::new(*mac, true));
                    ethernet.set_raw_consumer(weak.clone() as Weak<dyn FrameConsumer>);
                    ethernet
                })
                .collect();
            Bridge {
                state: Mutex::new(BridgeState {
                    forwarding_table: std::collections::HashMap::new(),
                    vlan_table: vec![vec![0]; ports.len()],
                }),
                ports,
            }
        })
    }

    /// Append `vlan` to the port's allowed list, moving it through the
    /// access → tagged-access → trunk conventions.
    pub fn add_port_to_vlan(&self, port: usize, vlan: u16) {
        self.state.lock().unwrap().vlan_table[port].push(vlan);
    }

    pub fn port(&self, index: usize) -> &Arc<Ethernet> {
        &self.ports[index]
    }

    pub fn turn_on(&self) {
        for port in &self.ports {
            port.adapter().turn_on();
        }
    }

    pub fn turn_off(&self) {
        for port in &self.ports {
            port.adapter().turn_off();
        }
    }

    fn is_trunk(state: &BridgeState, port: usize) -> bool {
        state.vlan_table[port].len() > 2
    }

    fn access_vlan(state: &BridgeState, port: usize) -> u16 {
        let vlans = &state.vlan_table[port];
        if vlans.len() == 1 {
            0
        } else {
            vlans[1]
        }
    }

    fn permits(state: &BridgeState, port: usize, vlan: u16) -> bool {
        state.vlan_table[port].contains(&vlan)
    }
}

impl FrameConsumer for Bridge {
    fn receive(&self, frame: &[u8], sender: &Arc<Ethernet>) {
        let mut state = self.state.lock().unwrap();

        let Some(port) = self
            .ports
            .iter()
            .position(|p| Arc::ptr_eq(p, sender))
        else {
            return;
        };

        let mut frame = frame.to_vec();
        let src: MacAddr = frame[FRAME_SRC..FRAME_SRC + 6].try_into().unwrap();
        let dst: MacAddr = frame[FRAME_DST..FRAME_DST + 6].try_into().unwrap();

        // Ingress VLAN: trunks trust the tag, access ports impose theirs.
        let trunk = Self::is_trunk(&state, port);
        let vlan = if trunk {
            u16::from_be_bytes([frame[FRAME_VLAN], frame[FRAME_VLAN + 1]])
        } else {
            Self::access_vlan(&state, port)
        };

        if !trunk {
            let end = frame.len() - 1;
            frame[FRAME_VLAN..FRAME_VLAN + 2].copy_from_slice(&vlan.to_be_bytes());
            frame[end] = checksum(&frame[..end]);
        }

        state.forwarding_table.insert(src, port);

        match state.forwarding_table.get(&dst).copied() {
            Some(out) => {
                if out != port && Self::permits(&state, out, vlan) {
                    log::debug!(
                        "[bridge] {} → port {out} (vlan {vlan})",
                        fmt_mac(&dst)
                    );
                    self.ports[out].adapter().put_in_buffer(&frame);
                }
            }
            None => {
                log::debug!("[bridge] {} unknown, flooding (vlan {vlan})", fmt_mac(&dst));
                for (i, out) in self.ports.iter().enumerate() {
                    if i != port && Self::permits(&state, i, vlan) {
                        out.adapter().put_in_buffer(&frame);
                    }
                }
            }
        }
    }
}
