//! Small helpers shared by every layer.

/// 8-bit checksum: the sum of all bytes, mod 256.
///
/// Every wire format in the simulator (frame trailer, IP header, UDP and TCP
/// segments) uses this same folded sum.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Render a MAC address as the usual colon-separated hex for log lines.
pub fn fmt_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Render a 4-byte address as dotted decimal for log lines.
pub fn fmt_ip(addr: &[u8]) -> String {
    addr.iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(".")
}
