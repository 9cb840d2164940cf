//! Wake-on-LAN
//!
//! Builds the classic magic packet (six 0xFF bytes followed by sixteen
//! repetitions of the target's link-layer address) and broadcasts it. A
//! malformed or missing address is logged and swallowed; waking a host is
//! always best-effort.

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// UDP port the magic packet is broadcast to.
const WAKE_PORT: u16 = 9;

#[async_trait]
pub trait WakeEndpoint: Send + Sync {
    async fn send_wake(&self);
}

pub struct WakeOnLan {
    mac: Option<String>,
}

impl WakeOnLan {
    pub fn new(mac: Option<String>) -> Self {
        Self { mac }
    }
}

#[async_trait]
impl WakeEndpoint for WakeOnLan {
    async fn send_wake(&self) {
        let Some(mac) = &self.mac else {
            tracing::warn!("Power-on requested but no wake address is configured");
            return;
        };

        let Some(packet) = magic_packet(mac) else {
            tracing::warn!("Malformed wake address '{}'", mac);
            return;
        };

        match broadcast(&packet).await {
            Ok(()) => tracing::info!("Wake packet sent to {}", mac),
            Err(e) => tracing::warn!("Failed to send wake packet: {}", e),
        }
    }
}

/// Parse a link-layer address of the form `aa:bb:cc:dd:ee:ff` (or with `-`
/// separators).
fn parse_link_addr(addr: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = addr.split(|c| c == ':' || c == '-');

    for byte in &mut bytes {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }

    // Trailing garbage means this was never a MAC.
    if parts.next().is_some() {
        return None;
    }

    Some(bytes)
}

fn magic_packet(addr: &str) -> Option<Vec<u8>> {
    let mac = parse_link_addr(addr)?;

    let mut packet = Vec::with_capacity(6 + 16 * 6);
    packet.extend_from_slice(&[0xFF; 6]);
    for _ in 0..16 {
        packet.extend_from_slice(&mac);
    }

    Some(packet)
}

async fn broadcast(packet: &[u8]) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(packet, ("255.255.255.255", WAKE_PORT))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_and_dash_separators() {
        assert_eq!(
            parse_link_addr("00:11:22:aa:bb:cc"),
            Some([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC])
        );
        assert_eq!(
            parse_link_addr("00-11-22-AA-BB-CC"),
            Some([0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC])
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(parse_link_addr(""), None);
        assert_eq!(parse_link_addr("00:11:22:aa:bb"), None);
        assert_eq!(parse_link_addr("00:11:22:aa:bb:cc:dd"), None);
        assert_eq!(parse_link_addr("00:11:22:aa:bb:zz"), None);
        assert_eq!(parse_link_addr("0011.22aa.bbcc"), None);
    }

    #[test]
    fn magic_packet_layout() {
        let packet = magic_packet("00:11:22:aa:bb:cc").unwrap();

        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for chunk in packet[6..].chunks(6) {
            assert_eq!(chunk, &[0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
        }
    }

    #[tokio::test]
    async fn malformed_address_is_swallowed() {
        // Must not panic or touch the network.
        WakeOnLan::new(Some("not-a-mac".to_string())).send_wake().await;
        WakeOnLan::new(None).send_wake().await;
    }
}
