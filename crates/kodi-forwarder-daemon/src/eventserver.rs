//! Kodi EventServer client
//!
//! The event server speaks a small datagram protocol on UDP 9777: a fixed
//! 32-byte header (signature, protocol version, packet type, sequence
//! numbers, payload size, client token) followed by a packet-type specific
//! payload. A client announces itself with HELO, sends BUTTON/ACTION
//! packets while active, keeps the registration alive with PING, and says
//! BYE on the way out.
//!
//! Everything here fits in a single datagram; multi-packet payloads exist
//! in the protocol but a button name never needs them.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::session::{EventSession, EventTransport, SessionError};

const SIGNATURE: &[u8; 4] = b"XBMC";
const VERSION_MAJOR: u8 = 2;
const VERSION_MINOR: u8 = 0;
const HEADER_LEN: usize = 32;

const PT_HELO: u16 = 0x01;
const PT_BYE: u16 = 0x02;
const PT_BUTTON: u16 = 0x03;
const PT_PING: u16 = 0x04;
const PT_ACTION: u16 = 0x0A;

// BUTTON payload flags
const BT_USE_NAME: u16 = 0x01;
const BT_DOWN: u16 = 0x02;
const BT_UP: u16 = 0x04;
// The forwarder repeats held buttons itself, so host-side autorepeat is
// always disabled.
const BT_NO_REPEAT: u16 = 0x20;

const ICON_NONE: u8 = 0x00;
const ACTION_EXECBUILTIN: u8 = 0x01;

fn encode_packet(packet_type: u16, payload: &[u8], uid: u32) -> Vec<u8> {
    debug_assert!(payload.len() <= 1024, "payload must fit one datagram");

    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(SIGNATURE);
    packet.push(VERSION_MAJOR);
    packet.push(VERSION_MINOR);
    packet.extend_from_slice(&packet_type.to_be_bytes());
    packet.extend_from_slice(&1u32.to_be_bytes()); // sequence number
    packet.extend_from_slice(&1u32.to_be_bytes()); // packet count
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(&uid.to_be_bytes());
    packet.extend_from_slice(&[0u8; 10]); // reserved
    packet.extend_from_slice(payload);
    packet
}

fn helo_payload(device_name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(device_name.len() + 12);
    payload.extend_from_slice(device_name.as_bytes());
    payload.push(0);
    payload.push(ICON_NONE);
    payload.extend_from_slice(&0u16.to_be_bytes()); // functional port, unused
    payload.extend_from_slice(&0u32.to_be_bytes()); // reserved
    payload.extend_from_slice(&0u32.to_be_bytes()); // reserved
    payload
}

fn button_payload(map: &str, button: &str) -> Vec<u8> {
    let flags = BT_USE_NAME | BT_DOWN | BT_NO_REPEAT;

    let mut payload = Vec::with_capacity(6 + map.len() + button.len() + 2);
    payload.extend_from_slice(&0u16.to_be_bytes()); // code, unused with names
    payload.extend_from_slice(&flags.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes()); // amount
    payload.extend_from_slice(map.as_bytes());
    payload.push(0);
    payload.extend_from_slice(button.as_bytes());
    payload.push(0);
    payload
}

fn release_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&1u16.to_be_bytes()); // code
    payload.extend_from_slice(&BT_UP.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes()); // amount
    payload.push(0); // empty map name
    payload.push(0); // empty button name
    payload
}

fn action_payload(message: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(message.len() + 2);
    payload.push(ACTION_EXECBUILTIN);
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    payload
}

/// Opens [`EventServerSession`]s against a fixed host endpoint.
pub struct EventServerTransport {
    host: String,
    port: u16,
    device_name: String,
    timeout: Duration,
}

impl EventServerTransport {
    pub fn new(host: &str, port: u16, device_name: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            device_name: device_name.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl EventTransport for EventServerTransport {
    async fn open(&self) -> Result<Box<dyn EventSession>, SessionError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        match tokio::time::timeout(
            self.timeout,
            socket.connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(SessionError::Timeout),
        }

        let session = EventServerSession {
            socket,
            uid: std::process::id(),
            timeout: self.timeout,
        };
        session
            .send_packet(PT_HELO, &helo_payload(&self.device_name))
            .await?;

        Ok(Box::new(session))
    }
}

pub struct EventServerSession {
    socket: UdpSocket,
    uid: u32,
    timeout: Duration,
}

impl EventServerSession {
    async fn send_packet(&self, packet_type: u16, payload: &[u8]) -> Result<(), SessionError> {
        let packet = encode_packet(packet_type, payload, self.uid);
        match tokio::time::timeout(self.timeout, self.socket.send(&packet)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

#[async_trait]
impl EventSession for EventServerSession {
    async fn send_button(&mut self, map: &str, button: &str) -> Result<(), SessionError> {
        self.send_packet(PT_BUTTON, &button_payload(map, button)).await
    }

    async fn send_action(&mut self, payload: &str) -> Result<(), SessionError> {
        self.send_packet(PT_ACTION, &action_payload(payload)).await
    }

    async fn release_button(&mut self) -> Result<(), SessionError> {
        self.send_packet(PT_BUTTON, &release_payload()).await
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        self.send_packet(PT_PING, &[]).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.send_packet(PT_BYE, &[]).await {
            tracing::debug!("BYE packet failed: {}", e);
        }
    }
}
