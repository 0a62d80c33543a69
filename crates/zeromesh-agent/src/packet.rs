//! Overlay datagram framing.
//!
//! Every UDP datagram starts with a fixed 8-byte big-endian header:
//! version (1) | kind (1) | network id (4) | reserved (2, zero on send).

use anyhow::Result;
use std::fmt;

/// Datagram header length.
pub const HEADER_SIZE: usize = 8;

/// Maximum datagram size (UDP-safe).
pub const MAX_PACKET_SIZE: usize = 65535;

/// Maximum payload after the header.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Datagram kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0x01,
    Control = 0x02,
    Keepalive = 0x03,
    Handshake = 0x04,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketKind::Data),
            0x02 => Some(PacketKind::Control),
            0x03 => Some(PacketKind::Keepalive),
            0x04 => Some(PacketKind::Handshake),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Data => "data",
            PacketKind::Control => "control",
            PacketKind::Keepalive => "keepalive",
            PacketKind::Handshake => "handshake",
        };
        f.write_str(name)
    }
}

/// Parsed datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: PacketKind,
    pub network_id: u32,
    pub reserved: u16,
}

impl Header {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.version;
        buf[1] = self.kind as u8;
        buf[2..6].copy_from_slice(&self.network_id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.reserved.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            anyhow::bail!("packet too short for header: {} bytes", buf.len());
        }
        if buf[0] != VERSION {
            anyhow::bail!("unsupported version: {}", buf[0]);
        }
        let kind = PacketKind::from_u8(buf[1])
            .ok_or_else(|| anyhow::anyhow!("unknown packet kind: 0x{:02x}", buf[1]))?;
        Ok(Header {
            version: buf[0],
            kind,
            network_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            reserved: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

/// A complete datagram: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A data packet carrying an encrypted Ethernet frame.
    pub fn data(network_id: u32, payload: Vec<u8>) -> Packet {
        Packet {
            header: Header {
                version: VERSION,
                kind: PacketKind::Data,
                network_id,
                reserved: 0,
            },
            payload,
        }
    }

    /// A keepalive packet (header only).
    pub fn keepalive() -> Packet {
        Packet {
            header: Header {
                version: VERSION,
                kind: PacketKind::Keepalive,
                network_id: 0,
                reserved: 0,
            },
            payload: Vec::new(),
        }
    }

    /// A handshake packet carrying the sender's static public key.
    pub fn handshake(payload: Vec<u8>) -> Packet {
        Packet {
            header: Header {
                version: VERSION,
                kind: PacketKind::Handshake,
                network_id: 0,
                reserved: 0,
            },
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + self.payload.len()];
        self.header.encode(&mut buf[..HEADER_SIZE]);
        buf[HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Packet> {
        let header = Header::decode(data)?;
        Ok(Packet {
            header,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}
