//! The Homa wire protocol (spec §6): a common header followed by a
//! type-specific header, then (for DATA) a payload.
//!
//! Grounded on `elvis-core`'s `protocols/tcp/tcp_parsing.rs`: headers are
//! parsed by hand, field by field, out of a byte iterator, matching the
//! teacher's hand-rolled big-endian parsing rather than pulling in a crate
//! such as `byteorder` or `nom` (those appear only in other repos in the
//! example pack, not in the teacher).

use crate::{config::NUM_CUTOFF_SLOTS, Message};

/// The 8-bit type tag carried by every Homa packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Data,
    Grant,
    Resend,
    Unknown,
    Busy,
    Cutoffs,
    NeedAck,
    Ack,
}

impl PacketType {
    fn to_u8(self) -> u8 {
        match self {
            PacketType::Data => 1,
            PacketType::Grant => 2,
            PacketType::Resend => 3,
            PacketType::Unknown => 4,
            PacketType::Busy => 5,
            PacketType::Cutoffs => 6,
            PacketType::NeedAck => 7,
            PacketType::Ack => 8,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Data,
            2 => PacketType::Grant,
            3 => PacketType::Resend,
            4 => PacketType::Unknown,
            5 => PacketType::Busy,
            6 => PacketType::Cutoffs,
            7 => PacketType::NeedAck,
            8 => PacketType::Ack,
            _ => return None,
        })
    }
}

/// Fields common to every Homa packet, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub packet_type: PacketType,
    pub sender_id: u64,
}

impl CommonHeader {
    pub const WIRE_LEN: usize = 2 + 2 + 1 + 8;

    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.push(self.packet_type.to_u8());
        out.extend_from_slice(&self.sender_id.to_be_bytes());
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        let src_port = read_u16(bytes)?;
        let dst_port = read_u16(bytes)?;
        let packet_type =
            PacketType::from_u8(next(bytes)?).ok_or(WireError::UnknownPacketType)?;
        let sender_id = read_u64(bytes)?;
        Ok(Self {
            src_port,
            dst_port,
            packet_type,
            sender_id,
        })
    }
}

/// One ACK descriptor as carried piggybacked on an ACK packet or in a
/// DATA packet's `ack` field, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckDescriptor {
    pub client_port: u16,
    pub server_port: u16,
    pub client_id: u64,
}

impl AckDescriptor {
    const WIRE_LEN: usize = 2 + 2 + 8;

    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client_port.to_be_bytes());
        out.extend_from_slice(&self.server_port.to_be_bytes());
        out.extend_from_slice(&self.client_id.to_be_bytes());
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        Ok(Self {
            client_port: read_u16(bytes)?,
            server_port: read_u16(bytes)?,
            client_id: read_u64(bytes)?,
        })
    }
}

/// A single message fragment as it travels over the wire (spec §6
/// `seg(offset, segment_length, ack)`). `segment_length` is implicit in the
/// payload passed alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub message_length: u32,
    pub incoming: u32,
    pub cutoff_version: u32,
    pub retransmit: bool,
    pub offset: u32,
    pub ack: Option<AckDescriptor>,
}

impl DataHeader {
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_be_bytes());
        out.extend_from_slice(&self.incoming.to_be_bytes());
        out.extend_from_slice(&self.cutoff_version.to_be_bytes());
        out.push(self.retransmit as u8);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.push(self.ack.is_some() as u8);
        if let Some(ack) = self.ack {
            ack.to_bytes(out);
        }
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        let message_length = read_u32(bytes)?;
        let incoming = read_u32(bytes)?;
        let cutoff_version = read_u32(bytes)?;
        let retransmit = next(bytes)? != 0;
        let offset = read_u32(bytes)?;
        let has_ack = next(bytes)? != 0;
        let ack = if has_ack {
            Some(AckDescriptor::from_bytes(bytes)?)
        } else {
            None
        };
        Ok(Self {
            message_length,
            incoming,
            cutoff_version,
            retransmit,
            offset,
            ack,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantHeader {
    pub offset: u32,
    pub priority: u8,
}

impl GrantHeader {
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.push(self.priority);
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        Ok(Self {
            offset: read_u32(bytes)?,
            priority: next(bytes)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendHeader {
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}

impl ResendHeader {
    fn to_bytes(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.push(self.priority);
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        Ok(Self {
            offset: read_u32(bytes)?,
            length: read_u32(bytes)?,
            priority: next(bytes)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutoffsHeader {
    pub unsched_cutoffs: [u32; NUM_CUTOFF_SLOTS],
    pub cutoff_version: u32,
}

impl CutoffsHeader {
    fn to_bytes(self, out: &mut Vec<u8>) {
        for cutoff in self.unsched_cutoffs {
            out.extend_from_slice(&cutoff.to_be_bytes());
        }
        out.extend_from_slice(&self.cutoff_version.to_be_bytes());
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        let mut unsched_cutoffs = [0u32; NUM_CUTOFF_SLOTS];
        for cutoff in unsched_cutoffs.iter_mut() {
            *cutoff = read_u32(bytes)?;
        }
        let cutoff_version = read_u32(bytes)?;
        Ok(Self {
            unsched_cutoffs,
            cutoff_version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHeader {
    pub acks: Vec<AckDescriptor>,
}

impl AckHeader {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.acks.len() as u16).to_be_bytes());
        for ack in &self.acks {
            ack.to_bytes(out);
        }
    }

    fn from_bytes(bytes: &mut impl Iterator<Item = u8>) -> Result<Self, WireError> {
        let num_acks = read_u16(bytes)?;
        let mut acks = Vec::with_capacity(num_acks as usize);
        for _ in 0..num_acks {
            acks.push(AckDescriptor::from_bytes(bytes)?);
        }
        Ok(Self { acks })
    }
}

/// A fully parsed packet: the common header plus whatever the type-specific
/// body and payload (DATA only) turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    Data(DataHeader),
    Grant(GrantHeader),
    Resend(ResendHeader),
    Unknown,
    Busy,
    Cutoffs(CutoffsHeader),
    NeedAck,
    Ack(AckHeader),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub common: CommonHeader,
    pub body: PacketBody,
    /// Segment bytes for DATA packets; empty for every other type.
    pub payload: Message,
}

impl Packet {
    pub fn data(common: CommonHeader, header: DataHeader, payload: Message) -> Self {
        debug_assert_eq!(common.packet_type, PacketType::Data);
        Self {
            common,
            body: PacketBody::Data(header),
            payload,
        }
    }

    pub fn control(common: CommonHeader, body: PacketBody) -> Self {
        debug_assert_ne!(common.packet_type, PacketType::Data);
        Self {
            common,
            body,
            payload: Message::new(Vec::new()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.common.to_bytes(&mut out);
        match &self.body {
            PacketBody::Data(header) => header.to_bytes(&mut out),
            PacketBody::Grant(header) => header.to_bytes(&mut out),
            PacketBody::Resend(header) => header.to_bytes(&mut out),
            PacketBody::Unknown | PacketBody::Busy | PacketBody::NeedAck => {}
            PacketBody::Cutoffs(header) => header.to_bytes(&mut out),
            PacketBody::Ack(header) => header.to_bytes(&mut out),
        }
        out.extend(self.payload.iter());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        let mut iter = bytes.iter().copied();
        let common = CommonHeader::from_bytes(&mut iter)?;
        let body = match common.packet_type {
            PacketType::Data => PacketBody::Data(DataHeader::from_bytes(&mut iter)?),
            PacketType::Grant => PacketBody::Grant(GrantHeader::from_bytes(&mut iter)?),
            PacketType::Resend => PacketBody::Resend(ResendHeader::from_bytes(&mut iter)?),
            PacketType::Unknown => PacketBody::Unknown,
            PacketType::Busy => PacketBody::Busy,
            PacketType::Cutoffs => PacketBody::Cutoffs(CutoffsHeader::from_bytes(&mut iter)?),
            PacketType::NeedAck => PacketBody::NeedAck,
            PacketType::Ack => PacketBody::Ack(AckHeader::from_bytes(&mut iter)?),
        };
        let payload: Vec<u8> = iter.collect();
        Ok(Self {
            common,
            body,
            payload: Message::new(payload),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet too short")]
    TooShort,
    #[error("unknown packet type")]
    UnknownPacketType,
}

fn next(bytes: &mut impl Iterator<Item = u8>) -> Result<u8, WireError> {
    bytes.next().ok_or(WireError::TooShort)
}

fn read_u16(bytes: &mut impl Iterator<Item = u8>) -> Result<u16, WireError> {
    Ok(u16::from_be_bytes([next(bytes)?, next(bytes)?]))
}

fn read_u32(bytes: &mut impl Iterator<Item = u8>) -> Result<u32, WireError> {
    Ok(u32::from_be_bytes([
        next(bytes)?,
        next(bytes)?,
        next(bytes)?,
        next(bytes)?,
    ]))
}

fn read_u64(bytes: &mut impl Iterator<Item = u8>) -> Result<u64, WireError> {
    let mut b = [0u8; 8];
    for slot in b.iter_mut() {
        *slot = next(bytes)?;
    }
    Ok(u64::from_be_bytes(b))
}
