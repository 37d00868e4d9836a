//! uTP wire header (BEP-29 family).
//!
//! This is the only place in the crate that touches wire bytes. It is
//! deliberately minimal: the selective-ack and other extensions are
//! parsed just enough to be skipped over, since the session layer this
//! crate specifies doesn't need them to demultiplex or order a stream.

use std::convert::TryInto;

pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Fin,
    State,
    Reset,
    Syn,
}

impl PacketType {
    fn from_nibble(n: u8) -> Option<PacketType> {
        match n {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }

    fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_diff_micros: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("packet shorter than the {HEADER_LEN}-byte header")]
    TooShort,
    #[error("unknown uTP packet type nibble {0}")]
    UnknownType(u8),
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u8),
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = (self.packet_type.to_nibble() << 4) | 1; // version 1
        out[1] = 0; // no extensions
        out[2..4].copy_from_slice(&self.connection_id.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp_micros.to_be_bytes());
        out[8..12].copy_from_slice(&self.timestamp_diff_micros.to_be_bytes());
        out[12..16].copy_from_slice(&self.wnd_size.to_be_bytes());
        out[16..18].copy_from_slice(&self.seq_nr.to_be_bytes());
        out[18..20].copy_from_slice(&self.ack_nr.to_be_bytes());
        out
    }

    /// Decodes the header, returning it along with the offset of the
    /// payload (after the header and any extension chain).
    pub fn decode(buf: &[u8]) -> Result<(Header, usize), DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort);
        }
        let version = buf[0] & 0x0f;
        if version != 1 {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let packet_type =
            PacketType::from_nibble(buf[0] >> 4).ok_or(DecodeError::UnknownType(buf[0] >> 4))?;
        let mut next_extension = buf[1];
        let connection_id = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let timestamp_micros = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let timestamp_diff_micros = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let wnd_size = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let seq_nr = u16::from_be_bytes(buf[16..18].try_into().unwrap());
        let ack_nr = u16::from_be_bytes(buf[18..20].try_into().unwrap());

        let mut offset = HEADER_LEN;
        while next_extension != 0 {
            if offset + 2 > buf.len() {
                break;
            }
            let kind = next_extension;
            let len = buf[offset + 1] as usize;
            next_extension = buf[offset];
            offset += 2 + len;
            let _ = kind;
        }

        Ok((
            Header {
                packet_type,
                connection_id,
                timestamp_micros,
                timestamp_diff_micros,
                wnd_size,
                seq_nr,
                ack_nr,
            },
            offset.min(buf.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(packet_type: PacketType) -> Header {
        Header {
            packet_type,
            connection_id: 0xBEEF,
            timestamp_micros: 123_456,
            timestamp_diff_micros: 7,
            wnd_size: 65536,
            seq_nr: 42,
            ack_nr: 41,
        }
    }

    #[test]
    fn round_trips_every_packet_type() {
        for pt in [
            PacketType::Data,
            PacketType::Fin,
            PacketType::State,
            PacketType::Reset,
            PacketType::Syn,
        ] {
            let h = sample(pt);
            let bytes = h.encode();
            let (decoded, offset) = Header::decode(&bytes).unwrap();
            assert_eq!(offset, HEADER_LEN);
            assert_eq!(decoded.packet_type, h.packet_type);
            assert_eq!(decoded.connection_id, h.connection_id);
            assert_eq!(decoded.seq_nr, h.seq_nr);
            assert_eq!(decoded.ack_nr, h.ack_nr);
        }
    }

    #[test]
    fn skips_a_single_extension() {
        let h = sample(PacketType::Data);
        let mut bytes = h.encode().to_vec();
        bytes[1] = 1; // first extension follows
        bytes.extend_from_slice(&[0, 4, 0, 0, 0, 0]); // kind=1(stop), len=4
        bytes.extend_from_slice(b"hi");
        let (decoded, offset) = Header::decode(&bytes).unwrap();
        assert_eq!(decoded.seq_nr, 42);
        assert_eq!(&bytes[offset..], b"hi");
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(Header::decode(&[0u8; 4]), Err(DecodeError::TooShort)));
    }
}
