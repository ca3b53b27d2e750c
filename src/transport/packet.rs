//! Wire header for fragmented datagrams.
//!
//! Every datagram starts with a 160-byte packed header: a 128-byte
//! null-padded packet id followed by five little-endian `u32` fields and 12
//! reserved zero bytes. The checksum is the XOR of the fragment payload read
//! as little-endian 32-bit words, with a 1–3 byte tail zero-extended into the
//! low bytes of a final word.

use thiserror::Error;

/// Largest datagram ever put on the wire.
pub const MAX_DATAGRAM: usize = 4096;

/// Encoded header size.
pub const HEADER_SIZE: usize = 160;

/// Payload capacity of a single fragment.
pub const FRAGMENT_PAYLOAD_MAX: usize = MAX_DATAGRAM - HEADER_SIZE;

/// Size of the packet-id field.
pub const PACKET_ID_SIZE: usize = 128;

/// Prefix stamped on every outbound fragment; the full id is
/// `TRACK_PACKET_<index>_<total>`.
pub const SEND_PACKET_ID: &str = "TRACK_PACKET";

/// Errors produced while decoding a datagram header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {size} bytes is shorter than the {HEADER_SIZE} byte header")]
    Truncated { size: usize },
}

/// Decoded form of the packed wire header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// ASCII id, null-padded to [`PACKET_ID_SIZE`].
    pub packet_id: [u8; PACKET_ID_SIZE],
    /// How many fragments the original payload was split into.
    pub total_fragments: u32,
    /// Zero-based index of this fragment.
    pub fragment_index: u32,
    /// Byte size of the original, unfragmented payload.
    pub total_size: u32,
    /// Byte size of this fragment's payload.
    pub fragment_size: u32,
    /// XOR checksum over this fragment's payload.
    pub checksum: u32,
}

impl PacketHeader {
    /// Build the header for one outbound fragment.
    pub fn for_fragment(
        fragment_index: u32,
        total_fragments: u32,
        total_size: u32,
        fragment_size: u32,
        checksum: u32,
    ) -> Self {
        let mut packet_id = [0u8; PACKET_ID_SIZE];
        let id = format!("{SEND_PACKET_ID}_{fragment_index}_{total_fragments}");
        let len = id.len().min(PACKET_ID_SIZE - 1);
        packet_id[..len].copy_from_slice(&id.as_bytes()[..len]);

        Self {
            packet_id,
            total_fragments,
            fragment_index,
            total_size,
            fragment_size,
            checksum,
        }
    }

    /// Serialize into the packed wire layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..PACKET_ID_SIZE].copy_from_slice(&self.packet_id);
        buf[128..132].copy_from_slice(&self.total_fragments.to_le_bytes());
        buf[132..136].copy_from_slice(&self.fragment_index.to_le_bytes());
        buf[136..140].copy_from_slice(&self.total_size.to_le_bytes());
        buf[140..144].copy_from_slice(&self.fragment_size.to_le_bytes());
        buf[144..148].copy_from_slice(&self.checksum.to_le_bytes());
        // Bytes 148..160 stay reserved zero.
        buf
    }

    /// Parse the header at the start of a received datagram.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::Truncated { size: data.len() });
        }

        let mut packet_id = [0u8; PACKET_ID_SIZE];
        packet_id.copy_from_slice(&data[..PACKET_ID_SIZE]);

        Ok(Self {
            packet_id,
            total_fragments: read_u32_le(data, 128),
            fragment_index: read_u32_le(data, 132),
            total_size: read_u32_le(data, 136),
            fragment_size: read_u32_le(data, 140),
            checksum: read_u32_le(data, 144),
        })
    }

    /// The packet id up to its first NUL, lossily decoded.
    pub fn id_text(&self) -> String {
        let end = self
            .packet_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PACKET_ID_SIZE);
        String::from_utf8_lossy(&self.packet_id[..end]).into_owned()
    }

    /// Whether the id contains any of the configured filter strings.
    pub fn matches_filter(&self, filters: &[String]) -> bool {
        let id = self.id_text();
        !id.is_empty() && filters.iter().any(|f| id.contains(f.as_str()))
    }
}

/// XOR of `data` interpreted as little-endian 32-bit words; a trailing 1–3
/// bytes are zero-extended into the low bytes of a final word.
pub fn xor_checksum(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(4);
    let mut sum = 0u32;
    for chunk in &mut chunks {
        sum ^= u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut last = [0u8; 4];
        last[..tail.len()].copy_from_slice(tail);
        sum ^= u32::from_le_bytes(last);
    }
    sum
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
