//! Fixed-layout wire codec for track headers and points.
//!
//! Both records serialize to little-endian fields at fixed offsets so a
//! packed track is a self-contained byte block: the 16-byte header followed
//! by the retained points, 64 bytes each.

use thiserror::Error;

use super::{TrackHeader, TrackPoint, TrackState};

/// Encoded size of a [`TrackHeader`].
pub const HEADER_WIRE_SIZE: usize = 16;

/// Encoded size of a [`TrackPoint`]. Six doubles, a flag byte padded to an
/// eight-byte boundary, and the timestamp.
pub const POINT_WIRE_SIZE: usize = 64;

/// Errors produced while decoding packed track data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("{kind} needs {need} bytes, got {size}")]
    Truncated {
        kind: &'static str,
        need: usize,
        size: usize,
    },

    #[error("invalid track state value {raw}")]
    InvalidState { raw: i32 },
}

/// Write a header into `dest`, returning the number of bytes written.
/// `dest` must hold at least [`HEADER_WIRE_SIZE`] bytes.
pub fn write_header(header: &TrackHeader, dest: &mut [u8]) -> usize {
    dest[0..4].copy_from_slice(&header.track_id.to_le_bytes());
    dest[4..8].copy_from_slice(&header.extrapolation.to_le_bytes());
    dest[8..12].copy_from_slice(&header.point_count.to_le_bytes());
    dest[12..16].copy_from_slice(&(header.state as i32).to_le_bytes());
    HEADER_WIRE_SIZE
}

/// Write a point into `dest`, returning the number of bytes written.
/// `dest` must hold at least [`POINT_WIRE_SIZE`] bytes.
pub fn write_point(point: &TrackPoint, dest: &mut [u8]) -> usize {
    dest[0..8].copy_from_slice(&point.longitude.to_le_bytes());
    dest[8..16].copy_from_slice(&point.latitude.to_le_bytes());
    dest[16..24].copy_from_slice(&point.sog.to_le_bytes());
    dest[24..32].copy_from_slice(&point.cog.to_le_bytes());
    dest[32..40].copy_from_slice(&point.angle.to_le_bytes());
    dest[40..48].copy_from_slice(&point.range.to_le_bytes());
    dest[48] = u8::from(point.is_associated);
    dest[49..56].fill(0);
    dest[56..64].copy_from_slice(&point.time_ms.to_le_bytes());
    POINT_WIRE_SIZE
}

/// Decode a header from the start of `data`.
pub fn decode_header(data: &[u8]) -> Result<TrackHeader, CodecError> {
    if data.len() < HEADER_WIRE_SIZE {
        return Err(CodecError::Truncated {
            kind: "track header",
            need: HEADER_WIRE_SIZE,
            size: data.len(),
        });
    }

    let raw_state = read_i32_le(data, 12);
    let state = TrackState::from_i32(raw_state).ok_or(CodecError::InvalidState { raw: raw_state })?;

    Ok(TrackHeader {
        track_id: read_u32_le(data, 0),
        extrapolation: read_u32_le(data, 4),
        point_count: read_u32_le(data, 8),
        state,
    })
}

/// Decode a point from the start of `data`.
pub fn decode_point(data: &[u8]) -> Result<TrackPoint, CodecError> {
    if data.len() < POINT_WIRE_SIZE {
        return Err(CodecError::Truncated {
            kind: "track point",
            need: POINT_WIRE_SIZE,
            size: data.len(),
        });
    }

    Ok(TrackPoint {
        longitude: read_f64_le(data, 0),
        latitude: read_f64_le(data, 8),
        sog: read_f64_le(data, 16),
        cog: read_f64_le(data, 24),
        angle: read_f64_le(data, 32),
        range: read_f64_le(data, 40),
        is_associated: data[48] != 0,
        time_ms: read_i64_le(data, 56),
    })
}

// ---------------------------------------------------------------------------
// Fixed-width little-endian readers
// ---------------------------------------------------------------------------

#[inline]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline]
fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline]
fn read_i64_le(data: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline]
fn read_f64_le(data: &[u8], offset: usize) -> f64 {
    f64::from_le_bytes(read_fixed::<8>(data, offset))
}
