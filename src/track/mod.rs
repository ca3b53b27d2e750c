pub mod codec;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Track id value that never names a live track.
pub const INVALID_TRACK_ID: u32 = 0;

/// Maximum consecutive unassociated updates a track survives. One more
/// unassociated update terminates it.
pub const MAX_EXTRAPOLATION: u32 = 3;

/// Lifecycle state of a track record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum TrackState {
    /// Fresh associated observations are arriving.
    Normal = 0,
    /// Coasting on extrapolated updates while the target is unobserved.
    Extrapolated = 1,
    /// Terminal; resolved to [`TrackState::Free`] within the same store call.
    Terminated = 2,
    /// The record is not assigned to any track.
    #[default]
    Free = 3,
}

impl TrackState {
    /// Returns the canonical log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Extrapolated => "extrapolated",
            Self::Terminated => "terminated",
            Self::Free => "free",
        }
    }

    /// Convert from a raw wire value. Historic encoders wrote -1 for a
    /// cleared record; both -1 and 3 decode as `Free`.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Normal),
            1 => Some(Self::Extrapolated),
            2 => Some(Self::Terminated),
            3 | -1 => Some(Self::Free),
            _ => None,
        }
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time-stamped observation attributed to a track.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackPoint {
    /// Longitude in degrees.
    pub longitude: f64,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Speed over ground, m/s.
    pub sog: f64,
    /// Course over ground, degrees clockwise from north.
    pub cog: f64,
    /// Observation angle, degrees clockwise from the sensor normal.
    pub angle: f64,
    /// Observation range from the sensor, km.
    pub range: f64,
    /// Whether the upstream pipeline associated this observation with the
    /// track, as opposed to extrapolating it.
    pub is_associated: bool,
    /// Observation time, milliseconds since the Unix epoch.
    pub time_ms: i64,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-track bookkeeping carried alongside the point history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackHeader {
    /// Stable track identifier; [`INVALID_TRACK_ID`] when the record is free.
    pub track_id: u32,
    /// Consecutive unassociated updates, bounded by [`MAX_EXTRAPOLATION`].
    pub extrapolation: u32,
    /// Number of points currently retained.
    pub point_count: u32,
    /// Lifecycle state.
    pub state: TrackState,
}

impl TrackHeader {
    /// A header for a freshly created live track.
    pub fn live(track_id: u32) -> Self {
        let mut header = Self::default();
        header.start(track_id);
        header
    }

    /// Reset the header for a newly assigned track.
    pub fn start(&mut self, track_id: u32) {
        self.track_id = track_id;
        self.extrapolation = 0;
        self.point_count = 0;
        self.state = TrackState::Normal;
    }

    /// Return the header to the unassigned state.
    pub fn clear(&mut self) {
        self.track_id = INVALID_TRACK_ID;
        self.extrapolation = 0;
        self.point_count = 0;
        self.state = TrackState::Free;
    }
}

impl Default for TrackHeader {
    fn default() -> Self {
        Self {
            track_id: INVALID_TRACK_ID,
            extrapolation: 0,
            point_count: 0,
            state: TrackState::Free,
        }
    }
}
