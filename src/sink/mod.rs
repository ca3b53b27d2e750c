//! Consumers of track state snapshots.
//!
//! The scheduler worker pushes two kinds of data at a sink: ad-hoc point
//! clouds from draw commands, and a read-only view of every live track after
//! each drain cycle. Views borrow straight from the store and are valid only
//! for the duration of the call; a sink that needs the data longer must copy
//! it out.

pub mod udp;

use tracing::debug;

use crate::store::ring::LatestK;
use crate::track::{TrackHeader, TrackPoint};

/// Borrowed view of one live track.
pub struct TrackView<'a> {
    pub header: &'a TrackHeader,
    pub points: &'a LatestK<TrackPoint>,
}

/// Receives what the scheduler worker publishes between drain cycles.
pub trait TrackSink: Send {
    /// A point cloud forwarded from a draw command.
    fn point_cloud(&mut self, points: &[TrackPoint]);

    /// The state of every live track after a drain cycle.
    fn track_states(&mut self, tracks: &[TrackView<'_>]);
}

/// Stand-in visualizer that only logs what it is handed.
#[derive(Debug, Default)]
pub struct LogSink;

impl TrackSink for LogSink {
    fn point_cloud(&mut self, points: &[TrackPoint]) {
        debug!(count = points.len(), "point cloud");
    }

    fn track_states(&mut self, tracks: &[TrackView<'_>]) {
        debug!(count = tracks.len(), "live tracks");
    }
}
