//! Publishes live track state over the datagram transport.

use std::sync::Arc;

use tracing::warn;

use crate::track::codec::{self, HEADER_WIRE_SIZE, POINT_WIRE_SIZE};
use crate::track::TrackPoint;
use crate::transport::Transport;

use super::{TrackSink, TrackView};

/// Sink that packs each live track (header followed by its retained points)
/// into a word payload and sends it downstream after every drain cycle, then
/// forwards the snapshot to an inner sink.
///
/// Send failures are logged and swallowed; publishing is best-effort.
pub struct UdpPublisher {
    transport: Arc<Transport>,
    inner: Box<dyn TrackSink + Send>,
    scratch: Vec<u8>,
    words: Vec<u32>,
}

impl UdpPublisher {
    pub fn new(transport: Arc<Transport>, inner: Box<dyn TrackSink + Send>) -> Self {
        Self {
            transport,
            inner,
            scratch: Vec::new(),
            words: Vec::new(),
        }
    }
}

impl TrackSink for UdpPublisher {
    fn point_cloud(&mut self, points: &[TrackPoint]) {
        self.inner.point_cloud(points);
    }

    fn track_states(&mut self, tracks: &[TrackView<'_>]) {
        for view in tracks {
            let packed = HEADER_WIRE_SIZE + view.points.len() * POINT_WIRE_SIZE;
            self.scratch.clear();
            self.scratch.resize(packed, 0);

            let mut offset = codec::write_header(view.header, &mut self.scratch);
            for point in view.points.iter() {
                offset += codec::write_point(point, &mut self.scratch[offset..]);
            }

            // Both record sizes are multiples of four, so this divides evenly.
            self.words.clear();
            self.words.extend(
                self.scratch[..offset]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );

            if let Err(e) = self.transport.send(&self.words) {
                warn!(track_id = view.header.track_id, error = %e, "track publish failed");
            }
        }

        self.inner.track_states(tracks);
    }
}
