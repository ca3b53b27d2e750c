//! End-to-end flows through the public service and scheduler APIs.

use std::io::Write;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use trackmgr::service::{PipelineBuffer, ServiceOptions, TrackService};
use trackmgr::sink::{TrackSink, TrackView};
use trackmgr::track::{TrackHeader, TrackPoint, TrackState};

/// Grab a currently free UDP port.
fn free_port() -> u16 {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("bind ephemeral");
    socket.local_addr().expect("local addr").port()
}

fn config_file(recv_port: u16, dst_port: u16) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    write!(
        file,
        "trackmanager_dst_ip = 127.0.0.1\n\
         trackmanager_dst_port = {dst_port}\n\
         trackmanager_recv_port = {recv_port}\n\
         trackmanager_recv_filters = TRACK_MERGE_COMMAND\n",
    )
    .expect("write config");
    file
}

fn point(longitude: f64, associated: bool) -> TrackPoint {
    TrackPoint {
        longitude,
        latitude: 30.0,
        sog: 10.0,
        cog: 90.0,
        is_associated: associated,
        ..TrackPoint::default()
    }
}

fn seed(base: f64) -> [TrackPoint; 4] {
    [
        point(base, true),
        point(base + 0.01, true),
        point(base + 0.02, true),
        point(base + 0.03, true),
    ]
}

type Snapshot = Vec<(TrackHeader, Vec<TrackPoint>)>;

#[derive(Default)]
struct Recording {
    clouds: Vec<Vec<TrackPoint>>,
    states: Vec<Snapshot>,
}

struct RecordingSink(Arc<Mutex<Recording>>);

impl TrackSink for RecordingSink {
    fn point_cloud(&mut self, points: &[TrackPoint]) {
        self.0.lock().clouds.push(points.to_vec());
    }

    fn track_states(&mut self, tracks: &[TrackView<'_>]) {
        let owned = tracks
            .iter()
            .map(|view| (*view.header, view.points.iter().copied().collect()))
            .collect();
        self.0.lock().states.push(owned);
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn start_service(recording: &Arc<Mutex<Recording>>) -> (TrackService, NamedTempFile) {
    let file = config_file(free_port(), free_port());
    let service = TrackService::new(
        file.path(),
        ServiceOptions {
            track_capacity: 32,
            point_capacity: 16,
            reload_interval: Duration::from_secs(3600),
        },
        Box::new(RecordingSink(Arc::clone(recording))),
    )
    .expect("service starts");
    (service, file)
}

#[test]
fn test_pipeline_buffer_creates_and_updates_tracks() {
    let recording = Arc::new(Mutex::new(Recording::default()));
    let (service, _config) = start_service(&recording);

    service.on_pipeline_complete(PipelineBuffer {
        detected: vec![point(119.5, false), point(119.6, false)],
        new_tracks: vec![seed(120.0)],
        updates: Vec::new(),
    });

    assert!(wait_until(Duration::from_secs(2), || {
        let snapshot = recording.lock();
        !snapshot.clouds.is_empty()
            && snapshot
                .states
                .last()
                .is_some_and(|tracks| tracks.len() == 1 && tracks[0].1.len() == 4)
    }));

    // Update the created track through a second buffer.
    service.on_pipeline_complete(PipelineBuffer {
        updates: vec![(TrackHeader::live(1), point(120.04, true))],
        ..PipelineBuffer::default()
    });

    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 1 && tracks[0].1.len() == 5)
    }));

    let snapshot = recording.lock();
    let (header, points) = &snapshot.states.last().expect("snapshots")[0];
    assert_eq!(header.track_id, 1);
    assert_eq!(header.state, TrackState::Normal);
    assert_eq!(points.last().expect("points").longitude, 120.04);
}

#[test]
fn test_fusion_keeps_target_identity() {
    let recording = Arc::new(Mutex::new(Recording::default()));
    let (service, _config) = start_service(&recording);

    service.on_pipeline_complete(PipelineBuffer {
        new_tracks: vec![seed(1.0), seed(2.0)],
        ..PipelineBuffer::default()
    });

    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 2)
    }));

    // Track 2 is the newer interpretation of track 1.
    service.on_track_fusion(2, 1);

    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 1)
    }));

    let snapshot = recording.lock();
    let (header, points) = &snapshot.states.last().expect("snapshots")[0];
    assert_eq!(header.track_id, 1);
    let longitudes: Vec<f64> = points.iter().map(|p| p.longitude).collect();
    assert_eq!(longitudes, vec![1.0, 2.01, 2.02, 2.03]);
}

#[test]
fn test_unknown_fusion_is_swallowed() {
    let recording = Arc::new(Mutex::new(Recording::default()));
    let (service, _config) = start_service(&recording);

    service.on_track_fusion(100, 200);

    // The service keeps working afterwards.
    service.on_pipeline_complete(PipelineBuffer {
        new_tracks: vec![seed(5.0)],
        ..PipelineBuffer::default()
    });

    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 1)
    }));
}

#[test]
fn test_clear_all_empties_the_store() {
    let recording = Arc::new(Mutex::new(Recording::default()));
    let (service, _config) = start_service(&recording);
    let scheduler = service.scheduler();

    service.on_pipeline_complete(PipelineBuffer {
        new_tracks: vec![seed(1.0), seed(2.0), seed(3.0)],
        ..PipelineBuffer::default()
    });
    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 3)
    }));

    scheduler.clear_all();
    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.is_empty())
    }));
}

#[test]
fn test_inbound_fusion_datagram_reaches_store() {
    let recording = Arc::new(Mutex::new(Recording::default()));
    let recv_port = free_port();
    let file = config_file(recv_port, free_port());
    let service = TrackService::new(
        file.path(),
        ServiceOptions {
            track_capacity: 32,
            point_capacity: 16,
            reload_interval: Duration::from_secs(3600),
        },
        Box::new(RecordingSink(Arc::clone(&recording))),
    )
    .expect("service starts");

    service.on_pipeline_complete(PipelineBuffer {
        new_tracks: vec![seed(1.0), seed(2.0)],
        ..PipelineBuffer::default()
    });
    assert!(wait_until(Duration::from_secs(2), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 2)
    }));

    // Craft a fusion command datagram: merge source 2 into target 1.
    let payload: Vec<u8> = [2u32, 1u32]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
    let mut header = trackmgr::transport::packet::PacketHeader::for_fragment(
        0,
        1,
        payload.len() as u32,
        payload.len() as u32,
        trackmgr::transport::packet::xor_checksum(&payload),
    );
    let id = b"TRACK_MERGE_COMMAND";
    header.packet_id = [0u8; 128];
    header.packet_id[..id.len()].copy_from_slice(id);

    let mut datagram = header.encode().to_vec();
    datagram.extend_from_slice(&payload);

    let sender = UdpSocket::bind(("127.0.0.1", 0)).expect("bind sender");
    sender
        .send_to(&datagram, ("127.0.0.1", recv_port))
        .expect("send fusion command");

    assert!(wait_until(Duration::from_secs(3), || {
        recording
            .lock()
            .states
            .last()
            .is_some_and(|tracks| tracks.len() == 1 && tracks[0].0.track_id == 1)
    }));
}
