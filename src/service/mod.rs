//! Service façade tying the core together.
//!
//! Owns the scheduler (which owns the store), the datagram transport, and the
//! configuration. Upstream pipeline stages hand over finished buffers through
//! [`TrackService::on_pipeline_complete`] and operators request fusion through
//! [`TrackService::on_track_fusion`]; both return immediately. A dedicated
//! service thread translates buffers into scheduler commands, turns inbound
//! datagram words into fusion requests, and periodically reloads the
//! configuration, rebinding the transport when the receive port changes.
//!
//! Every per-item failure is logged and swallowed. Nothing here reports
//! success or failure back to producers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::config::TrackConfig;
use crate::scheduler::Scheduler;
use crate::sink::udp::UdpPublisher;
use crate::sink::TrackSink;
use crate::store::TrackStore;
use crate::track::{TrackHeader, TrackPoint};
use crate::transport::Transport;

/// How long the service thread sleeps waiting for work before it polls the
/// transport and the reload timer anyway.
const SERVICE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Sizing and cadence knobs for a service instance.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Maximum live tracks.
    pub track_capacity: usize,
    /// Points retained per track.
    pub point_capacity: usize,
    /// How often the configuration file is re-read.
    pub reload_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            track_capacity: 2000,
            point_capacity: 2000,
            reload_interval: Duration::from_secs(60),
        }
    }
}

/// One completed pass of the upstream pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuffer {
    /// Raw detections for display.
    pub detected: Vec<TrackPoint>,
    /// Four-point seeds for tracks the pipeline just established.
    pub new_tracks: Vec<[TrackPoint; 4]>,
    /// Filtered updates for existing tracks.
    pub updates: Vec<(TrackHeader, TrackPoint)>,
}

impl PipelineBuffer {
    pub fn is_empty(&self) -> bool {
        self.detected.is_empty() && self.new_tracks.is_empty() && self.updates.is_empty()
    }
}

struct ServiceShared {
    inbound: Mutex<Vec<PipelineBuffer>>,
    available: Condvar,
    stop: AtomicBool,
    config: Mutex<TrackConfig>,
    config_path: PathBuf,
}

/// The track management service.
pub struct TrackService {
    scheduler: Arc<Scheduler>,
    shared: Arc<ServiceShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrackService {
    /// Load the configuration, bind the transport, and start the scheduler
    /// and service threads. An unreadable or malformed initial configuration
    /// is fatal and surfaces here.
    ///
    /// `visualizer` receives point clouds and per-cycle track snapshots; the
    /// same snapshots are also published over the transport.
    pub fn new(
        config_path: &Path,
        options: ServiceOptions,
        visualizer: Box<dyn TrackSink + Send>,
    ) -> Result<Self> {
        let config = TrackConfig::load(config_path).with_context(|| {
            format!("loading initial configuration {}", config_path.display())
        })?;

        let transport = Arc::new(Transport::new(&config).context("creating transport")?);

        let store = TrackStore::new(options.track_capacity, options.point_capacity);
        let sink = Box::new(UdpPublisher::new(Arc::clone(&transport), visualizer));
        let scheduler =
            Arc::new(Scheduler::new(store, sink).context("spawning scheduler worker")?);

        let shared = Arc::new(ServiceShared {
            inbound: Mutex::new(Vec::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
            config: Mutex::new(config),
            config_path: config_path.to_path_buf(),
        });

        let worker = thread::Builder::new()
            .name("track-service".into())
            .spawn({
                let shared = Arc::clone(&shared);
                let scheduler = Arc::clone(&scheduler);
                let reload_interval = options.reload_interval;
                move || service_loop(shared, scheduler, transport, reload_interval)
            })
            .context("spawning service thread")?;

        info!(
            track_capacity = options.track_capacity,
            point_capacity = options.point_capacity,
            "track service started",
        );

        Ok(Self {
            scheduler,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Hand over a finished pipeline buffer. Returns immediately.
    pub fn on_pipeline_complete(&self, buffer: PipelineBuffer) {
        let mut inbound = self.shared.inbound.lock();
        inbound.push(buffer);
        self.shared.available.notify_one();
    }

    /// Request fusion of `source_id` into `target_id`. Returns immediately.
    pub fn on_track_fusion(&self, source_id: u32, target_id: u32) {
        info!(source_id, target_id, "fusion requested");
        self.scheduler.merge(source_id, target_id);
    }

    /// Shared handle to the command scheduler, for harness producers.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> TrackConfig {
        self.shared.config.lock().clone()
    }

    /// Stop the service thread (after it drains accepted buffers), then the
    /// scheduler. Idempotent; also runs on drop.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("service thread panicked");
            }
        }
        self.scheduler.stop();
    }
}

impl Drop for TrackService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn service_loop(
    shared: Arc<ServiceShared>,
    scheduler: Arc<Scheduler>,
    transport: Arc<Transport>,
    reload_interval: Duration,
) {
    let mut last_reload = Instant::now();

    loop {
        let buffers: Vec<PipelineBuffer> = {
            let mut inbound = shared.inbound.lock();
            if inbound.is_empty() && !shared.stop.load(Ordering::SeqCst) {
                let _ = shared.available.wait_for(&mut inbound, SERVICE_POLL_TIMEOUT);
            }
            std::mem::take(&mut *inbound)
        };

        for buffer in buffers {
            dispatch_buffer(&scheduler, buffer);
        }

        let words = transport.take_all();
        if !words.is_empty() {
            dispatch_fusion_words(&scheduler, &words);
        }

        if last_reload.elapsed() >= reload_interval {
            reload_config(&shared, &transport);
            last_reload = Instant::now();
        }

        if shared.stop.load(Ordering::SeqCst) && shared.inbound.lock().is_empty() {
            break;
        }
    }
}

/// Translate one pipeline buffer into scheduler commands.
fn dispatch_buffer(scheduler: &Scheduler, buffer: PipelineBuffer) {
    if !buffer.detected.is_empty() {
        scheduler.draw_points(buffer.detected);
    }
    if !buffer.new_tracks.is_empty() {
        scheduler.create_tracks(buffer.new_tracks);
    }
    if !buffer.updates.is_empty() {
        scheduler.add_points(buffer.updates);
    }
}

/// Inbound command words arrive as `(source_id, target_id)` pairs.
fn dispatch_fusion_words(scheduler: &Scheduler, words: &[u32]) {
    let mut pairs = words.chunks_exact(2);
    for pair in &mut pairs {
        info!(source_id = pair[0], target_id = pair[1], "inbound fusion command");
        scheduler.merge(pair[0], pair[1]);
    }
    if !pairs.remainder().is_empty() {
        warn!(
            words = words.len(),
            "odd trailing word in fusion command buffer, dropped",
        );
    }
}

fn reload_config(shared: &ServiceShared, transport: &Transport) {
    let previous = shared.config.lock().clone();
    let mut next = previous.clone();

    match next.reload(&shared.config_path) {
        Ok(()) => {
            let port_changed = next.recv_port != previous.recv_port;
            *shared.config.lock() = next.clone();

            if port_changed {
                match transport.reload(&next) {
                    Ok(()) => info!(port = next.recv_port, "transport rebound"),
                    Err(e) => warn!(error = %e, "transport rebind failed"),
                }
            }
        }
        Err(e) => warn!(error = %e, "config reload failed, keeping previous"),
    }
}
