//! Synthetic track generator.
//!
//! Drives the scheduler with plausible traffic for bring-up and soak runs:
//! seeds a batch of four-point tracks, then on every tick perturbs each
//! track's speed and course within acceleration bounds, dead-reckons the
//! next position, and emits the whole batch as add commands, optionally with
//! a cloud of unassociated detections for the display path.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::ThreadRng;
use rand::Rng;
use tracing::{debug, info};

use crate::scheduler::Scheduler;
use crate::track::{now_ms, TrackHeader, TrackPoint};

/// Knobs for the generated traffic.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// How many tracks to simulate.
    pub num_tracks: u32,
    /// Time between update batches.
    pub update_interval: Duration,

    /// Spawn area, degrees.
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,

    /// Speed range, m/s.
    pub min_speed: f64,
    pub max_speed: f64,

    /// Course range, degrees clockwise from north.
    pub min_course: f64,
    pub max_course: f64,

    /// Per-second jitter bounds applied to speed and course.
    pub max_accel_sog: f64,
    pub max_accel_cog: f64,

    /// Also emit a random unassociated point cloud each tick.
    pub draw_points: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_tracks: 30,
            update_interval: Duration::from_millis(1000),
            lon_min: 119.9,
            lon_max: 120.1,
            lat_min: 29.9,
            lat_max: 30.1,
            min_speed: 5.0,
            max_speed: 50.0,
            min_course: 0.0,
            max_course: 360.0,
            max_accel_sog: 10.0,
            max_accel_cog: 1.0,
            draw_points: true,
        }
    }
}

/// Background generator feeding a scheduler.
pub struct TrackSimulator {
    scheduler: Arc<Scheduler>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TrackSimulator {
    /// Seed the tracks and start the update thread.
    pub fn start(scheduler: Arc<Scheduler>, config: SimConfig) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = thread::Builder::new().name("track-sim".into()).spawn({
            let scheduler = Arc::clone(&scheduler);
            let stop = Arc::clone(&stop);
            move || run(scheduler, config, stop)
        })?;

        Ok(Self {
            scheduler,
            stop,
            worker: Some(worker),
        })
    }

    /// Stop the update thread and clear every simulated track.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            self.scheduler.clear_all();
        }
    }
}

impl Drop for TrackSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SimTrack {
    track_id: u32,
    point: TrackPoint,
}

fn run(scheduler: Arc<Scheduler>, config: SimConfig, stop: Arc<AtomicBool>) {
    let mut rng = rand::thread_rng();
    let dt = config.update_interval.as_secs_f64();

    // Seed every track with four dead-reckoned points and submit the batch.
    let mut tracks: Vec<SimTrack> = (1..=config.num_tracks)
        .map(|track_id| SimTrack {
            track_id,
            point: random_point(&mut rng, &config),
        })
        .collect();

    let seeds: Vec<[TrackPoint; 4]> = tracks
        .iter_mut()
        .map(|track| {
            let mut seed = [track.point; 4];
            for slot in seed.iter_mut().skip(1) {
                track.point = advance(&track.point, dt);
                *slot = track.point;
            }
            seed
        })
        .collect();
    scheduler.create_tracks(seeds);
    info!(tracks = config.num_tracks, "simulation seeded");

    let mut batch = 0u32;
    while !stop.load(Ordering::SeqCst) {
        nap(config.update_interval, &stop);
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let updates: Vec<(TrackHeader, TrackPoint)> = tracks
            .iter_mut()
            .map(|track| {
                perturb(&mut track.point, &mut rng, &config, dt);
                track.point = advance(&track.point, dt);
                (TrackHeader::live(track.track_id), track.point)
            })
            .collect();
        scheduler.add_points(updates);

        if config.draw_points {
            let cloud: Vec<TrackPoint> = (0..config.num_tracks)
                .map(|_| {
                    let mut point = random_point(&mut rng, &config);
                    point.is_associated = false;
                    point
                })
                .collect();
            scheduler.draw_points(cloud);
        }

        batch += 1;
        debug!(batch, "simulation batch submitted");
    }
}

/// Sleep in short slices so the stop flag is observed promptly.
fn nap(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(Duration::from_millis(50)));
    }
}

fn random_point(rng: &mut ThreadRng, config: &SimConfig) -> TrackPoint {
    TrackPoint {
        longitude: rng.gen_range(config.lon_min..=config.lon_max),
        latitude: rng.gen_range(config.lat_min..=config.lat_max),
        sog: rng.gen_range(config.min_speed..=config.max_speed),
        cog: rng.gen_range(config.min_course..=config.max_course),
        angle: rng.gen_range(0.0..=360.0),
        range: rng.gen_range(1.0..=50.0),
        is_associated: true,
        time_ms: now_ms(),
    }
}

/// Jitter speed and course within the configured per-second bounds.
fn perturb(point: &mut TrackPoint, rng: &mut ThreadRng, config: &SimConfig, dt: f64) {
    let dv = rng.gen_range(-config.max_accel_sog..=config.max_accel_sog) * dt;
    point.sog = (point.sog + dv).clamp(config.min_speed, config.max_speed);

    let dc = rng.gen_range(-config.max_accel_cog..=config.max_accel_cog) * dt;
    point.cog = wrap_course(point.cog + dc);
}

/// Dead-reckon one step along the current course.
fn advance(point: &TrackPoint, dt: f64) -> TrackPoint {
    // Meters per degree of latitude; longitude shrinks with cos(lat).
    const METERS_PER_DEGREE: f64 = 111_320.0;

    let course = point.cog.to_radians();
    let distance = point.sog * dt;

    let dlat = distance * course.cos() / METERS_PER_DEGREE;
    let dlon =
        distance * course.sin() / (METERS_PER_DEGREE * point.latitude.to_radians().cos());

    TrackPoint {
        longitude: point.longitude + dlon,
        latitude: point.latitude + dlat,
        time_ms: now_ms(),
        ..*point
    }
}

fn wrap_course(course: f64) -> f64 {
    course.rem_euclid(360.0)
}
