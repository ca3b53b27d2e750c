//! Single-writer command scheduler.
//!
//! One worker thread owns the track store exclusively and drains a
//! multi-producer queue in strict priority classes: draw > merge > create >
//! add > clear-all. Within a class, commands run in the order producers
//! enqueued them. The design is starvation-tolerant by construction: a
//! sustained stream of a higher class delays everything below it
//! indefinitely, with no quota or aging to compensate.
//!
//! Producer calls are fire-and-forget: they copy the payload into the queue,
//! wake the worker, and return. Per-command failures are logged and
//! swallowed; nothing is reported back.

pub mod command;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::sink::{TrackSink, TrackView};
use crate::store::TrackStore;
use crate::track::{TrackHeader, TrackPoint};

use self::command::Command;

struct Shared {
    queue: Mutex<VecDeque<Command>>,
    available: Condvar,
    stop: AtomicBool,
}

/// Handle to the scheduler worker. Cloning producers share it via `Arc`.
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker thread, transferring ownership of the store and sink
    /// to it.
    pub fn new(store: TrackStore, sink: Box<dyn TrackSink + Send>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("track-scheduler".into())
            .spawn(move || worker_loop(worker_shared, store, sink))?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Forward a point cloud to the visualizer sink.
    pub fn draw_points(&self, points: Vec<TrackPoint>) {
        self.enqueue(Command::Draw(points));
    }

    /// Request fusion of `source_id` into `target_id`.
    pub fn merge(&self, source_id: u32, target_id: u32) {
        self.enqueue(Command::Merge {
            source_id,
            target_id,
        });
    }

    /// Create one track per four-point seed array.
    pub fn create_tracks(&self, tracks: Vec<[TrackPoint; 4]>) {
        self.enqueue(Command::Create(tracks));
    }

    /// Append one point per `(header, point)` update.
    pub fn add_points(&self, updates: Vec<(TrackHeader, TrackPoint)>) {
        self.enqueue(Command::Add(updates));
    }

    /// Reset the entire store.
    pub fn clear_all(&self) {
        self.enqueue(Command::ClearAll);
    }

    /// Stop the worker after it drains every command accepted so far.
    /// Idempotent; also runs on drop.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("scheduler worker panicked");
            }
        }
    }

    fn enqueue(&self, command: Command) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(command);
        self.shared.available.notify_one();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>, mut store: TrackStore, mut sink: Box<dyn TrackSink + Send>) {
    debug!("scheduler worker started");

    loop {
        let mut progressed = false;
        while let Some(batch) = {
            let mut queue = shared.queue.lock();
            take_highest_class(&mut queue)
        } {
            progressed = true;
            for command in batch {
                apply_command(&mut store, sink.as_mut(), command);
            }
        }

        // The sink observes the store between drain cycles, after the work.
        if progressed {
            publish_states(&store, sink.as_mut());
        }

        let mut queue = shared.queue.lock();
        if queue.is_empty() {
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            shared.available.wait(&mut queue);
        }
    }

    debug!("scheduler worker stopped");
}

/// Remove and return every queued command of the highest non-empty priority
/// class, preserving enqueue order; the rest of the queue is untouched.
fn take_highest_class(queue: &mut VecDeque<Command>) -> Option<Vec<Command>> {
    let best = queue.iter().map(Command::priority).min()?;

    let mut batch = Vec::new();
    let mut rest = VecDeque::with_capacity(queue.len());
    for command in queue.drain(..) {
        if command.priority() == best {
            batch.push(command);
        } else {
            rest.push_back(command);
        }
    }
    *queue = rest;
    Some(batch)
}

fn apply_command(store: &mut TrackStore, sink: &mut dyn TrackSink, command: Command) {
    match command {
        Command::Draw(points) => sink.point_cloud(&points),

        Command::Merge {
            source_id,
            target_id,
        } => {
            if let Err(e) = store.merge_tracks(source_id, target_id) {
                warn!(source_id, target_id, error = %e, "merge failed");
            }
        }

        Command::Create(tracks) => {
            for points in tracks {
                match store.create_track() {
                    Ok(id) => {
                        for point in points {
                            if let Err(e) = store.push_point(id, point) {
                                warn!(track_id = id, error = %e, "create rolled back");
                                if store.is_valid(id) {
                                    let _ = store.delete_track(id);
                                }
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "create failed"),
                }
            }
        }

        Command::Add(updates) => {
            for (header, point) in updates {
                if let Err(e) = store.push_point(header.track_id, point) {
                    warn!(track_id = header.track_id, error = %e, "add skipped");
                }
            }
        }

        Command::ClearAll => store.clear_all(),
    }
}

fn publish_states(store: &TrackStore, sink: &mut dyn TrackSink) {
    let ids = store.active_ids();
    let views: Vec<TrackView<'_>> = ids
        .iter()
        .filter_map(|&id| {
            Some(TrackView {
                header: store.header(id)?,
                points: store.points(id)?,
            })
        })
        .collect();
    sink.track_states(&views);
}
