//! Authoritative pool of live track records.
//!
//! A fixed number of record slots is allocated once at construction; live
//! tracks are addressed through a stable id → slot mapping and freed slots
//! return to a free list. The store is intentionally single-writer: the
//! scheduler worker owns it exclusively, so no internal locking exists.

pub mod ring;

use std::collections::HashMap;

use thiserror::Error;

use crate::track::codec::{self, HEADER_WIRE_SIZE, POINT_WIRE_SIZE};
use crate::track::{TrackHeader, TrackPoint, TrackState, MAX_EXTRAPOLATION};

use self::ring::LatestK;

/// Structured failures reported by store operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Every record slot is assigned to a live track.
    #[error("track pool is full")]
    PoolFull,

    /// The id does not name a live track.
    #[error("unknown track id {0}")]
    UnknownId(u32),

    /// The track reached its extrapolation bound and was deleted during this
    /// call. Not an error so much as a signal that the track is gone.
    #[error("track {0} terminated")]
    Terminated(u32),

    /// A merge needs at least [`MAX_EXTRAPOLATION`] points on both sides.
    #[error("track {id} has {have} points, merge needs {need}")]
    InsufficientPoints { id: u32, have: usize, need: usize },

    /// A track cannot be merged into itself.
    #[error("cannot merge track {0} into itself")]
    SelfMerge(u32),
}

struct TrackSlot {
    header: TrackHeader,
    points: LatestK<TrackPoint>,
}

/// Fixed-capacity pool of track records.
pub struct TrackStore {
    slots: Vec<TrackSlot>,
    index: HashMap<u32, usize>,
    free: Vec<usize>,
    next_id: u32,
}

impl TrackStore {
    /// Create a store for `track_capacity` tracks of `point_capacity` points
    /// each. Both allocations happen here, exactly once.
    ///
    /// # Panics
    ///
    /// Panics if either capacity is zero.
    pub fn new(track_capacity: usize, point_capacity: usize) -> Self {
        assert!(track_capacity > 0, "track capacity must be positive");
        let slots = (0..track_capacity)
            .map(|_| TrackSlot {
                header: TrackHeader::default(),
                points: LatestK::new(point_capacity),
            })
            .collect();

        Self {
            slots,
            index: HashMap::with_capacity(track_capacity),
            free: (0..track_capacity).collect(),
            next_id: 1,
        }
    }

    /// Assign a free slot to a new track and return its id.
    pub fn create_track(&mut self) -> Result<u32, StoreError> {
        let slot = self.free.pop().ok_or(StoreError::PoolFull)?;
        let id = self.next_id;
        self.slots[slot].header.start(id);
        self.index.insert(id, slot);
        self.next_id += 1;
        Ok(id)
    }

    /// Remove a live track, clear its record, and free the slot.
    pub fn delete_track(&mut self, id: u32) -> Result<(), StoreError> {
        let slot = self.index.remove(&id).ok_or(StoreError::UnknownId(id))?;
        self.slots[slot].header.clear();
        self.slots[slot].points.clear();
        self.free.push(slot);
        Ok(())
    }

    /// Append an observation to a track, advancing its lifecycle.
    ///
    /// An associated point walks the extrapolation counter back toward zero
    /// and restores `Normal`. An unassociated point advances it; once the
    /// bound would be exceeded, the track is deleted within this call and
    /// [`StoreError::Terminated`] is returned.
    pub fn push_point(&mut self, id: u32, point: TrackPoint) -> Result<(), StoreError> {
        let slot = *self.index.get(&id).ok_or(StoreError::UnknownId(id))?;

        // A record should never rest in Terminated, but a stale one is
        // reconciled the same way: the track ceases to exist.
        if self.slots[slot].header.state == TrackState::Terminated {
            self.delete_track(id)?;
            return Err(StoreError::Terminated(id));
        }

        let record = &mut self.slots[slot];
        record.points.push(point);
        record.header.point_count = record.points.len() as u32;

        if point.is_associated {
            record.header.extrapolation = record.header.extrapolation.saturating_sub(1);
            record.header.state = TrackState::Normal;
        } else if record.header.extrapolation < MAX_EXTRAPOLATION {
            record.header.extrapolation += 1;
            record.header.state = TrackState::Extrapolated;
        } else {
            record.header.state = TrackState::Terminated;
            self.delete_track(id)?;
            return Err(StoreError::Terminated(id));
        }

        Ok(())
    }

    /// Merge two tracks after an operator declares them the same target.
    ///
    /// The source is the newer interpretation, the target the older identity
    /// that survives: the target's last [`MAX_EXTRAPOLATION`] points are
    /// overwritten by the source's, the target record adopts the source's
    /// extrapolation counter and state, and the source is deleted. Callers
    /// must serialize this with all other store operations.
    pub fn merge_tracks(&mut self, source_id: u32, target_id: u32) -> Result<(), StoreError> {
        if source_id == target_id {
            return Err(StoreError::SelfMerge(source_id));
        }
        let source = *self
            .index
            .get(&source_id)
            .ok_or(StoreError::UnknownId(source_id))?;
        let target = *self
            .index
            .get(&target_id)
            .ok_or(StoreError::UnknownId(target_id))?;

        let need = MAX_EXTRAPOLATION as usize;
        let source_len = self.slots[source].points.len();
        let target_len = self.slots[target].points.len();
        if source_len < need {
            return Err(StoreError::InsufficientPoints {
                id: source_id,
                have: source_len,
                need,
            });
        }
        if target_len < need {
            return Err(StoreError::InsufficientPoints {
                id: target_id,
                have: target_len,
                need,
            });
        }

        // Graft the source's newest points over the target's extrapolated tail.
        let mut grafted = [TrackPoint::default(); MAX_EXTRAPOLATION as usize];
        for (i, slot) in grafted.iter_mut().enumerate() {
            *slot = self.slots[source].points[source_len - need + i];
        }
        for (i, point) in grafted.iter().enumerate() {
            self.slots[target].points[target_len - need + i] = *point;
        }

        // The survivor keeps the target's identity but carries the source's
        // lifecycle counters forward.
        let source_header = self.slots[source].header;
        let target_record = &mut self.slots[target];
        target_record.header.extrapolation = source_header.extrapolation;
        target_record.header.state = source_header.state;
        target_record.header.point_count = target_len as u32;

        self.delete_track(source_id)
    }

    /// Serialize a track (header, then every retained point in order) into
    /// `dest`. Returns the number of bytes written, or 0 for an unknown id.
    ///
    /// The caller guarantees `dest` holds at least [`Self::packed_max`] bytes.
    pub fn pack_track(&self, id: u32, dest: &mut [u8]) -> usize {
        let Some(&slot) = self.index.get(&id) else {
            return 0;
        };
        let record = &self.slots[slot];

        let mut offset = codec::write_header(&record.header, dest);
        for point in record.points.iter() {
            offset += codec::write_point(point, &mut dest[offset..]);
        }
        offset
    }

    /// Worst-case size of a packed track for this store's point capacity.
    pub fn packed_max(&self) -> usize {
        HEADER_WIRE_SIZE + self.point_capacity() * POINT_WIRE_SIZE
    }

    /// Clear every record, rebuild the free list, and restart id assignment
    /// from 1.
    pub fn clear_all(&mut self) {
        for slot in &mut self.slots {
            slot.header.clear();
            slot.points.clear();
        }
        self.index.clear();
        self.free.clear();
        self.free.extend(0..self.slots.len());
        self.next_id = 1;
    }

    // -----------------------------------------------------------------------
    // Read-only accessors. Borrowed references are valid only until the next
    // mutating call.
    // -----------------------------------------------------------------------

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn point_capacity(&self) -> usize {
        // All rings share the capacity fixed at construction.
        self.slots[0].points.capacity()
    }

    pub fn used(&self) -> usize {
        self.index.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// The id the next created track will receive. Never decreases over the
    /// lifetime of a store, except through [`Self::clear_all`].
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn is_valid(&self, id: u32) -> bool {
        self.index.contains_key(&id)
    }

    /// Snapshot of live track ids in ascending order.
    pub fn active_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn header(&self, id: u32) -> Option<&TrackHeader> {
        self.index.get(&id).map(|&slot| &self.slots[slot].header)
    }

    pub fn points(&self, id: u32) -> Option<&LatestK<TrackPoint>> {
        self.index.get(&id).map(|&slot| &self.slots[slot].points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn associated(longitude: f64) -> TrackPoint {
        TrackPoint {
            longitude,
            is_associated: true,
            ..TrackPoint::default()
        }
    }

    fn unassociated() -> TrackPoint {
        TrackPoint::default()
    }

    fn assert_accounting(store: &TrackStore) {
        assert_eq!(store.used() + store.free_slots(), store.capacity());
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let mut store = TrackStore::new(10, 5);
        assert_eq!(store.create_track().expect("slot available"), 1);
        assert_eq!(store.create_track().expect("slot available"), 2);
        assert_eq!(store.create_track().expect("slot available"), 3);
        assert_eq!(store.used(), 3);
        assert!(store.is_valid(1));
        assert!(store.is_valid(3));
        assert_accounting(&store);
    }

    #[test]
    fn test_header_id_matches_map() {
        let mut store = TrackStore::new(4, 4);
        let id = store.create_track().expect("slot available");
        let header = store.header(id).expect("live");
        assert_eq!(header.track_id, id);
        assert_eq!(header.state, TrackState::Normal);
        assert_eq!(header.extrapolation, 0);
        assert_eq!(header.point_count, 0);
    }

    #[test]
    fn test_pool_full_then_id_monotonic() {
        let mut store = TrackStore::new(2, 4);
        assert_eq!(store.create_track().expect("first"), 1);
        assert_eq!(store.create_track().expect("second"), 2);
        assert_eq!(store.create_track(), Err(StoreError::PoolFull));
        assert_accounting(&store);

        store.delete_track(1).expect("live");
        assert_eq!(store.create_track().expect("freed slot"), 3);
        assert!(!store.is_valid(1));
        assert!(store.is_valid(3));
        assert_accounting(&store);
    }

    #[test]
    fn test_delete_unknown() {
        let mut store = TrackStore::new(2, 4);
        assert_eq!(store.delete_track(9), Err(StoreError::UnknownId(9)));
    }

    #[test]
    fn test_accounting_over_churn() {
        let mut store = TrackStore::new(8, 4);
        let mut live = Vec::new();
        for round in 0..5 {
            for _ in 0..6 {
                if let Ok(id) = store.create_track() {
                    live.push(id);
                }
                assert_accounting(&store);
            }
            for id in live.drain(..round + 2) {
                let _ = store.delete_track(id);
                assert_accounting(&store);
            }
        }
    }

    #[test]
    fn test_push_unknown_id() {
        let mut store = TrackStore::new(2, 4);
        assert_eq!(
            store.push_point(42, associated(1.0)),
            Err(StoreError::UnknownId(42))
        );
    }

    #[test]
    fn test_push_tracks_point_count() {
        let mut store = TrackStore::new(2, 3);
        let id = store.create_track().expect("slot available");
        for i in 0..5 {
            store.push_point(id, associated(i as f64)).expect("live");
            let header = store.header(id).expect("live");
            assert_eq!(header.point_count as usize, store.points(id).expect("live").len());
        }
        // Ring capacity 3: only the latest three retained.
        assert_eq!(store.header(id).expect("live").point_count, 3);
    }

    #[test]
    fn test_extrapolation_counts_up_then_terminates() {
        let mut store = TrackStore::new(4, 16);
        let id = store.create_track().expect("slot available");

        for i in 0..4 {
            store.push_point(id, associated(i as f64)).expect("live");
        }
        assert_eq!(store.header(id).expect("live").state, TrackState::Normal);

        for expected in 1..=3u32 {
            store.push_point(id, unassociated()).expect("extrapolating");
            let header = store.header(id).expect("live");
            assert_eq!(header.state, TrackState::Extrapolated);
            assert_eq!(header.extrapolation, expected);
        }

        assert_eq!(
            store.push_point(id, unassociated()),
            Err(StoreError::Terminated(id))
        );
        assert!(!store.is_valid(id));
        assert_accounting(&store);
    }

    #[test]
    fn test_associated_push_recovers_extrapolation() {
        let mut store = TrackStore::new(4, 16);
        let id = store.create_track().expect("slot available");
        store.push_point(id, associated(0.0)).expect("live");
        store.push_point(id, unassociated()).expect("live");
        store.push_point(id, unassociated()).expect("live");
        assert_eq!(store.header(id).expect("live").extrapolation, 2);

        store.push_point(id, associated(1.0)).expect("live");
        let header = store.header(id).expect("live");
        assert_eq!(header.extrapolation, 1);
        assert_eq!(header.state, TrackState::Normal);

        // Floor at zero.
        store.push_point(id, associated(2.0)).expect("live");
        store.push_point(id, associated(3.0)).expect("live");
        assert_eq!(store.header(id).expect("live").extrapolation, 0);
    }

    #[test]
    fn test_merge_grafts_source_tail_onto_target() {
        let mut store = TrackStore::new(4, 16);
        let a = store.create_track().expect("slot available");
        let b = store.create_track().expect("slot available");
        assert_eq!((a, b), (1, 2));

        for i in 0..5 {
            store.push_point(a, associated(1.0 + i as f64 * 0.01)).expect("live");
            store.push_point(b, associated(2.0 + i as f64 * 0.01)).expect("live");
        }

        store.merge_tracks(b, a).expect("merge succeeds");

        assert!(store.is_valid(1));
        assert!(!store.is_valid(2));
        assert_accounting(&store);

        let points = store.points(1).expect("live");
        assert_eq!(points.len(), 5);
        let longitudes: Vec<f64> = points.iter().map(|p| p.longitude).collect();
        assert_eq!(longitudes, vec![1.0, 1.01, 2.02, 2.03, 2.04]);

        let header = store.header(1).expect("live");
        assert_eq!(header.track_id, 1);
        assert_eq!(header.point_count, 5);
    }

    #[test]
    fn test_merge_failures() {
        let mut store = TrackStore::new(4, 16);
        let a = store.create_track().expect("slot available");
        let b = store.create_track().expect("slot available");
        store.push_point(a, associated(0.0)).expect("live");
        for i in 0..4 {
            store.push_point(b, associated(i as f64)).expect("live");
        }

        assert_eq!(store.merge_tracks(9, a), Err(StoreError::UnknownId(9)));
        assert_eq!(store.merge_tracks(b, 9), Err(StoreError::UnknownId(9)));
        assert_eq!(store.merge_tracks(a, a), Err(StoreError::SelfMerge(a)));
        assert_eq!(
            store.merge_tracks(b, a),
            Err(StoreError::InsufficientPoints { id: a, have: 1, need: 3 })
        );
        // Nothing was deleted by the failed merges.
        assert!(store.is_valid(a));
        assert!(store.is_valid(b));
        assert_accounting(&store);
    }

    #[test]
    fn test_clear_all_restores_fresh_state() {
        let mut store = TrackStore::new(3, 4);
        for _ in 0..3 {
            let id = store.create_track().expect("slot available");
            store.push_point(id, associated(0.0)).expect("live");
        }
        store.clear_all();

        assert_eq!(store.used(), 0);
        assert_eq!(store.free_slots(), 3);
        assert_eq!(store.next_id(), 1);
        assert!(store.active_ids().is_empty());
        assert_eq!(store.create_track().expect("slot available"), 1);
    }

    #[test]
    fn test_pack_track_roundtrip() {
        let mut store = TrackStore::new(2, 8);
        let id = store.create_track().expect("slot available");
        for i in 0..3 {
            store
                .push_point(id, associated(100.0 + i as f64))
                .expect("live");
        }

        let mut buf = vec![0u8; store.packed_max()];
        let written = store.pack_track(id, &mut buf);
        assert_eq!(written, HEADER_WIRE_SIZE + 3 * POINT_WIRE_SIZE);

        let header = codec::decode_header(&buf).expect("header decodes");
        assert_eq!(header, *store.header(id).expect("live"));

        for i in 0..3 {
            let offset = HEADER_WIRE_SIZE + i * POINT_WIRE_SIZE;
            let point = codec::decode_point(&buf[offset..]).expect("point decodes");
            assert_eq!(point, *store.points(id).expect("live").get(i).expect("index"));
        }

        // Packing again produces identical bytes.
        let mut again = vec![0u8; store.packed_max()];
        assert_eq!(store.pack_track(id, &mut again), written);
        assert_eq!(buf, again);
    }

    #[test]
    fn test_pack_unknown_id_writes_nothing() {
        let store = TrackStore::new(2, 8);
        let mut buf = vec![0u8; store.packed_max()];
        assert_eq!(store.pack_track(5, &mut buf), 0);
    }

    #[test]
    fn test_active_ids_sorted_snapshot() {
        let mut store = TrackStore::new(8, 4);
        for _ in 0..5 {
            store.create_track().expect("slot available");
        }
        store.delete_track(2).expect("live");
        store.delete_track(4).expect("live");
        assert_eq!(store.active_ids(), vec![1, 3, 5]);
    }
}
