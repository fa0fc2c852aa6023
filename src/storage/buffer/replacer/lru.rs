use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU page replacement policy.
///
/// Tracks the frames that are candidates for eviction, oldest unpin
/// first. The map's intrinsic ordering is the recency list; membership,
/// removal and victim selection are all O(1).
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

struct LruInner {
    capacity: usize,
    // front = least recently unpinned, back = most recently unpinned
    frames: LinkedHashMap<FrameId, ()>,
}

impl LruReplacer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                capacity,
                frames: LinkedHashMap::new(),
            }),
        }
    }

    /// Remove and return the frame unpinned longest ago.
    pub fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        inner.frames.pop_front().map(|(frame_id, ())| frame_id)
    }

    /// Stop tracking a frame because a caller pinned it. No-op when the
    /// frame is not tracked.
    pub fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.frames.remove(&frame_id);
    }

    /// Track a frame as the most recently used. A frame that is already
    /// tracked keeps its position; if tracking would exceed capacity the
    /// current victim is evicted first.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.frames.contains_key(&frame_id) {
            return;
        }
        if inner.frames.len() == inner.capacity {
            inner.frames.pop_front();
        }
        inner.frames.insert(frame_id, ());
    }

    /// Number of frames currently tracked.
    pub fn size(&self) -> usize {
        self.inner.lock().frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order_is_unpin_order() {
        let replacer = LruReplacer::new(7);
        for frame in 1..=6 {
            replacer.unpin(frame);
        }
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.size(), 3);
    }

    #[test]
    fn test_pin_then_unpin_moves_to_back() {
        let replacer = LruReplacer::new(7);
        for frame in 1..=6 {
            replacer.unpin(frame);
        }
        replacer.pin(4);
        replacer.unpin(4);

        let mut victims = Vec::new();
        while let Some(frame) = replacer.victim() {
            victims.push(frame);
        }
        assert_eq!(victims, vec![1, 2, 3, 5, 6, 4]);
    }

    #[test]
    fn test_duplicate_unpin_keeps_position() {
        let replacer = LruReplacer::new(3);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(1);
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
    }

    #[test]
    fn test_unpin_beyond_capacity_evicts_lru() {
        let replacer = LruReplacer::new(2);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_untracked_is_noop() {
        let replacer = LruReplacer::new(3);
        replacer.pin(42);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.victim(), None);
    }
}
