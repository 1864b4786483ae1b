//! Frames handed to the host but not yet acknowledged
//!
//! Each slot owns the decoder's reference to one frame buffer. A slot is
//! released (and its descriptor closed) once the host acknowledges a
//! timestamp at or past the frame's, or when a flush empties the ring.

use thiserror::Error;
use tracing::trace;

/// Slots per ring; the decoder stops pulling samples while all are in flight.
pub const RING_CAPACITY: usize = 64;

/// Anything stored in the ring is ordered by its presentation timestamp.
pub trait Timestamped {
    fn pts(&self) -> u64;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("frame ring overflow: all {capacity} slots are in flight")]
    Overflow { capacity: usize },
}

/// Fixed-capacity circular buffer over a preallocated slot array.
///
/// Live slots are the index range `[first, first + len)` modulo capacity.
#[derive(Debug)]
pub struct FrameRing<T> {
    slots: Vec<Option<T>>,
    first: usize,
    len: usize,
}

impl<T: Timestamped> FrameRing<T> {
    pub fn new() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            first: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn index(&self, offset: usize) -> usize {
        (self.first + offset) % self.capacity()
    }

    /// Store `frame` at the end of the ring and return a reference to it.
    ///
    /// On a full ring `frame` is dropped and the stored frames are untouched.
    pub fn push(&mut self, frame: T) -> Result<&T, RingError> {
        if self.is_full() {
            return Err(RingError::Overflow {
                capacity: self.capacity(),
            });
        }

        let last = self.index(self.len);
        debug_assert!(self.slots[last].is_none());
        self.len += 1;
        trace!(pts = frame.pts(), slot = last, in_flight = self.len, "Frame stored");

        Ok(&*self.slots[last].insert(frame))
    }

    /// Release every frame with `pts <= acked`, keeping the rest in order.
    ///
    /// Returns how many slots were freed.
    pub fn release_through(&mut self, acked: u64) -> usize {
        let live = self.len;
        let mut kept = 0;

        // Walk newest to oldest, packing survivors against the newest end
        for offset in (0..live).rev() {
            let idx = self.index(offset);
            let Some(frame) = self.slots[idx].take() else {
                continue;
            };

            if frame.pts() <= acked {
                drop(frame);
            } else {
                // Target offset is never below `offset`, so that slot is already vacated
                let target = self.index(live - 1 - kept);
                self.slots[target] = Some(frame);
                kept += 1;
            }
        }

        self.first = self.index(live - kept);
        self.len = kept;

        let released = live - kept;
        if released > 0 {
            trace!(acked, released, in_flight = kept, "Frames released");
        }
        released
    }

    /// Release every slot. Returns how many were live.
    pub fn flush(&mut self) -> usize {
        let live = self.len;
        for offset in 0..live {
            let idx = self.index(offset);
            self.slots[idx] = None;
        }

        self.first = 0;
        self.len = 0;
        live
    }

    /// Timestamps currently in flight, oldest first.
    #[cfg(test)]
    pub fn timestamps(&self) -> Vec<u64> {
        (0..self.len)
            .filter_map(|offset| self.slots[self.index(offset)].as_ref())
            .map(Timestamped::pts)
            .collect()
    }
}

impl<T: Timestamped> Default for FrameRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records its timestamp when dropped, standing in for a closed buffer.
    #[derive(Debug)]
    struct Tracked {
        pts: u64,
        dropped: Arc<Mutex<Vec<u64>>>,
    }

    impl Timestamped for Tracked {
        fn pts(&self) -> u64 {
            self.pts
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.lock().push(self.pts);
        }
    }

    fn fill(ring: &mut FrameRing<Tracked>, dropped: &Arc<Mutex<Vec<u64>>>, pts: &[u64]) {
        for &pts in pts {
            ring.push(Tracked {
                pts,
                dropped: Arc::clone(dropped),
            })
            .unwrap();
        }
    }

    #[test]
    fn test_ack_releases_through_timestamp() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let mut ring = FrameRing::new();
        fill(&mut ring, &dropped, &[0, 40, 80, 120]);

        assert_eq!(ring.release_through(80), 3);
        assert_eq!(*dropped.lock(), vec![0, 40, 80]);
        assert_eq!(ring.timestamps(), vec![120]);

        // Nothing at or below an older ack remains
        assert_eq!(ring.release_through(10), 0);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_ack_compares_timestamps_not_positions() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let mut ring = FrameRing::with_capacity(8);
        fill(&mut ring, &dropped, &[100, 30, 200, 50]);

        assert_eq!(ring.release_through(60), 2);
        assert_eq!(ring.timestamps(), vec![100, 200]);
    }

    #[test]
    fn test_wraps_around_capacity() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let mut ring = FrameRing::with_capacity(4);

        fill(&mut ring, &dropped, &[1, 2, 3]);
        ring.release_through(2);
        fill(&mut ring, &dropped, &[4, 5, 6]);

        assert!(ring.is_full());
        assert_eq!(ring.timestamps(), vec![3, 4, 5, 6]);

        ring.release_through(4);
        assert_eq!(ring.timestamps(), vec![5, 6]);
    }

    #[test]
    fn test_overflow_keeps_stored_frames() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let mut ring = FrameRing::with_capacity(2);
        fill(&mut ring, &dropped, &[1, 2]);

        let err = ring
            .push(Tracked {
                pts: 3,
                dropped: Arc::clone(&dropped),
            })
            .unwrap_err();

        assert_eq!(err, RingError::Overflow { capacity: 2 });
        assert_eq!(ring.timestamps(), vec![1, 2]);
    }

    #[test]
    fn test_flush_releases_everything() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let mut ring = FrameRing::new();
        fill(&mut ring, &dropped, &[5, 6, 7]);

        assert_eq!(ring.flush(), 3);
        assert!(ring.is_empty());
        assert_eq!(dropped.lock().len(), 3);
        assert_eq!(ring.capacity(), RING_CAPACITY);
    }
}
