//! Fixed-capacity sliding window keyed by frame id
//!
//! Holds the last `max_size` per-frame values for one entity. Frames are
//! strictly increasing (wraparound aware) and the window stays dense: a push
//! that skips frames backfills the gap with `T::default()`.

use std::collections::VecDeque;

use crate::util::wrapping::{frame_diff, frame_newer, frame_older, FrameId};

/// Sliding window of per-frame values
#[derive(Debug, Clone)]
pub struct FixedWindowHistory<T> {
    min_size: usize,
    max_size: usize,
    frames: VecDeque<FrameId>,
    values: VecDeque<T>,
    /// Highest frame accepted since creation or the last [`clear`](Self::clear)
    max_frame_id: Option<FrameId>,
}

/// Name used by the game layer for the per-entity input window
pub type NetworkBucket<T> = FixedWindowHistory<T>;

impl<T: Default> FixedWindowHistory<T> {
    /// Create a window holding between `min_size` and `max_size` entries
    ///
    /// `max_size` is raised to 1 and `min_size` lowered to `max_size` if needed.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        debug_assert!(min_size <= max_size, "min_size {} > max_size {}", min_size, max_size);
        let max_size = max_size.max(1);
        let min_size = min_size.min(max_size);
        Self {
            min_size,
            max_size,
            frames: VecDeque::with_capacity(max_size + 1),
            values: VecDeque::with_capacity(max_size + 1),
            max_frame_id: None,
        }
    }

    /// Append the value for `frame`
    ///
    /// Returns `false` without touching the window if `frame` is not newer
    /// than the last accepted frame.
    pub fn push(&mut self, frame: FrameId, value: T) -> bool {
        if let Some(last) = self.max_frame_id {
            if !frame_newer(frame, last) {
                return false;
            }

            if !self.values.is_empty() {
                let gap = frame_diff(last, frame) as u32 - 1;
                // Anything older than the last max_size - 1 frames would be evicted right away
                let fill = gap.min(self.max_size as u32 - 1);
                if fill < gap {
                    // Old entries are no longer contiguous with the new frame
                    self.frames.clear();
                    self.values.clear();
                }
                let first_filled = frame.wrapping_sub(fill);
                for i in 0..fill {
                    self.frames.push_back(first_filled.wrapping_add(i));
                    self.values.push_back(T::default());
                }
            }
        }

        self.frames.push_back(frame);
        self.values.push_back(value);
        while self.values.len() > self.max_size {
            self.frames.pop_front();
            self.values.pop_front();
        }
        self.max_frame_id = Some(frame);
        true
    }

    /// Drop entries older than `frame`, never shrinking below `min_size`
    ///
    /// No-op if `frame` lies outside the buffered range.
    pub fn remove_until(&mut self, frame: FrameId) {
        let (Some(&front), Some(&back)) = (self.frames.front(), self.frames.back()) else {
            return;
        };
        if frame_older(frame, front) || frame_newer(frame, back) {
            return;
        }

        while self.values.len() > self.min_size {
            match self.frames.front() {
                Some(&f) if frame_older(f, frame) => {
                    self.frames.pop_front();
                    self.values.pop_front();
                }
                _ => break,
            }
        }
    }

    /// All buffered values as one slice, oldest first, plus the newest frame id
    ///
    /// The slice borrows the window, so it cannot outlive the next mutation.
    pub fn raw_data(&mut self) -> (&[T], Option<FrameId>) {
        let newest = self.frames.back().copied();
        (self.values.make_contiguous(), newest)
    }

    /// Value stored for `frame` (linear scan)
    pub fn get(&self, frame: FrameId) -> Option<&T> {
        self.iter().find(|(f, _)| *f == frame).map(|(_, v)| v)
    }

    /// `(frame, value)` pairs from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &T)> + '_ {
        self.frames.iter().copied().zip(self.values.iter())
    }

    /// Discard everything and forget the highest frame seen
    pub fn clear(&mut self) {
        self.frames.clear();
        self.values.clear();
        self.max_frame_id = None;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[inline]
    pub fn max_frame_id(&self) -> Option<FrameId> {
        self.max_frame_id
    }

    #[inline]
    pub fn front_frame(&self) -> Option<FrameId> {
        self.frames.front().copied()
    }

    #[inline]
    pub fn back_frame(&self) -> Option<FrameId> {
        self.frames.back().copied()
    }
}
