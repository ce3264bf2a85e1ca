// Frame ring: fixed-size storage for the most recent encoded frames
//
// Two parallel arrays are allocated once per capture session:
// - a byte array holding frame payloads, placed back to back and wrapping to
//   offset 0 when a frame would not fit before the end
// - a metadata array used as a ring of FrameMeta entries, `head` is the oldest
//   retained frame and `tail` the slot the next frame goes into
//
// Nothing is allocated after construction. The ring has no locking of its own;
// share it as a `SharedRing` and hold the lock for every call.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::encoding::{FrameFlags, TrackFormat};

/// Ring shared between the drain worker, the persistence worker and the
/// application. Every structural read or write must hold the lock.
pub type SharedRing = Arc<Mutex<FrameRing>>;

/// Error type for ring operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("index {index} outside of ring range [{head}, {tail})")]
    OutOfRange { index: usize, head: usize, tail: usize },

    #[error("frame with {size} bytes is too big for a {capacity} byte buffer")]
    FrameTooLarge { size: usize, capacity: usize },
}

pub type Result<T> = std::result::Result<T, RingError>;

/// Location and attributes of one retained frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMeta {
    /// Offset of the first payload byte in the data array
    pub offset: usize,
    /// Payload length in bytes
    pub size: usize,
    pub flags: FrameFlags,
    /// Presentation timestamp in microseconds
    pub timestamp_us: i64,
}

/// Zero-copy access to a retained frame, valid until the ring is mutated
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub meta: FrameMeta,
}

pub struct FrameRing {
    data: Box<[u8]>,
    meta: Box<[FrameMeta]>,
    head: usize,
    tail: usize,
    format: Option<TrackFormat>,
    frame_rate: f64,
}

impl FrameRing {
    /// Create a ring sized for `seconds` of video at the given bit rate and
    /// frame rate.
    ///
    /// The byte array holds exactly `bps * seconds` bits. The metadata ring
    /// gets twice the expected frame count, so in practice the byte array is
    /// what limits the retained span.
    pub fn new(bps: f64, fps: f64, seconds: f64) -> Self {
        let n_bytes = (bps * seconds / 8.0).ceil().max(1.0) as usize;
        let n_frames = (2.0 * fps * seconds).ceil().max(2.0) as usize;
        Self::with_capacity(n_bytes, n_frames, fps)
    }

    /// Create a ring with explicit capacities.
    ///
    /// # Panics
    /// Panics if `data_capacity == 0` or `meta_capacity < 2`.
    pub fn with_capacity(data_capacity: usize, meta_capacity: usize, fps: f64) -> Self {
        assert!(data_capacity > 0, "FrameRing data capacity must be > 0");
        assert!(meta_capacity >= 2, "FrameRing metadata capacity must be >= 2");

        log::debug!(
            "Allocating frame ring: {} bytes, {} metadata slots",
            data_capacity,
            meta_capacity
        );

        Self {
            data: vec![0u8; data_capacity].into_boxed_slice(),
            meta: vec![FrameMeta::default(); meta_capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            format: None,
            frame_rate: fps,
        }
    }

    /// Wrap the ring for sharing between threads
    pub fn into_shared(self) -> SharedRing {
        Arc::new(Mutex::new(self))
    }

    // ------------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------------

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.next(self.tail) == self.head
    }

    /// Number of retained frames
    pub fn len(&self) -> usize {
        self.distance(self.head, self.tail)
    }

    /// Number of metadata slots (one is always kept free)
    pub fn capacity(&self) -> usize {
        self.meta.len()
    }

    pub fn data_capacity(&self) -> usize {
        self.data.len()
    }

    /// Expected frame rate the ring was sized for
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Index of the oldest retained frame
    pub fn begin(&self) -> usize {
        self.head
    }

    /// One past the newest retained frame
    pub fn end(&self) -> usize {
        self.tail
    }

    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.meta.len()
    }

    pub fn prev(&self, index: usize) -> usize {
        (index + self.meta.len() - 1) % self.meta.len()
    }

    /// Steps from `from` to `to` going forward around the ring
    fn distance(&self, from: usize, to: usize) -> usize {
        (to + self.meta.len() - from) % self.meta.len()
    }

    /// Whether `index` refers to a retained frame
    pub fn contains(&self, index: usize) -> bool {
        index < self.meta.len() && self.distance(self.head, index) < self.len()
    }

    /// Whether `index` is usable as a range bound, i.e. a retained frame or `end()`
    pub fn contains_bound(&self, index: usize) -> bool {
        index < self.meta.len() && self.distance(self.head, index) <= self.len()
    }

    fn check(&self, index: usize) -> Result<()> {
        if self.contains(index) {
            Ok(())
        } else {
            Err(self.out_of_range(index))
        }
    }

    /// Validate `[first, last)` and return its length
    fn check_range(&self, first: usize, last: usize) -> Result<usize> {
        if !self.contains_bound(first) {
            return Err(self.out_of_range(first));
        }
        if !self.contains_bound(last) {
            return Err(self.out_of_range(last));
        }
        let start = self.distance(self.head, first);
        let stop = self.distance(self.head, last);
        if start > stop {
            return Err(self.out_of_range(first));
        }
        Ok(stop - start)
    }

    fn out_of_range(&self, index: usize) -> RingError {
        RingError::OutOfRange {
            index,
            head: self.head,
            tail: self.tail,
        }
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// End of the newest frame's payload, zero when empty
    fn back_end(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let back = &self.meta[self.prev(self.tail)];
        back.offset + back.size
    }

    /// Location for a new block of `size` bytes: right after the newest
    /// frame, or offset 0 if it would run past the end of the data array.
    /// Overlap with older frames is not checked here.
    fn place_block(&self, size: usize) -> usize {
        let back_end = self.back_end();
        if back_end + size <= self.data.len() {
            back_end
        } else {
            0
        }
    }

    /// Whether the oldest frame has to go before a block placed by
    /// `place_block()` at `offset` can be written.
    ///
    /// Retained payloads run from the front frame up to `back_end`, possibly
    /// wrapping once. When the new block wraps to the start of the array,
    /// frames still lying past `back_end` are a lap behind and would end up
    /// between newer data, so they go regardless of overlap. Otherwise the
    /// front frame goes when the new block touches it.
    fn must_evict_front(&self, offset: usize, size: usize, back_end: usize) -> bool {
        if self.is_empty() {
            return false;
        }
        let front = &self.meta[self.head];
        let wrapped = offset < back_end;
        if wrapped && front.offset >= back_end {
            return true;
        }
        offset <= front.offset && offset + size >= front.offset
    }

    fn pop_front(&mut self) {
        debug_assert!(!self.is_empty(), "popping from an empty ring");
        self.head = self.next(self.head);
    }

    /// Append a frame, evicting the oldest frames until both the metadata ring
    /// has a free slot and the new payload does not overlap retained data.
    ///
    /// Returns the index of the new frame. Fails with `FrameTooLarge` when the
    /// payload cannot fit even in an empty ring; the ring is left untouched.
    pub fn push_back(&mut self, source: &[u8], flags: FrameFlags, timestamp_us: i64) -> Result<usize> {
        let size = source.len();
        if size > self.data.len() {
            return Err(RingError::FrameTooLarge {
                size,
                capacity: self.data.len(),
            });
        }

        if !self.is_empty() {
            let newest = self.meta[self.prev(self.tail)].timestamp_us;
            if timestamp_us <= newest {
                log::warn!(
                    "Frame timestamp {}us does not advance past {}us, searches may misbehave",
                    timestamp_us,
                    newest
                );
            }
        }

        let back_end = self.back_end();
        let offset = self.place_block(size);
        let mut evicted = 0usize;
        while self.must_evict_front(offset, size, back_end) || self.is_full() {
            self.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            log::trace!("Evicted {} frame(s) to place {} bytes at {}", evicted, size, offset);
        }

        self.data[offset..offset + size].copy_from_slice(source);

        let index = self.tail;
        self.tail = self.next(self.tail);
        self.meta[index] = FrameMeta {
            offset,
            size,
            flags,
            timestamp_us,
        };
        Ok(index)
    }

    /// Drop every retained frame. The stored format is kept.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Drop every frame older than `index`, making it the new front
    pub fn drop_before(&mut self, index: usize) -> Result<()> {
        self.check(index)?;
        self.head = index;
        Ok(())
    }

    pub fn set_format(&mut self, format: TrackFormat) {
        self.format = Some(format);
    }

    pub fn format(&self) -> Option<&TrackFormat> {
        self.format.as_ref()
    }

    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    /// Borrow the payload and metadata of a retained frame
    pub fn get(&self, index: usize) -> Result<FrameView<'_>> {
        self.check(index)?;
        let meta = self.meta[index];
        Ok(FrameView {
            data: &self.data[meta.offset..meta.offset + meta.size],
            meta,
        })
    }

    pub fn meta(&self, index: usize) -> Result<FrameMeta> {
        self.check(index)?;
        Ok(self.meta[index])
    }

    pub fn time_us(&self, index: usize) -> Result<i64> {
        self.check(index)?;
        Ok(self.meta[index].timestamp_us)
    }

    pub fn is_i_frame(&self, index: usize) -> Result<bool> {
        self.check(index)?;
        Ok(self.meta[index].flags.is_keyframe())
    }

    /// Timestamp difference between the last frame of `[first, last)` and
    /// the first one, zero for an empty range
    pub fn duration(&self, first: usize, last: usize) -> Result<i64> {
        if self.check_range(first, last)? == 0 {
            return Ok(0);
        }
        Ok(self.meta[self.prev(last)].timestamp_us - self.meta[first].timestamp_us)
    }

    /// Number of frames in `[first, last)`
    pub fn frame_count(&self, first: usize, last: usize) -> Result<usize> {
        self.check_range(first, last)
    }

    /// Span covered by everything currently retained
    pub fn buffered_duration_us(&self) -> i64 {
        if self.is_empty() {
            return 0;
        }
        self.meta[self.prev(self.tail)].timestamp_us - self.meta[self.head].timestamp_us
    }

    /// Binary search `[first, last)` for the first frame whose timestamp is at
    /// least `target_us`. Targets past the newest frame resolve to the last
    /// frame of the range, targets before the oldest to `first`. An empty
    /// range returns `first`.
    ///
    /// The search runs over offsets from `first`, so ranges that cross the
    /// end of the metadata array need no special casing.
    pub fn find_by_time(&self, first: usize, last: usize, target_us: i64) -> Result<usize> {
        let len = self.check_range(first, last)?;
        if len == 0 {
            return Ok(first);
        }

        let cap = self.meta.len();
        let at = |offset: usize| self.meta[(first + offset) % cap].timestamp_us;

        let mut lo = 0usize;
        let mut hi = len - 1;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if at(mid) < target_us {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok((first + lo) % cap)
    }

    /// Find the keyframe nearest to `index`, stepping one frame back and one
    /// frame forward per iteration. Returns `index` itself when no keyframe
    /// is retained; check with `is_i_frame()`.
    pub fn find_i_frame(&self, index: usize) -> Result<usize> {
        self.check(index)?;
        if self.meta[index].flags.is_keyframe() {
            return Ok(index);
        }

        let last = self.prev(self.tail);
        let mut back = index;
        let mut fwd = index;
        loop {
            let can_back = back != self.head;
            if can_back {
                back = self.prev(back);
                if self.meta[back].flags.is_keyframe() {
                    return Ok(back);
                }
            }

            let can_fwd = fwd != last;
            if can_fwd {
                fwd = self.next(fwd);
                if self.meta[fwd].flags.is_keyframe() {
                    return Ok(fwd);
                }
            }

            if !can_back && !can_fwd {
                return Ok(index);
            }
        }
    }

    /// First keyframe at or after `index`, scanning forward only
    pub fn find_next_i_frame(&self, index: usize) -> Result<Option<usize>> {
        if !self.contains_bound(index) {
            return Err(self.out_of_range(index));
        }
        let mut i = index;
        while i != self.tail {
            if self.meta[i].flags.is_keyframe() {
                return Ok(Some(i));
            }
            i = self.next(i);
        }
        Ok(None)
    }

    /// Newest retained keyframe, scanning backward from the newest frame
    pub fn find_last_i_frame(&self) -> Option<usize> {
        let mut i = self.tail;
        while i != self.head {
            i = self.prev(i);
            if self.meta[i].flags.is_keyframe() {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_US: i64 = 33_333;

    fn flags_for(i: usize, gop: usize) -> FrameFlags {
        if i % gop == 0 {
            FrameFlags::KEYFRAME
        } else {
            FrameFlags::NONE
        }
    }

    fn push_frames(ring: &mut FrameRing, count: usize, size: usize, gop: usize) {
        for i in 0..count {
            let payload = vec![(i % 251) as u8; size];
            ring.push_back(&payload, flags_for(i, gop), i as i64 * FRAME_US)
                .unwrap();
        }
    }

    fn timestamps(ring: &FrameRing) -> Vec<i64> {
        let mut out = Vec::new();
        let mut i = ring.begin();
        while i != ring.end() {
            out.push(ring.time_us(i).unwrap());
            i = ring.next(i);
        }
        out
    }

    #[test]
    fn new_ring_is_empty() {
        let ring = FrameRing::new(8_000_000.0, 30.0, 2.0);
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.data_capacity(), 2_000_000);
        assert_eq!(ring.capacity(), 120);
        assert_eq!(ring.buffered_duration_us(), 0);
    }

    #[test]
    fn first_frame_goes_to_offset_zero() {
        let mut ring = FrameRing::with_capacity(100, 4, 30.0);
        let index = ring.push_back(&[1, 2, 3], FrameFlags::KEYFRAME, 0).unwrap();
        let view = ring.get(index).unwrap();
        assert_eq!(view.meta.offset, 0);
        assert_eq!(view.data, &[1, 2, 3]);
    }

    #[test]
    fn frames_are_placed_back_to_back() {
        let mut ring = FrameRing::with_capacity(100, 8, 30.0);
        let a = ring.push_back(&[0; 10], FrameFlags::KEYFRAME, 0).unwrap();
        let b = ring.push_back(&[0; 20], FrameFlags::NONE, 1).unwrap();
        assert_eq!(ring.meta(a).unwrap().offset, 0);
        assert_eq!(ring.meta(b).unwrap().offset, 10);
    }

    #[test]
    fn full_metadata_ring_evicts_oldest() {
        let mut ring = FrameRing::with_capacity(1000, 4, 30.0);
        push_frames(&mut ring, 5, 10, 1);
        // one slot always stays free
        assert_eq!(ring.len(), 3);
        assert_eq!(timestamps(&ring), vec![2 * FRAME_US, 3 * FRAME_US, 4 * FRAME_US]);
    }

    #[test]
    fn wrap_evicts_frames_touching_the_new_block() {
        let mut ring = FrameRing::with_capacity(100, 16, 30.0);
        push_frames(&mut ring, 4, 25, 1);
        assert_eq!(ring.len(), 4);

        // does not fit after offset 100, wraps to 0 and has to evict the
        // frame at 0 and the one starting right where the new block ends
        let index = ring.push_back(&[9; 25], FrameFlags::KEYFRAME, 4 * FRAME_US).unwrap();
        assert_eq!(ring.meta(index).unwrap().offset, 0);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.time_us(ring.begin()).unwrap(), 2 * FRAME_US);
    }

    #[test]
    fn wrapped_block_never_overwrites_retained_frames() {
        let mut ring = FrameRing::with_capacity(100, 16, 30.0);
        ring.push_back(&[1; 70], FrameFlags::KEYFRAME, 0).unwrap();
        ring.push_back(&[2; 30], FrameFlags::NONE, FRAME_US).unwrap();
        // wraps to 0 over the first frame, the one at 70 stays
        ring.push_back(&[3; 60], FrameFlags::NONE, 2 * FRAME_US).unwrap();
        assert_eq!(ring.len(), 2);

        // wraps again onto the frame at 0, so the older one at 70 has to
        // go as well or it would sit between newer data
        let index = ring.push_back(&[4; 45], FrameFlags::KEYFRAME, 3 * FRAME_US).unwrap();
        assert_eq!(ring.meta(index).unwrap().offset, 0);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.begin(), index);

        let mut i = ring.begin();
        while i != ring.end() {
            let view = ring.get(i).unwrap();
            let fill = (view.meta.timestamp_us / FRAME_US + 1) as u8;
            assert!(view.data.iter().all(|&b| b == fill));
            i = ring.next(i);
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut ring = FrameRing::with_capacity(10, 4, 30.0);
        let err = ring.push_back(&[0; 11], FrameFlags::KEYFRAME, 0).unwrap_err();
        assert_eq!(err, RingError::FrameTooLarge { size: 11, capacity: 10 });
        assert!(ring.is_empty());
    }

    #[test]
    fn payload_round_trips_through_the_ring() {
        let mut ring = FrameRing::with_capacity(64, 8, 30.0);
        ring.push_back(&[7; 30], FrameFlags::KEYFRAME, 0).unwrap();
        let payload: Vec<u8> = (0..30).collect();
        let index = ring
            .push_back(&payload, FrameFlags::NONE, 1_000)
            .unwrap();
        let view = ring.get(index).unwrap();
        assert_eq!(view.data, payload.as_slice());
        assert_eq!(view.meta.flags, FrameFlags::NONE);
        assert_eq!(view.meta.timestamp_us, 1_000);
    }

    #[test]
    fn access_outside_range_fails() {
        let mut ring = FrameRing::with_capacity(100, 8, 30.0);
        assert!(matches!(ring.get(0), Err(RingError::OutOfRange { .. })));
        push_frames(&mut ring, 2, 10, 1);
        assert!(ring.get(1).is_ok());
        assert!(matches!(ring.get(2), Err(RingError::OutOfRange { .. })));
        assert!(matches!(ring.get(99), Err(RingError::OutOfRange { .. })));
        // end() is a valid bound but not a frame
        assert_eq!(ring.duration(ring.end(), ring.end()).unwrap(), 0);
    }

    #[test]
    fn reversed_range_is_rejected() {
        let mut ring = FrameRing::with_capacity(100, 8, 30.0);
        push_frames(&mut ring, 4, 10, 1);
        assert!(ring.frame_count(3, 1).is_err());
        assert_eq!(ring.frame_count(1, 3).unwrap(), 2);
    }

    #[test]
    fn duration_and_count_over_wrapped_range() {
        let mut ring = FrameRing::with_capacity(10_000, 8, 30.0);
        push_frames(&mut ring, 12, 10, 1);
        // head and tail have both wrapped around the metadata array
        assert!(ring.begin() > ring.end());
        assert_eq!(ring.frame_count(ring.begin(), ring.end()).unwrap(), 7);
        assert_eq!(
            ring.duration(ring.begin(), ring.end()).unwrap(),
            6 * FRAME_US
        );
        assert_eq!(ring.buffered_duration_us(), 6 * FRAME_US);
    }

    #[test]
    fn find_by_time_returns_lower_bound() {
        let mut ring = FrameRing::with_capacity(10_000, 64, 30.0);
        push_frames(&mut ring, 30, 10, 10);
        let (b, e) = (ring.begin(), ring.end());

        let exact = ring.find_by_time(b, e, 10 * FRAME_US).unwrap();
        assert_eq!(ring.time_us(exact).unwrap(), 10 * FRAME_US);

        let between = ring.find_by_time(b, e, 10 * FRAME_US + 1).unwrap();
        assert_eq!(ring.time_us(between).unwrap(), 11 * FRAME_US);

        assert_eq!(ring.find_by_time(b, e, -5).unwrap(), b);
        assert_eq!(ring.find_by_time(b, e, i64::MAX).unwrap(), ring.prev(e));
        assert_eq!(ring.find_by_time(e, e, 0).unwrap(), e);
    }

    #[test]
    fn find_by_time_across_the_array_boundary() {
        let mut ring = FrameRing::with_capacity(10_000, 10, 30.0);
        push_frames(&mut ring, 25, 10, 5);
        assert!(ring.begin() > ring.end());
        let (b, e) = (ring.begin(), ring.end());
        for i in 16..25 {
            let found = ring.find_by_time(b, e, i as i64 * FRAME_US).unwrap();
            assert_eq!(ring.time_us(found).unwrap(), i as i64 * FRAME_US);
        }
    }

    #[test]
    fn find_i_frame_prefers_nearest() {
        let mut ring = FrameRing::with_capacity(10_000, 64, 30.0);
        push_frames(&mut ring, 30, 10, 10);
        let b = ring.begin();
        // keyframes at 0, 10, 20
        assert_eq!(ring.find_i_frame(b + 12).unwrap(), b + 10);
        assert_eq!(ring.find_i_frame(b + 18).unwrap(), b + 20);
        assert_eq!(ring.find_i_frame(b + 20).unwrap(), b + 20);
        // equal distance goes backward first
        assert_eq!(ring.find_i_frame(b + 15).unwrap(), b + 10);
        // nothing ahead of 25, only behind
        assert_eq!(ring.find_i_frame(b + 27).unwrap(), b + 20);
    }

    #[test]
    fn find_i_frame_without_keyframes_returns_input() {
        let mut ring = FrameRing::with_capacity(10_000, 64, 30.0);
        for i in 0..10 {
            ring.push_back(&[0; 4], FrameFlags::NONE, i).unwrap();
        }
        assert_eq!(ring.find_i_frame(4).unwrap(), 4);
        assert!(!ring.is_i_frame(4).unwrap());
    }

    #[test]
    fn forward_and_last_keyframe_scans() {
        let mut ring = FrameRing::with_capacity(10_000, 64, 30.0);
        push_frames(&mut ring, 25, 10, 10);
        assert_eq!(ring.find_next_i_frame(1).unwrap(), Some(10));
        assert_eq!(ring.find_next_i_frame(21).unwrap(), None);
        assert_eq!(ring.find_next_i_frame(ring.end()).unwrap(), None);
        assert_eq!(ring.find_last_i_frame(), Some(20));
    }

    #[test]
    fn drop_before_and_clear() {
        let mut ring = FrameRing::with_capacity(10_000, 64, 30.0);
        ring.set_format(TrackFormat::new(crate::encoding::VideoCodec::H264, 64, 64));
        push_frames(&mut ring, 25, 10, 10);
        ring.drop_before(20).unwrap();
        assert_eq!(ring.begin(), 20);
        assert_eq!(ring.len(), 5);
        assert!(ring.drop_before(3).is_err());

        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.format().is_some());
    }

    #[test]
    fn retained_span_tracks_configured_length() {
        // 8 s at 30 fps / 6 Mbps, frames slightly under the nominal size
        let mut ring = FrameRing::new(6_000_000.0, 30.0, 8.0);
        push_frames(&mut ring, 300, 24_000, 30);

        let ts = timestamps(&ring);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        assert!(ring.buffered_duration_us() <= 8_500_000);

        let first_key_after_2s = 60 * FRAME_US;
        assert!(ring.time_us(ring.begin()).unwrap() <= first_key_after_2s);
    }
}
