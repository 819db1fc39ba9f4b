//! Lock-free single-producer single-consumer ring buffer, frame-oriented.
//!
//! This is the bridge between driver callback threads and the engine: one
//! thread (the producer) may only write, the other (the consumer) may only
//! read. Data is organized as N parallel channel lanes of equal frame
//! capacity, so deinterleaved audio moves without per-frame shuffling.
//!
//! # Why Lock-Free?
//!
//! The consumer side typically runs inside a driver callback with a hard
//! deadline; a mutex held by the producer for even a fraction of a
//! millisecond would turn into an audible dropout. Synchronization here is
//! carried entirely by two atomic indices: only the producer advances
//! `write_pos`, only the consumer advances `read_pos`, so no compare-and-swap
//! is needed on the data path.
//!
//! One slot is always left empty (capacity is stored as `n_frames + 1`),
//! which is what lets two bare indices distinguish a full buffer from an
//! empty one.
//!
//! The producer/consumer roles are enforced by the type system: [`split`]
//! consumes the buffer and hands out a unique [`Producer`] and [`Consumer`],
//! neither of which is cloneable. `resize` and `clear` are only reachable
//! before the split, which is exactly the "offline only" contract.
//!
//! [`split`]: RingBuffer::split

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct RingShared<T> {
    /// One lane per channel, each `capacity` elements long.
    lanes: Vec<Box<[UnsafeCell<T>]>>,
    /// `n_frames + 1`; the extra slot disambiguates full from empty.
    capacity: usize,
    /// Next frame the consumer will read. Written by the consumer only.
    read_pos: AtomicUsize,
    /// Next frame the producer will write. Written by the producer only.
    write_pos: AtomicUsize,
}

// The lanes are only touched through the index protocol: the producer writes
// frames in [write_pos, write_pos + writable), the consumer reads frames in
// [read_pos, read_pos + readable), and the regions never overlap.
unsafe impl<T: Copy + Send> Send for RingShared<T> {}
unsafe impl<T: Copy + Send> Sync for RingShared<T> {}

impl<T: Copy + Default> RingShared<T> {
    fn with_size(n_frames: usize, n_channels: usize) -> Self {
        let capacity = n_frames + 1;
        let lanes = (0..n_channels)
            .map(|_| {
                (0..capacity)
                    .map(|_| UnsafeCell::new(T::default()))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        Self {
            lanes,
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn readable(&self, rpos: usize, wpos: usize) -> usize {
        (wpos + self.capacity - rpos) % self.capacity
    }

    /// Copy `len` frames from `src` into lane `ch` starting at `pos`,
    /// wrapping at the capacity boundary. At most two contiguous copies.
    ///
    /// Safety: the caller must own the producer role and the target region
    /// must be outside the readable window.
    unsafe fn copy_in(&self, ch: usize, pos: usize, src: &[T]) {
        let lane = self.lanes[ch].as_ptr() as *mut T;
        let first = src.len().min(self.capacity - pos);
        std::ptr::copy_nonoverlapping(src.as_ptr(), lane.add(pos), first);
        let rest = src.len() - first;
        if rest > 0 {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), lane, rest);
        }
    }

    /// Copy `dst.len()` frames out of lane `ch` starting at `pos`.
    ///
    /// Safety: the caller must own the consumer role and the source region
    /// must be inside the readable window.
    unsafe fn copy_out(&self, ch: usize, pos: usize, dst: &mut [T]) {
        let lane = self.lanes[ch].as_ptr() as *const T;
        let first = dst.len().min(self.capacity - pos);
        std::ptr::copy_nonoverlapping(lane.add(pos), dst.as_mut_ptr(), first);
        let rest = dst.len() - first;
        if rest > 0 {
            std::ptr::copy_nonoverlapping(lane, dst.as_mut_ptr().add(first), rest);
        }
    }
}

/// Frame-oriented SPSC channel buffer; see the module docs.
pub struct RingBuffer<T> {
    shared: Arc<RingShared<T>>,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a buffer holding `n_channels` lanes of `n_frames` capacity.
    pub fn new(n_frames: usize, n_channels: usize) -> Self {
        Self { shared: Arc::new(RingShared::with_size(n_frames, n_channels)) }
    }

    /// Total frame capacity (the maximum `readable_frames` can report).
    pub fn n_frames(&self) -> usize {
        self.shared.capacity - 1
    }

    /// Number of channel lanes.
    pub fn n_channels(&self) -> usize {
        self.shared.lanes.len()
    }

    /// Drop all buffered frames and reset both indices. Offline only.
    pub fn clear(&mut self) {
        let shared = Arc::get_mut(&mut self.shared).expect("ring buffer cleared while split");
        shared.read_pos.store(0, Ordering::Relaxed);
        shared.write_pos.store(0, Ordering::Relaxed);
    }

    /// Replace the storage with new dimensions and reset. Offline only.
    pub fn resize(&mut self, n_frames: usize, n_channels: usize) {
        let shared = Arc::get_mut(&mut self.shared).expect("ring buffer resized while split");
        *shared = RingShared::with_size(n_frames, n_channels);
    }

    /// Split into the unique producer and consumer role handles.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let producer = Producer { shared: self.shared.clone() };
        let consumer = Consumer { shared: self.shared };
        (producer, consumer)
    }
}

/// Write side of a [`RingBuffer`]. Exactly one exists per buffer.
pub struct Producer<T> {
    shared: Arc<RingShared<T>>,
}

impl<T: Copy + Default> Producer<T> {
    /// Frames that can currently be written without overwriting unread data.
    pub fn writable_frames(&self) -> usize {
        let s = &self.shared;
        let rpos = s.read_pos.load(Ordering::Acquire);
        let wpos = s.write_pos.load(Ordering::Relaxed);
        s.capacity - s.readable(rpos, wpos) - 1
    }

    /// Write up to `n_frames` frames from the per-channel `lanes`.
    ///
    /// Non-blocking: transfers `min(n_frames, writable_frames())` and
    /// returns the count. Each lane slice must hold at least `n_frames`
    /// elements and `lanes.len()` must equal the channel count.
    pub fn write(&mut self, n_frames: usize, lanes: &[&[T]]) -> usize {
        let s = &self.shared;
        assert_eq!(lanes.len(), s.lanes.len());

        let rpos = s.read_pos.load(Ordering::Acquire);
        let wpos = s.write_pos.load(Ordering::Relaxed);
        let writable = s.capacity - s.readable(rpos, wpos) - 1;
        let can_write = writable.min(n_frames);

        for (ch, lane) in lanes.iter().enumerate() {
            unsafe { s.copy_in(ch, wpos, &lane[..can_write]) };
        }

        // The index store is the release point: all data copies above must
        // be visible before the consumer observes the new write position.
        s.write_pos.store((wpos + can_write) % s.capacity, Ordering::Release);
        can_write
    }

    /// Number of channel lanes.
    pub fn n_channels(&self) -> usize {
        self.shared.lanes.len()
    }
}

/// Read side of a [`RingBuffer`]. Exactly one exists per buffer.
pub struct Consumer<T> {
    shared: Arc<RingShared<T>>,
}

impl<T: Copy + Default> Consumer<T> {
    /// Frames buffered and ready to read.
    pub fn readable_frames(&self) -> usize {
        let s = &self.shared;
        let wpos = s.write_pos.load(Ordering::Acquire);
        let rpos = s.read_pos.load(Ordering::Relaxed);
        s.readable(rpos, wpos)
    }

    /// Read up to `n_frames` frames into the per-channel `lanes`.
    ///
    /// Non-blocking: transfers `min(n_frames, readable_frames())` and
    /// returns the count.
    pub fn read(&mut self, n_frames: usize, lanes: &mut [&mut [T]]) -> usize {
        let s = &self.shared;
        assert_eq!(lanes.len(), s.lanes.len());

        let wpos = s.write_pos.load(Ordering::Acquire);
        let rpos = s.read_pos.load(Ordering::Relaxed);
        let can_read = s.readable(rpos, wpos).min(n_frames);

        for (ch, lane) in lanes.iter_mut().enumerate() {
            unsafe { s.copy_out(ch, rpos, &mut lane[..can_read]) };
        }

        s.read_pos.store((rpos + can_read) % s.capacity, Ordering::Release);
        can_read
    }

    /// Number of channel lanes.
    pub fn n_channels(&self) -> usize {
        self.shared.lanes.len()
    }
}
