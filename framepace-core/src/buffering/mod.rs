//! Lock-free SPSC byte ring carrying emulated audio to the output device.
//!
//! ```text
//!  FrameDriver thread                         audio output callback
//!  RingProducer::write ──► [ RingBuffer ] ──► RingConsumer::read_into
//!        (advances write cursor)     (advances read cursor)
//! ```
//!
//! Both cursors are unwrapped logical offsets. Occupancy is always
//! `write - read` and lies in `0..=capacity`; the physical offset of a
//! logical offset `x` is `x & (capacity - 1)` because the capacity is
//! rounded up to a power of two.
//!
//! The producer publishes bytes with a `Release` store of the write cursor and
//! the consumer picks them up with an `Acquire` load (and the reverse for the
//! read cursor), so neither side ever takes a lock.

pub mod format;

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{FrameError, Result};

/// Shared state of the ring. Only reachable through [`RingProducer`],
/// [`RingConsumer`] and the snapshot accessors below.
pub struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Advanced only by the producer.
    write_cursor: CachePadded<AtomicUsize>,
    /// Advanced only by the consumer (and zeroed by `RingProducer::reset`).
    read_cursor: CachePadded<AtomicUsize>,
    enabled: AtomicBool,
    /// Set by the consumer for the duration of a copy so `reset` can wait it out.
    reader_busy: AtomicBool,
    /// Held by `RingProducer::reset` while the cursors are rewritten. Kept apart
    /// from `enabled` so a concurrent `set_enabled` cannot reopen the ring early.
    resetting: AtomicBool,
}

// SAFETY: the byte storage is only touched through the producer (vacant region)
// and the consumer (occupied region). The cursor protocol keeps those regions
// disjoint, and there is exactly one handle of each kind.
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Allocate a ring of at least `preferred_capacity` bytes and split it into
    /// its producer and consumer halves.
    ///
    /// # Errors
    /// `FrameError::InvalidCapacity` when `preferred_capacity` is zero or cannot
    /// be rounded up to a power of two.
    pub fn split(preferred_capacity: usize) -> Result<(RingProducer, RingConsumer)> {
        let ring = Arc::new(Self::new(preferred_capacity)?);
        Ok((
            RingProducer {
                ring: Arc::clone(&ring),
                _not_sync: PhantomData,
            },
            RingConsumer {
                ring,
                _not_sync: PhantomData,
            },
        ))
    }

    fn new(preferred_capacity: usize) -> Result<Self> {
        if preferred_capacity == 0 {
            return Err(FrameError::InvalidCapacity {
                requested: preferred_capacity,
            });
        }
        let capacity = preferred_capacity
            .checked_next_power_of_two()
            .ok_or(FrameError::InvalidCapacity {
                requested: preferred_capacity,
            })?;

        let storage: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Ok(Self {
            storage,
            mask: capacity - 1,
            write_cursor: CachePadded::new(AtomicUsize::new(0)),
            read_cursor: CachePadded::new(AtomicUsize::new(0)),
            enabled: AtomicBool::new(true),
            reader_busy: AtomicBool::new(false),
            resetting: AtomicBool::new(false),
        })
    }

    /// Physical capacity in bytes (a power of two).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Snapshot of `capacity - (write - read)`.
    #[inline]
    pub fn available_bytes_for_writing(&self) -> usize {
        self.capacity() - self.occupied()
    }

    /// Snapshot of `write - read`.
    #[inline]
    pub fn available_bytes_for_reading(&self) -> usize {
        self.occupied()
    }

    /// Logical write cursor: total bytes committed since the last reset.
    pub fn write_cursor(&self) -> usize {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Logical read cursor: total bytes consumed since the last reset.
    pub fn read_cursor(&self) -> usize {
        self.read_cursor.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Silence the ring without tearing it down. While disabled, writes offer
    /// an empty region and reads copy nothing; cursors never move.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn occupied(&self) -> usize {
        // Read first: a read cursor observed before the write cursor can never
        // be ahead of it, so the difference cannot underflow.
        let read = self.read_cursor.load(Ordering::Acquire);
        let write = self.write_cursor.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity())
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("write_cursor", &self.write_cursor())
            .field("read_cursor", &self.read_cursor())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Writable view handed to a [`RingProducer::write`] handler.
///
/// The region is split in two when it crosses the physical end of the
/// storage: `first` starts at the write position, `second` continues at
/// offset zero. Either span may be empty.
pub struct WriteRegion<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
}

impl<'a> WriteRegion<'a> {
    fn empty() -> Self {
        Self {
            first: &mut [],
            second: &mut [],
        }
    }

    /// Total writable bytes across both spans.
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both physically contiguous spans, in logical order.
    pub fn spans_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        (&mut *self.first, &mut *self.second)
    }

    /// Copy as much of `src` as fits, in order, and return the byte count.
    /// Excess bytes at the tail of `src` are not copied.
    pub fn copy_from(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.len());
        let head = n.min(self.first.len());
        self.first[..head].copy_from_slice(&src[..head]);
        self.second[..n - head].copy_from_slice(&src[head..n]);
        n
    }
}

/// Write half of the ring. Exactly one exists per ring; it is `Send` but not
/// `Sync`, so only one thread can ever advance the write cursor.
pub struct RingProducer {
    ring: Arc<RingBuffer>,
    _not_sync: PhantomData<Cell<()>>,
}

impl RingProducer {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Offer the vacant region to `handler` and commit the byte count it
    /// returns.
    ///
    /// The handler is always invoked. When the ring is disabled or full it
    /// receives an empty region. A reported count larger than the region is
    /// clamped to the region length. Returns the committed byte count.
    pub fn write<F>(&mut self, handler: F) -> usize
    where
        F: FnOnce(WriteRegion<'_>) -> usize,
    {
        let ring = &*self.ring;
        if !ring.enabled.load(Ordering::Acquire) {
            handler(WriteRegion::empty());
            return 0;
        }

        let capacity = ring.capacity();
        let write = ring.write_cursor.load(Ordering::Relaxed);
        let read = ring.read_cursor.load(Ordering::Acquire);
        let occupied = write.wrapping_sub(read);
        debug_assert!(occupied <= capacity, "ring occupancy out of range");
        let available = capacity - occupied.min(capacity);
        if available == 0 {
            handler(WriteRegion::empty());
            return 0;
        }

        let start = write & ring.mask;
        let first_len = available.min(capacity - start);
        let second_len = available - first_len;

        let base = ring.base_ptr();
        // SAFETY: `[start, start + first_len)` and `[0, second_len)` are the
        // vacant part of the storage, which the consumer never reads until the
        // write cursor is published below. `second_len <= start`, so the two
        // spans do not overlap. `&mut self` rules out a second writer.
        let region = unsafe {
            WriteRegion {
                first: slice::from_raw_parts_mut(base.add(start), first_len),
                second: slice::from_raw_parts_mut(base, second_len),
            }
        };

        let written = handler(region).min(available);
        if written > 0 {
            ring.write_cursor
                .store(write.wrapping_add(written), Ordering::Release);
        }
        written
    }

    /// Copy as much of `src` as fits. The tail that does not fit is dropped.
    pub fn push_slice(&mut self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }
        self.write(|mut region| region.copy_from(src))
    }

    /// Force both cursors back to zero.
    ///
    /// `&mut self` guarantees no write is in flight. Reads that start during
    /// the reset copy nothing, and a read already copying is waited out before
    /// the cursors move. The enabled flag is left as it is, so `set_enabled`
    /// may race a reset freely.
    pub fn reset(&mut self) {
        let ring = &*self.ring;
        ring.resetting.store(true, Ordering::SeqCst);

        let backoff = Backoff::new();
        while ring.reader_busy.load(Ordering::SeqCst) {
            backoff.snooze();
        }

        ring.read_cursor.store(0, Ordering::Release);
        ring.write_cursor.store(0, Ordering::Release);
        ring.resetting.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RingProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RingProducer").field(&self.ring).finish()
    }
}

/// Read half of the ring, handed to the audio output callback.
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
    _not_sync: PhantomData<Cell<()>>,
}

impl RingConsumer {
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Copy `min(preferred_size, destination.len(), available)` bytes into the
    /// front of `destination` and return the count.
    ///
    /// Never blocks. A count below `preferred_size` is an underrun; the rest
    /// of `destination` is left untouched.
    pub fn read_into(&mut self, destination: &mut [u8], preferred_size: usize) -> usize {
        let wanted = preferred_size.min(destination.len());
        if wanted == 0 {
            return 0;
        }

        let ring = &*self.ring;
        ring.reader_busy.store(true, Ordering::SeqCst);
        let open = ring.enabled.load(Ordering::SeqCst) && !ring.resetting.load(Ordering::SeqCst);
        let copied = if open {
            self.copy_out(destination, wanted)
        } else {
            0
        };
        ring.reader_busy.store(false, Ordering::Release);
        copied
    }

    /// Read up to `destination.len()` bytes.
    pub fn pop_slice(&mut self, destination: &mut [u8]) -> usize {
        let len = destination.len();
        self.read_into(destination, len)
    }

    fn copy_out(&self, destination: &mut [u8], wanted: usize) -> usize {
        let ring = &*self.ring;
        let capacity = ring.capacity();
        let read = ring.read_cursor.load(Ordering::Relaxed);
        let write = ring.write_cursor.load(Ordering::Acquire);
        let count = wanted.min(write.wrapping_sub(read).min(capacity));
        if count == 0 {
            return 0;
        }

        let start = read & ring.mask;
        let first_len = count.min(capacity - start);
        let base = ring.base_ptr();
        // SAFETY: `[read, read + count)` is occupied: the producer published it
        // with a Release store we acquired above and will not touch it until the
        // read cursor moves past it. `destination` holds at least `count` bytes
        // and cannot alias the ring storage.
        unsafe {
            ptr::copy_nonoverlapping(base.add(start), destination.as_mut_ptr(), first_len);
            ptr::copy_nonoverlapping(
                base,
                destination.as_mut_ptr().add(first_len),
                count - first_len,
            );
        }

        ring.read_cursor
            .store(read.wrapping_add(count), Ordering::Release);
        count
    }
}

impl std::fmt::Debug for RingConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RingConsumer").field(&self.ring).finish()
    }
}
