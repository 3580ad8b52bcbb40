use std::cell::UnsafeCell;
use std::cmp::min;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of the rings backing each side of a TCP connection, in bytes.
pub const RING_BUFFER_SIZE: usize = 65536;

/// Index counter padded out to its own cache line so the producer and the
/// consumer never write to the same line.
#[repr(align(64))]
struct Index(AtomicUsize);

/// A lock-free single-producer/single-consumer byte ring.
///
/// One thread at a time may act as the producer (`write`, `read_from`,
/// `with_first_write_slice`) and one as the consumer (`read`, `write_to`,
/// `front`/`pop`, `first_read_slice`/`commit_first_read`). The two roles may
/// run concurrently; the index pair is the only shared state and is
/// synchronized with acquire/release pairs.
///
/// Based on the single-producer/single-consumer ringbuffer design in
/// boost.lockfree.
pub struct RingBuffer {
    write_idx: Index,
    read_idx: Index,
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Sync for RingBuffer {}
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    #[inline]
    pub fn new() -> RingBuffer {
        RingBuffer::with_capacity(RING_BUFFER_SIZE)
    }

    /// One slot is sacrificed to distinguish full from empty, hence the
    /// internal array is one byte larger than the capacity.
    pub fn with_capacity(capacity: usize) -> RingBuffer {
        RingBuffer {
            write_idx: Index(AtomicUsize::new(0)),
            read_idx: Index(AtomicUsize::new(0)),
            data: UnsafeCell::new(vec![0u8; capacity + 1].into_boxed_slice()),
        }
    }

    #[inline]
    fn max_size(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_size() - 1
    }

    #[inline]
    fn read_available(&self, wi: usize, ri: usize) -> usize {
        if wi >= ri {
            wi - ri
        } else {
            wi + self.max_size() - ri
        }
    }

    #[inline]
    fn write_available(&self, wi: usize, ri: usize) -> usize {
        let mut n = ri.wrapping_sub(wi).wrapping_sub(1);
        if wi >= ri {
            n = n.wrapping_add(self.max_size());
        }
        n
    }

    #[inline]
    pub fn empty(&self) -> bool {
        let wi = self.write_idx.0.load(Ordering::Relaxed);
        let ri = self.read_idx.0.load(Ordering::Relaxed);
        wi == ri
    }

    #[inline]
    pub fn full(&self) -> bool {
        let wi = self.write_idx.0.load(Ordering::Relaxed);
        let ri = self.read_idx.0.load(Ordering::Acquire);
        self.write_available(wi, ri) == 0
    }

    /// Peek at the next byte. The ring must not be empty.
    #[inline]
    pub fn front(&self) -> u8 {
        let wi = self.write_idx.0.load(Ordering::Acquire);
        let ri = self.read_idx.0.load(Ordering::Relaxed);
        debug_assert!(self.read_available(wi, ri) > 0);

        unsafe { (*self.data.get())[ri] }
    }

    /// Drop the next byte. The ring must not be empty.
    #[inline]
    pub fn pop(&self) {
        let wi = self.write_idx.0.load(Ordering::Acquire);
        let ri = self.read_idx.0.load(Ordering::Relaxed);
        debug_assert!(self.read_available(wi, ri) > 0);

        let mut next = ri + 1;
        if next >= self.max_size() {
            next -= self.max_size();
        }
        self.read_idx.0.store(next, Ordering::Release);
    }

    /// Consumes up to `buffer.len()` bytes into `buffer`, returning how many
    /// were copied.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        let wi = self.write_idx.0.load(Ordering::Acquire);
        let ri = self.read_idx.0.load(Ordering::Relaxed);
        let max_size = self.max_size();

        let avail = self.read_available(wi, ri);
        if avail == 0 {
            return 0;
        }

        let count = min(buffer.len(), avail);
        let data = unsafe { &*self.data.get() };

        let mut new_ri = ri + count;
        if new_ri > max_size {
            let count0 = max_size - ri;
            let count1 = count - count0;

            buffer[..count0].copy_from_slice(&data[ri..max_size]);
            buffer[count0..count].copy_from_slice(&data[..count1]);

            new_ri -= max_size;
        } else {
            buffer[..count].copy_from_slice(&data[ri..ri + count]);

            if new_ri == max_size {
                new_ri = 0;
            }
        }

        self.read_idx.0.store(new_ri, Ordering::Release);
        count
    }

    /// Copies as many bytes as fit from `data`, returning how many were
    /// accepted. Producer side only.
    pub fn write(&self, input: &[u8]) -> usize {
        let wi = self.write_idx.0.load(Ordering::Relaxed);
        let ri = self.read_idx.0.load(Ordering::Acquire);
        let max_size = self.max_size();

        let avail = self.write_available(wi, ri);
        if avail == 0 {
            return 0;
        }

        let count = min(input.len(), avail);
        let data = unsafe { &mut *self.data.get() };

        let mut new_wi = wi + count;
        if new_wi > max_size {
            let count0 = max_size - wi;
            let count1 = count - count0;

            data[wi..max_size].copy_from_slice(&input[..count0]);
            data[..count1].copy_from_slice(&input[count0..count]);

            new_wi -= max_size;
        } else {
            data[wi..wi + count].copy_from_slice(&input[..count]);

            if new_wi == max_size {
                new_wi = 0;
            }
        }

        self.write_idx.0.store(new_wi, Ordering::Release);
        count
    }

    /// Contiguous readable region up to the end of the backing array.
    /// Consumer side only; pair with `commit_first_read`.
    #[inline]
    pub fn first_read_slice(&self) -> &[u8] {
        let wi = self.write_idx.0.load(Ordering::Acquire);
        let ri = self.read_idx.0.load(Ordering::Relaxed);
        let data = unsafe { &*self.data.get() };

        if wi < ri {
            &data[ri..self.max_size()]
        } else {
            &data[ri..wi]
        }
    }

    /// Marks `n` bytes of the first read slice as consumed.
    #[inline]
    pub fn commit_first_read(&self, n: usize) {
        debug_assert!(n <= self.first_read_slice().len());

        let mut ri = self.read_idx.0.load(Ordering::Relaxed) + n;
        if ri >= self.max_size() {
            ri -= self.max_size();
        }
        self.read_idx.0.store(ri, Ordering::Release);
    }

    /// Hands the contiguous writable region to `fill`, which returns how many
    /// bytes it produced; those are committed. Producer side only.
    #[inline]
    pub fn with_first_write_slice<F>(&self, fill: F) -> usize
    where
        F: FnOnce(&mut [u8]) -> usize,
    {
        let wi = self.write_idx.0.load(Ordering::Relaxed);
        let ri = self.read_idx.0.load(Ordering::Acquire);
        let max_size = self.max_size();

        // The producer owns [wi, ri) exclusively under the SPSC discipline.
        let data = unsafe { &mut *self.data.get() };
        let slice = if wi < ri {
            &mut data[wi..ri - 1]
        } else {
            let end = max_size - if ri == 0 { 1 } else { 0 };
            &mut data[wi..end]
        };

        if slice.is_empty() {
            return 0;
        }

        let n = fill(slice);
        debug_assert!(n <= slice.len());

        let mut new_wi = wi + n;
        if new_wi >= max_size {
            new_wi -= max_size;
        }
        self.write_idx.0.store(new_wi, Ordering::Release);

        n
    }

    /// Reads from `reader` directly into ring memory. Returns the number of
    /// bytes transferred; io errors (including `WouldBlock`) pass through.
    pub fn read_from<R: io::Read>(&self, reader: &mut R) -> io::Result<usize> {
        let mut result = Ok(0);
        let n = self.with_first_write_slice(|slice| match reader.read(slice) {
            Ok(n) => n,
            Err(err) => {
                result = Err(err);
                0
            }
        });

        result.map(|_| n)
    }

    /// Writes the contiguous readable region to `writer`, consuming what was
    /// accepted.
    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<usize> {
        let slice = self.first_read_slice();
        if slice.is_empty() {
            return Ok(0);
        }

        let n = writer.write(slice)?;
        self.commit_first_read(n);
        Ok(n)
    }
}
