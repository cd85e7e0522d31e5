/// Fixed-capacity byte ring buffer between the audio feeder and the sink callback.
///
/// One byte of capacity is always left unused so that `read_pos == write_pos`
/// means empty, never full. A single lock covers the data and both positions;
/// it is held only for the memory copy, so the real-time reader waits at most
/// one `memcpy` of the writer.
///
/// Typical flow:
///   Producer (feeder thread):  `write(&chunk.data)` → copies what fits, advances write_pos
///   Consumer (sink callback):  `read(&mut out)`     → copies what is buffered, advances read_pos
///
/// Positions are mirrored in atomics so the feeder can poll fill level
/// without taking the lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

pub struct RingBuffer {
    data: Mutex<Box<[u8]>>,
    capacity: usize,
    /// Only modified while `data` is locked
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity - 1` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "Ring buffer capacity must be at least 2");

        Self {
            data: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy as much of `src` as fits. Never blocks on a full buffer; returns
    /// the number of bytes actually stored.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut data = self.data.lock();

        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        let free = self.capacity - 1 - used(read, write, self.capacity);
        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        // First segment up to the physical end, then wrap
        let first = n.min(self.capacity - write);
        data[write..write + first].copy_from_slice(&src[..first]);
        data[..n - first].copy_from_slice(&src[first..n]);

        self.write_pos
            .store((write + n) % self.capacity, Ordering::Release);
        n
    }

    /// Copy up to `dst.len()` buffered bytes into `dst`. A short read (even 0)
    /// is normal; the caller treats the rest as silence.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let data = self.data.lock();

        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        let n = dst.len().min(used(read, write, self.capacity));
        if n == 0 {
            return 0;
        }

        let first = n.min(self.capacity - read);
        dst[..first].copy_from_slice(&data[read..read + first]);
        dst[first..n].copy_from_slice(&data[..n - first]);

        self.read_pos
            .store((read + n) % self.capacity, Ordering::Release);
        n
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn available_read(&self) -> usize {
        used(
            self.read_pos.load(Ordering::Acquire),
            self.write_pos.load(Ordering::Acquire),
            self.capacity,
        )
    }

    /// Bytes that a `write` could store right now.
    #[inline]
    pub fn available_write(&self) -> usize {
        self.capacity - 1 - self.available_read()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    /// Drop everything buffered and reset both positions to 0.
    pub fn clear(&self) {
        let _data = self.data.lock();
        self.read_pos.store(0, Ordering::Release);
        self.write_pos.store(0, Ordering::Release);
    }
}

#[inline]
fn used(read: usize, write: usize, capacity: usize) -> usize {
    if write >= read {
        write - read
    } else {
        capacity - read + write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_basic() {
        let rb = RingBuffer::new(16);
        assert_eq!(rb.write(&[1, 2, 3, 4]), 4);
        assert_eq!(rb.available_read(), 4);

        let mut out = [0u8; 4];
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(rb.is_empty());
    }

    #[test]
    fn empty_read_returns_zero() {
        let rb = RingBuffer::new(8);
        let mut out = [0xAAu8; 4];
        assert_eq!(rb.read(&mut out), 0);
        assert_eq!(out, [0xAA; 4]);
    }

    #[test]
    fn second_write_truncated_at_capacity() {
        let rb = RingBuffer::new(100);
        assert_eq!(rb.write(&[7u8; 60]), 60);
        assert_eq!(rb.write(&[8u8; 60]), 39);
        assert_eq!(rb.available_write(), 0);
        assert_eq!(rb.write(&[9u8; 1]), 0);
    }

    #[test]
    fn wraparound_preserves_order() {
        let rb = RingBuffer::new(8);
        let mut out = [0u8; 8];

        assert_eq!(rb.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(rb.read(&mut out[..4]), 4);

        // write_pos=5, read_pos=4: this write wraps past the end
        assert_eq!(rb.write(&[6, 7, 8, 9, 10, 11]), 6);
        assert_eq!(rb.available_read(), 7);

        assert_eq!(rb.read(&mut out[..7]), 7);
        assert_eq!(&out[..7], &[5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn availability_always_sums_to_capacity_minus_one() {
        let rb = RingBuffer::new(37);
        let mut scratch = [0u8; 64];
        let pattern = [3usize, 11, 0, 20, 36, 5, 17, 1, 29];

        for (i, &len) in pattern.iter().enumerate() {
            if i % 2 == 0 {
                rb.write(&scratch[..len]);
            } else {
                rb.read(&mut scratch[..len]);
            }
            assert_eq!(rb.available_read() + rb.available_write(), 36);
        }
    }

    #[test]
    fn clear_resets_positions() {
        let rb = RingBuffer::new(10);
        rb.write(&[1; 7]);
        let mut out = [0u8; 3];
        rb.read(&mut out);

        rb.clear();
        assert!(rb.is_empty());
        assert_eq!(rb.available_write(), 9);
        assert_eq!(rb.write(&[2; 9]), 9);
    }

    #[test]
    fn concurrent_writer_and_reader_see_ordered_bytes() {
        use std::sync::Arc;

        let rb = Arc::new(RingBuffer::new(64));
        let total = 10_000usize;

        let producer = {
            let rb = Arc::clone(&rb);
            std::thread::spawn(move || {
                let mut next = 0usize;
                while next < total {
                    let end = (next + 13).min(total);
                    let chunk: Vec<u8> = (next..end).map(|i| i as u8).collect();
                    next += rb.write(&chunk);
                }
            })
        };

        let mut received = 0usize;
        let mut buf = [0u8; 17];
        while received < total {
            let n = rb.read(&mut buf);
            for &b in &buf[..n] {
                assert_eq!(b, received as u8);
                received += 1;
            }
        }
        producer.join().unwrap();
    }
}
