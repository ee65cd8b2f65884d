//! Single-producer/single-consumer byte ring buffer over caller-supplied
//! storage, with a "skip" remainder so a writer that wraps before the
//! reader catches up doesn't have to split a write across the seam.
//!
//! Mirrors `am_ringbuf_get_write_ptr`/`am_ringbuf_get_read_ptr` and their
//! `flush`/`seek` companions one-for-one; the original keeps `rd`/`wr` as
//! plain `size_t` fields guarded by the framework's critical section, here
//! they're `AtomicUsize` so a producer and consumer on separate threads can
//! each own their half of the index pair without a lock, the way
//! `io_uring`'s `SubmissionQueue`/`CompletionQueue` split a head/tail pair
//! across `AtomicU32`s.

use core::sync::atomic::{AtomicUsize, Ordering};

pub struct RingBuf<'buf> {
    buf: &'buf mut [u8],
    /// read index; owned by the consumer, observed by the producer.
    rd: AtomicUsize,
    /// write index; owned by the producer, observed by the consumer.
    wr: AtomicUsize,
    /// bytes at the tail end of the buffer the producer skipped over
    /// because the remaining run was too small for the write in progress.
    read_skip: AtomicUsize,
    dropped: AtomicUsize,
}

impl<'buf> RingBuf<'buf> {
    pub fn new(buf: &'buf mut [u8]) -> Self {
        assert!(buf.len() >= 2, "ring buffer needs at least 2 bytes");
        RingBuf {
            buf,
            rd: AtomicUsize::new(0),
            wr: AtomicUsize::new(0),
            read_skip: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    /// Largest contiguous run of unread bytes and a pointer to its start, or
    /// `None` if the buffer is empty. Mirrors `am_ringbuf_get_read_ptr`.
    pub fn get_read_ptr(&self) -> Option<(*const u8, usize)> {
        let rd = self.rd.load(Ordering::Acquire);
        let wr = self.wr.load(Ordering::Acquire);
        if rd == wr {
            return None;
        }
        if rd <= wr {
            return Some((unsafe { self.buf.as_ptr().add(rd) }, wr - rd));
        }
        let read_skip = self.read_skip.load(Ordering::Acquire);
        let avail = self.len() - rd - read_skip;
        if avail > 0 {
            return Some((unsafe { self.buf.as_ptr().add(rd) }, avail));
        }
        // drained up to the skip boundary: the unread run restarts at 0
        if wr == 0 {
            None
        } else {
            Some((self.buf.as_ptr(), wr))
        }
    }

    /// Advances the read cursor by `offset` bytes, which must not exceed
    /// the span last returned by [`Self::get_read_ptr`]. Mirrors
    /// `am_ringbuf_seek`.
    pub fn seek(&self, offset: usize) {
        let rd = self.rd.load(Ordering::Relaxed);
        let wr = self.wr.load(Ordering::Acquire);
        assert!(rd != wr, "seek on an empty ring buffer");
        if rd <= wr {
            assert!(offset <= wr - rd, "seek past the available read span");
            self.rd.store(rd + offset, Ordering::Release);
            return;
        }
        let read_skip = self.read_skip.load(Ordering::Acquire);
        let avail = self.len() - rd - read_skip;
        if avail > 0 {
            assert!(offset <= avail, "seek past the available read span");
            let new_rd = rd + offset;
            if new_rd + read_skip == self.len() {
                // drained to the skip boundary: wrap to the restart point
                self.read_skip.store(0, Ordering::Relaxed);
                self.rd.store(0, Ordering::Release);
            } else {
                self.rd.store(new_rd, Ordering::Release);
            }
            return;
        }
        assert!(offset <= wr, "seek past the available read span");
        self.rd.store(offset, Ordering::Release);
    }

    /// Largest contiguous run of writable bytes and a pointer to its start
    /// for a write of at least `size` bytes, or `None` if no run that large
    /// exists anywhere in the buffer. Mirrors `am_ringbuf_get_write_ptr`.
    pub fn get_write_ptr(&self, size: usize) -> Option<(*mut u8, usize)> {
        let rd = self.rd.load(Ordering::Acquire);
        let mut wr = self.wr.load(Ordering::Acquire);
        if wr >= rd {
            let avail = if rd == 0 { self.len() - 1 - wr } else { self.len() - wr };
            if avail >= size {
                self.read_skip.store(0, Ordering::Relaxed);
                return Some((unsafe { self.buf.as_ptr().add(wr) as *mut u8 }, avail));
            }
            if rd <= size {
                return None;
            }
            self.read_skip.store(avail, Ordering::Release);
            wr = 0;
        }
        let avail = rd - wr - 1;
        if avail >= size {
            Some((unsafe { self.buf.as_ptr().add(wr) as *mut u8 }, avail))
        } else {
            None
        }
    }

    /// Advances the write cursor by `offset` bytes actually written, which
    /// must not exceed the span last returned by [`Self::get_write_ptr`].
    /// Mirrors `am_ringbuf_flush`. `get_write_ptr` already rewinds `wr` to
    /// `0` and records `read_skip` when a write has to restart at the
    /// buffer's head, so this only needs to recompute `avail` from the
    /// current state rather than remember which branch produced it.
    pub fn flush(&self, offset: usize) {
        let rd = self.rd.load(Ordering::Acquire);
        let wr = self.wr.load(Ordering::Relaxed);
        if wr >= rd {
            let avail = if rd == 0 { self.len() - 1 - wr } else { self.len() - wr };
            assert!(offset <= avail, "flush past the available write span");
            self.wr.store((wr + offset) % self.len(), Ordering::Release);
        } else {
            let avail = rd - wr - 1;
            assert!(offset <= avail, "flush past the available write span");
            self.wr.store(wr + offset, Ordering::Release);
        }
    }

    pub fn get_data_size(&self) -> usize {
        let rd = self.rd.load(Ordering::Acquire);
        let wr = self.wr.load(Ordering::Acquire);
        if wr >= rd {
            wr - rd
        } else {
            let read_skip = self.read_skip.load(Ordering::Acquire);
            (self.len() - rd - read_skip) + wr
        }
    }

    pub fn get_free_size(&self) -> usize {
        self.len() - 1 - self.get_data_size()
    }

    pub fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get_dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear_dropped(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_all(rb: &RingBuf, data: &[u8]) -> usize {
        match rb.get_write_ptr(data.len()) {
            Some((ptr, avail)) => {
                let n = data.len().min(avail);
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, n) };
                rb.flush(n);
                n
            }
            None => 0,
        }
    }

    fn read_all(rb: &RingBuf) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((ptr, len)) = rb.get_read_ptr() {
            let slice = unsafe { core::slice::from_raw_parts(ptr, len) };
            out.extend_from_slice(slice);
            rb.seek(len);
        }
        out
    }

    #[test]
    fn producer_consumer_round_trip_byte_equality() {
        let mut buf = [0u8; 16];
        let rb = RingBuf::new(&mut buf);
        let written = write_all(&rb, b"hello world");
        assert_eq!(written, 11);
        assert_eq!(rb.get_data_size(), 11);
        let got = read_all(&rb);
        assert_eq!(got, b"hello world");
        assert_eq!(rb.get_data_size(), 0);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let mut buf = [0u8; 8];
        let rb = RingBuf::new(&mut buf);
        assert_eq!(write_all(&rb, b"abcd"), 4);
        assert_eq!(read_all(&rb), b"abcd");
        assert_eq!(write_all(&rb, b"ef"), 2);
        assert_eq!(write_all(&rb, b"gh"), 2);
        assert_eq!(read_all(&rb), b"efgh");
    }

    #[test]
    fn free_size_reflects_reserved_slot() {
        let mut buf = [0u8; 8];
        let rb = RingBuf::new(&mut buf);
        assert_eq!(rb.get_free_size(), 7);
        write_all(&rb, b"abc");
        assert_eq!(rb.get_free_size(), 4);
    }

    #[test]
    fn dropped_counter_accumulates_and_clears() {
        let mut buf = [0u8; 8];
        let rb = RingBuf::new(&mut buf);
        rb.add_dropped(3);
        rb.add_dropped(2);
        assert_eq!(rb.get_dropped(), 5);
        rb.clear_dropped();
        assert_eq!(rb.get_dropped(), 0);
    }
}
