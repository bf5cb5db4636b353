use std::cmp::min;
use std::io;

/// A bounded byte ring with distinct read and write cursors. Data is written
/// into `writable_slice` and published with `commit`; readers take bytes from
/// `readable_slice` and retire them with `consume`. At every observable point
/// `readable() + writable() == capacity()`.
///
/// The slices are zero-copy views into the ring storage. Because the ring
/// wraps, a slice only ever covers the contiguous run up to the wrap point;
/// callers loop if they want more.
pub struct RingBuffer {
    data: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        assert!(capacity > 0, "Ring buffer capacity must be non-zero");

        RingBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to read.
    #[inline]
    pub fn readable(&self) -> usize {
        self.len
    }

    /// Bytes of free capacity available to write.
    #[inline]
    pub fn writable(&self) -> usize {
        self.data.len() - self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    #[inline]
    fn tail(&self) -> usize {
        (self.head + self.len) % self.data.len()
    }

    /// Contiguous view of readable bytes starting at the read cursor. Shorter
    /// than `readable()` when the data wraps.
    #[inline]
    pub fn readable_slice(&self) -> &[u8] {
        let run = min(self.len, self.data.len() - self.head);
        &self.data[self.head..self.head + run]
    }

    /// Contiguous view of free space starting at the write cursor. Shorter
    /// than `writable()` when the free region wraps.
    #[inline]
    pub fn writable_slice(&mut self) -> &mut [u8] {
        let tail = self.tail();
        let run = if self.len == self.data.len() {
            0
        } else if tail >= self.head {
            min(self.data.len() - self.len, self.data.len() - tail)
        } else {
            self.head - tail
        };
        &mut self.data[tail..tail + run]
    }

    /// Publishes `count` bytes previously written into `writable_slice`.
    #[inline]
    pub fn commit(&mut self, count: usize) {
        assert!(
            count <= self.writable(),
            "Commit of {} bytes exceeds free capacity {}",
            count,
            self.writable()
        );
        self.len += count;
    }

    /// Retires `count` bytes from the read side.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.len,
            "Consume of {} bytes exceeds readable {}",
            count,
            self.len
        );
        // The write cursor (head + len) must not move here: callers may hold
        // a region obtained from `writable_slice` across this call.
        self.head = (self.head + count) % self.data.len();
        self.len -= count;
    }

    /// Copies as much of `src` as fits, committing it. Returns bytes taken.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> usize {
        let mut taken = 0;
        while taken < src.len() {
            let dst = self.writable_slice();
            if dst.is_empty() {
                break;
            }
            let n = min(dst.len(), src.len() - taken);
            dst[..n].copy_from_slice(&src[taken..taken + n]);
            self.commit(n);
            taken += n;
        }
        taken
    }

    /// Writes buffered bytes to `writer` until the ring drains or the writer
    /// refuses progress. Would-block surfaces as an error for the caller to
    /// fold; bytes already written stay consumed.
    pub fn drain_into<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while self.len > 0 {
            let n = writer.write(self.readable_slice())?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.consume(n);
            total += n;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, bytes: &[u8]) -> RingBuffer {
        let mut ring = RingBuffer::new(capacity);
        assert_eq!(ring.extend_from_slice(bytes), bytes.len());
        ring
    }

    fn read_all(ring: &mut RingBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        while !ring.is_empty() {
            let chunk = ring.readable_slice().to_vec();
            ring.consume(chunk.len());
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn test_capacity_invariant_holds_across_ops() {
        let mut ring = RingBuffer::new(16);

        for step in 0..100usize {
            let w = (step * 3) % (ring.writable() + 1);
            let data: Vec<u8> = (0..w).map(|i| i as u8).collect();
            ring.extend_from_slice(&data);
            assert_eq!(ring.readable() + ring.writable(), ring.capacity());

            let r = (step * 5) % (ring.readable() + 1);
            ring.consume(r);
            assert_eq!(ring.readable() + ring.writable(), ring.capacity());
        }
    }

    #[test]
    fn test_commit_then_consume_restores_counts() {
        let mut ring = RingBuffer::new(8);
        ring.extend_from_slice(&[1, 2, 3]);

        let before_readable = ring.readable();
        let before_writable = ring.writable();

        let n = {
            let slice = ring.writable_slice();
            slice[0] = 9;
            slice[1] = 9;
            2
        };
        ring.commit(n);
        ring.consume(n.min(ring.readable()));

        // Cursors advanced but the counts are back where they started.
        assert_eq!(ring.readable(), before_readable);
        assert_eq!(ring.writable(), before_writable);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut ring = RingBuffer::new(8);
        ring.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        ring.consume(4);
        ring.extend_from_slice(&[7, 8, 9, 10, 11, 12]);

        assert_eq!(ring.readable(), 8);
        assert_eq!(read_all(&mut ring), vec![5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_readable_slice_stops_at_wrap() {
        let mut ring = RingBuffer::new(8);
        ring.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        ring.consume(4);
        ring.extend_from_slice(&[7, 8, 9, 10]);

        // Four bytes fit before the wrap point, the rest after.
        assert_eq!(ring.readable_slice(), &[5, 6, 7, 8]);
        ring.consume(4);
        assert_eq!(ring.readable_slice(), &[9, 10]);
    }

    #[test]
    fn test_full_ring_has_no_writable_slice() {
        let mut ring = filled(4, &[1, 2, 3, 4]);
        assert_eq!(ring.writable(), 0);
        assert!(ring.writable_slice().is_empty());
    }

    #[test]
    #[should_panic(expected = "exceeds free capacity")]
    fn test_commit_overflow_panics() {
        let mut ring = RingBuffer::new(4);
        ring.commit(5);
    }

    #[test]
    #[should_panic(expected = "exceeds readable")]
    fn test_consume_overflow_panics() {
        let mut ring = RingBuffer::new(4);
        ring.consume(1);
    }

    #[test]
    fn test_drain_into_writes_everything() {
        let mut ring = filled(8, &[1, 2, 3, 4, 5]);
        let mut sink = Vec::new();

        let n = ring.drain_into(&mut sink).unwrap();

        assert_eq!(n, 5);
        assert!(ring.is_empty());
        assert_eq!(sink, vec![1, 2, 3, 4, 5]);
    }

    struct ChokedWriter {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl io::Write for ChokedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_drain_into_keeps_remainder_on_would_block() {
        let mut ring = filled(8, &[1, 2, 3, 4, 5]);
        let mut sink = ChokedWriter {
            accepted: Vec::new(),
            budget: 3,
        };

        let err = ring.drain_into(&mut sink).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(sink.accepted, vec![1, 2, 3]);
        assert_eq!(read_all(&mut ring), vec![4, 5]);
    }

    #[test]
    fn test_consume_to_empty_keeps_write_cursor() {
        let mut ring = RingBuffer::new(8);
        ring.extend_from_slice(&[1, 2, 3, 4, 5]);
        ring.consume(5);

        // Draining must not move the write cursor: in-flight writers hold
        // regions relative to it.
        assert_eq!(ring.writable_slice().len(), 3);
        ring.extend_from_slice(&[6, 7, 8, 9]);
        assert_eq!(read_all(&mut ring), vec![6, 7, 8, 9]);
    }
}
