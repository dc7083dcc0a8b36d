//! Bounded byte ring shared between the socket side and the iodev side.
//!
//! Producers ask for a contiguous writable slice, fill some prefix of it and
//! commit with [`ByteRing::advance_write`]; consumers do the mirror image with
//! [`ByteRing::acquire_read`] / [`ByteRing::advance_read`]. Slices never span
//! the wrap point, so a caller wanting more than the tail end loops once.
//!
//! Invariant: `0 <= queued() <= capacity()`. Commits are clamped to what is
//! actually free or queued.

/// Fixed-capacity FIFO of bytes.
#[derive(Debug, Clone)]
pub struct ByteRing {
    // ---
    bytes: Box<[u8]>,
    read_idx: usize,
    write_idx: usize,
    level: usize,
}

impl ByteRing {
    // ---
    /// Creates a zero-filled ring of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        // ---
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            read_idx: 0,
            write_idx: 0,
            level: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes written and not yet consumed.
    pub fn queued(&self) -> usize {
        self.level
    }

    /// Bytes that can still be written.
    pub fn available(&self) -> usize {
        self.capacity() - self.level
    }

    pub fn is_empty(&self) -> bool {
        self.level == 0
    }

    pub fn is_full(&self) -> bool {
        self.level == self.capacity()
    }

    /// Drops all queued bytes. Contents are left as they are.
    pub fn reset(&mut self) {
        // ---
        self.read_idx = 0;
        self.write_idx = 0;
        self.level = 0;
    }

    /// Overwrites the whole backing store with silence.
    pub fn zero_contents(&mut self) {
        // ---
        self.bytes.fill(0);
    }

    fn readable_span(&self) -> (usize, usize) {
        // ---
        if self.level == 0 {
            return (self.read_idx, 0);
        }
        let len = if self.read_idx < self.write_idx {
            self.write_idx - self.read_idx
        } else {
            self.capacity() - self.read_idx
        };
        (self.read_idx, len)
    }

    fn writable_span(&self) -> (usize, usize) {
        // ---
        if self.is_full() {
            return (self.write_idx, 0);
        }
        let len = if self.write_idx < self.read_idx {
            self.read_idx - self.write_idx
        } else {
            self.capacity() - self.write_idx
        };
        (self.write_idx, len)
    }

    /// Contiguous queued bytes starting at the read pointer, at most `max`.
    pub fn acquire_read(&self, max: usize) -> &[u8] {
        // ---
        let (start, len) = self.readable_span();
        &self.bytes[start..start + len.min(max)]
    }

    /// Mutable view of the same region as [`ByteRing::acquire_read`].
    pub fn acquire_read_mut(&mut self, max: usize) -> &mut [u8] {
        // ---
        let (start, len) = self.readable_span();
        &mut self.bytes[start..start + len.min(max)]
    }

    /// Contiguous free bytes starting at the write pointer, at most `max`.
    pub fn acquire_write(&mut self, max: usize) -> &mut [u8] {
        // ---
        let (start, len) = self.writable_span();
        &mut self.bytes[start..start + len.min(max)]
    }

    /// Consumes up to `n` bytes. Returns how many were consumed.
    pub fn advance_read(&mut self, n: usize) -> usize {
        // ---
        let n = n.min(self.level);
        self.read_idx = (self.read_idx + n) % self.capacity();
        self.level -= n;
        n
    }

    /// Commits up to `n` written bytes. Returns how many were committed.
    pub fn advance_write(&mut self, n: usize) -> usize {
        // ---
        let n = n.min(self.available());
        self.write_idx = (self.write_idx + n) % self.capacity();
        self.level += n;
        n
    }

    /// Makes exactly `n` bytes (capped at capacity) readable from the
    /// current read pointer, whatever they contain.
    pub fn adjust_readable(&mut self, n: usize) {
        // ---
        let n = n.min(self.capacity());
        self.write_idx = (self.read_idx + n) % self.capacity();
        self.level = n;
    }

    /// Appends `src`, splitting across the wrap point. Returns bytes written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        // ---
        let mut written = 0;
        for _ in 0..2 {
            let dst = self.acquire_write(src.len() - written);
            if dst.is_empty() {
                break;
            }
            let n = dst.len();
            dst.copy_from_slice(&src[written..written + n]);
            self.advance_write(n);
            written += n;
        }
        written
    }

    /// Appends up to `n` zero bytes. Returns bytes written.
    pub fn fill_zeros(&mut self, n: usize) -> usize {
        // ---
        let mut written = 0;
        for _ in 0..2 {
            let dst = self.acquire_write(n - written);
            if dst.is_empty() {
                break;
            }
            dst.fill(0);
            let len = dst.len();
            self.advance_write(len);
            written += len;
        }
        written
    }

    /// Copies queued bytes into `out` without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        // ---
        let n = out.len().min(self.level);
        let first = n.min(self.capacity() - self.read_idx);
        out[..first].copy_from_slice(&self.bytes[self.read_idx..self.read_idx + first]);
        out[first..n].copy_from_slice(&self.bytes[..n - first]);
        n
    }

    /// Copies queued bytes into `out` and consumes them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        // ---
        let n = self.peek(out);
        self.advance_read(n)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn empty_ring_offers_whole_capacity() {
        // ---
        let mut ring = ByteRing::new(16);
        assert_eq!(ring.acquire_read(16).len(), 0);
        assert_eq!(ring.acquire_write(64).len(), 16);
        assert_eq!(ring.available(), 16);
    }

    #[test]
    fn slices_stop_at_wrap_point() {
        // ---
        let mut ring = ByteRing::new(10);
        assert_eq!(ring.write(&[1; 8]), 8);
        assert_eq!(ring.advance_read(6), 6);

        // Free space is 2 at the tail plus 6 at the head.
        assert_eq!(ring.acquire_write(10).len(), 2);
        assert_eq!(ring.write(&[2; 5]), 5);
        assert_eq!(ring.queued(), 7);

        // Readable runs to the end before wrapping.
        assert_eq!(ring.acquire_read(10), &[1, 1, 2, 2]);
    }

    #[test]
    fn commits_are_clamped() {
        // ---
        let mut ring = ByteRing::new(8);
        assert_eq!(ring.advance_write(20), 8);
        assert!(ring.is_full());
        assert_eq!(ring.advance_write(1), 0);
        assert_eq!(ring.advance_read(20), 8);
        assert!(ring.is_empty());
    }

    #[test]
    fn peek_and_read_cross_wrap() {
        // ---
        let mut ring = ByteRing::new(6);
        ring.write(&[0, 1, 2, 3]);
        ring.advance_read(3);
        ring.write(&[4, 5, 6, 7]);

        let mut out = [0u8; 5];
        assert_eq!(ring.peek(&mut out), 5);
        assert_eq!(out, [3, 4, 5, 6, 7]);
        assert_eq!(ring.queued(), 5);

        let mut out = [0u8; 2];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out, [3, 4]);
        assert_eq!(ring.queued(), 3);
    }

    #[test]
    fn zero_contents_keeps_level() {
        // ---
        let mut ring = ByteRing::new(8);
        ring.write(&[9; 6]);
        ring.advance_read(2);
        ring.zero_contents();

        assert_eq!(ring.queued(), 4);
        let mut out = [0xffu8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn fill_zeros_stops_when_full() {
        // ---
        let mut ring = ByteRing::new(8);
        ring.write(&[9; 8]);
        ring.advance_read(5);
        assert_eq!(ring.fill_zeros(10), 5);
        assert!(ring.is_full());

        let mut out = [0xffu8; 8];
        ring.read(&mut out);
        assert_eq!(out, [9, 9, 9, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn adjust_readable_sets_exact_level() {
        // ---
        let mut ring = ByteRing::new(12);
        ring.write(&[1; 10]);
        ring.adjust_readable(4);
        assert_eq!(ring.queued(), 4);
        assert_eq!(ring.available(), 8);

        ring.adjust_readable(100);
        assert_eq!(ring.queued(), 12);
    }
}
