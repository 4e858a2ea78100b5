/// Growable byte queue with separate read and write cursors.
///
/// Readable bytes live in `[read_idx, write_idx)`; the tail
/// `[write_idx, capacity)` is writable; the prefix `[0, read_idx)` is
/// reclaimed by compaction. Writers that stay ahead of readers never
/// reallocate: when the tail alone is too small but tail plus prefix is
/// enough, the readable region is shifted to offset 0 instead of growing.
pub struct Buffer {
    buf: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

const DEFAULT_CAPACITY: usize = 1024;

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            buf: vec![0u8; capacity],
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Number of readable bytes.
    pub fn readable_size(&self) -> usize {
        self.write_idx - self.read_idx
    }

    /// The readable region as a slice.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.read_idx..self.write_idx]
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn front_free(&self) -> usize {
        self.read_idx
    }

    fn back_free(&self) -> usize {
        self.buf.len() - self.write_idx
    }

    /// Copy out the first `len` readable bytes without consuming them.
    /// Returns None when fewer than `len` bytes are readable.
    pub fn peek(&self, len: usize) -> Option<&[u8]> {
        if len > self.readable_size() {
            return None;
        }
        Some(&self.buf[self.read_idx..self.read_idx + len])
    }

    /// Discard up to `len` readable bytes.
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.readable_size());
        self.read_idx += len;
    }

    /// Copy out and consume the first `len` readable bytes.
    /// Returns None when fewer than `len` bytes are readable.
    pub fn read(&mut self, len: usize) -> Option<Vec<u8>> {
        let out = self.peek(len)?.to_vec();
        self.consume(len);
        Some(out)
    }

    /// The readable bytes up to and including the first `\n`, without
    /// consuming. None when no newline is present.
    pub fn peek_line(&self) -> Option<&[u8]> {
        let pos = self.readable().iter().position(|&b| b == b'\n')?;
        self.peek(pos + 1)
    }

    /// Read and consume one `\n`-terminated line. None when no newline is
    /// present; nothing is consumed in that case.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.readable().iter().position(|&b| b == b'\n')?;
        self.read(pos + 1)
    }

    /// Append bytes, compacting or growing the backing storage as needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_writable(data.len());
        self.buf[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Append another buffer's readable bytes. The source is not consumed.
    pub fn write_buffer(&mut self, other: &Buffer) {
        self.write(other.readable());
    }

    /// Reset both cursors without shrinking capacity.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
    }

    fn ensure_writable(&mut self, len: usize) {
        if len <= self.back_free() {
            return;
        }
        if len <= self.back_free() + self.front_free() {
            // Shift the readable region to offset 0; the combined free space
            // covers the write without reallocating.
            self.buf.copy_within(self.read_idx..self.write_idx, 0);
            self.write_idx -= self.read_idx;
            self.read_idx = 0;
        } else {
            let needed = self.write_idx + len;
            self.buf.resize(needed.next_power_of_two(), 0);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_peek_and_consume() {
        let mut buf = Buffer::new();
        buf.write(b"hello world");
        assert_eq!(buf.readable_size(), 11);
        assert_eq!(buf.peek(5).unwrap(), b"hello");
        assert_eq!(buf.readable_size(), 11);
        buf.consume(6);
        assert_eq!(buf.readable(), b"world");
        buf.consume(5);
        assert_eq!(buf.readable_size(), 0);
    }

    #[test]
    fn read_combines_peek_and_consume() {
        let mut buf = Buffer::new();
        buf.write(b"abcdef");
        assert_eq!(buf.read(3).unwrap(), b"abc");
        assert_eq!(buf.readable(), b"def");
    }

    #[test]
    fn underflow_is_signalled() {
        let mut buf = Buffer::new();
        buf.write(b"ab");
        assert!(buf.peek(3).is_none());
        assert!(buf.read(3).is_none());
        // Nothing consumed by the failed read.
        assert_eq!(buf.readable(), b"ab");
    }

    #[test]
    fn consume_clamps_to_readable() {
        let mut buf = Buffer::new();
        buf.write(b"abc");
        buf.consume(100);
        assert_eq!(buf.readable_size(), 0);
    }

    #[test]
    fn read_line_requires_newline() {
        let mut buf = Buffer::new();
        buf.write(b"no newline yet");
        assert!(buf.read_line().is_none());
        assert_eq!(buf.readable_size(), 14);

        buf.write(b"\nrest");
        assert_eq!(buf.read_line().unwrap(), b"no newline yet\n");
        assert_eq!(buf.readable(), b"rest");
    }

    #[test]
    fn peek_line_does_not_consume() {
        let mut buf = Buffer::new();
        buf.write(b"one\ntwo\n");
        assert_eq!(buf.peek_line().unwrap(), b"one\n");
        assert_eq!(buf.readable_size(), 8);
    }

    #[test]
    fn compaction_reuses_front_space() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"0123456789");
        buf.consume(8);
        // 6 free at the back, 8 reclaimable at the front: a 10-byte write
        // must compact rather than grow.
        buf.write(b"ABCDEFGHIJ");
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable(), b"89ABCDEFGHIJ");
    }

    #[test]
    fn grows_when_combined_space_insufficient() {
        let mut buf = Buffer::with_capacity(8);
        buf.write(b"abcd");
        buf.write(b"efghijklmnop");
        assert!(buf.capacity() > 8);
        assert_eq!(buf.readable(), b"abcdefghijklmnop");
    }

    #[test]
    fn write_empty_is_noop() {
        let mut buf = Buffer::with_capacity(4);
        buf.write(b"");
        assert_eq!(buf.readable_size(), 0);
        assert_eq!(buf.capacity(), 4);
    }

    #[test]
    fn write_buffer_copies_readable_region() {
        let mut src = Buffer::new();
        src.write(b"xyz");
        src.consume(1);
        let mut dst = Buffer::new();
        dst.write_buffer(&src);
        assert_eq!(dst.readable(), b"yz");
        // Source untouched.
        assert_eq!(src.readable(), b"yz");
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut buf = Buffer::with_capacity(32);
        buf.write(b"data");
        buf.clear();
        assert_eq!(buf.readable_size(), 0);
        assert_eq!(buf.capacity(), 32);
    }

    #[test]
    fn cursors_stay_ordered() {
        let mut buf = Buffer::with_capacity(8);
        for i in 0..100 {
            buf.write(&[i as u8; 5]);
            buf.consume(3);
            assert!(buf.readable_size() <= buf.capacity());
        }
    }
}
