use std::io;

// Kernel reads are pulled in slices of this size.
const READ_CHUNK: usize = 16 * 1024;

// Consumed prefixes below this size are not worth compacting away.
const COMPACT_THRESHOLD: usize = 4 * 1024;

/// A bounded, contiguous byte FIFO. Incoming bytes are appended at the
/// tail; parsers inspect `read_slice()` and `consume()` what they used.
/// The consumed prefix is reclaimed by compaction once it dominates the
/// buffer, so `read_slice()` always exposes one contiguous window.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    #[inline]
    pub fn with_limit(limit: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
            limit,
        }
    }

    /// Number of readable bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Room left before `ingress` stops accepting data.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit.saturating_sub(self.len())
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.limit
    }

    /// Slice containing the readable data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Mutable view of the readable data, for codecs that decode in place.
    #[inline]
    pub fn read_slice_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Discards `count` bytes from the front.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len(), "consume past end of buffer");
        self.head += count;
        if self.head >= self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD && self.head * 2 >= self.data.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Appends bytes directly. Used by codec writers and tests; the limit
    /// only gates `ingress`.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pulls bytes from `reader` until it would block, the buffer is full,
    /// or the stream reports end-of-file. Returns `(bytes_read, eof)`.
    /// Would-block and interrupts are absorbed; other errors surface.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        while self.len() < self.limit {
            let want = (self.limit - self.len()).min(READ_CHUNK);
            let start = self.data.len();
            self.data.resize(start + want, 0);
            match reader.read(&mut self.data[start..]) {
                Ok(0) => {
                    self.data.truncate(start);
                    return Ok((total, true));
                }
                Ok(n) => {
                    self.data.truncate(start + n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.data.truncate(start);
                }
                Err(e) => {
                    self.data.truncate(start);
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Ok((total, false));
                    }
                    return Err(e);
                }
            }
        }
        Ok((total, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader handing out its data in bounded chunks, then would-block.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..self.cursor + offset]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    /// Reader that reports EOF immediately.
    struct Eof;

    impl io::Read for Eof {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn test_ingress_reads_all_available() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 500);
        let mut buffer = Buffer::with_limit(64 * 1024);

        let (read, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(read, payload.len());
        assert!(!eof);
        assert_eq!(buffer.read_slice(), &payload[..]);
    }

    #[test]
    fn test_ingress_stops_at_limit() {
        let payload = vec![7u8; 4096];
        let mut channel = MockChannel::new(payload, 512);
        let mut buffer = Buffer::with_limit(1024);

        let (read, eof) = buffer.ingress(&mut channel).unwrap();

        assert_eq!(read, 1024);
        assert!(!eof);
        assert!(buffer.is_full());
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut buffer = Buffer::with_limit(1024);
        let (read, eof) = buffer.ingress(&mut Eof).unwrap();
        assert_eq!(read, 0);
        assert!(eof);
    }

    #[test]
    fn test_consume_and_compaction() {
        let mut buffer = Buffer::with_limit(64 * 1024);
        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        buffer.extend(&payload);

        buffer.consume(5);
        assert_eq!(buffer.len(), payload.len() - 5);
        assert_eq!(buffer.read_slice()[0], payload[5]);

        // Push the head past the compaction threshold.
        buffer.consume(15_000);
        assert_eq!(buffer.read_slice(), &payload[15_005..]);

        // Draining everything resets the buffer.
        let remaining = buffer.len();
        buffer.consume(remaining);
        assert!(buffer.is_empty());
        assert_eq!(buffer.free_capacity(), 64 * 1024);
    }

    #[test]
    fn test_extend_then_ingress_appends() {
        let mut buffer = Buffer::with_limit(1024);
        buffer.extend(b"head");
        let mut channel = MockChannel::new(b"tail".to_vec(), 2);
        buffer.ingress(&mut channel).unwrap();
        assert_eq!(buffer.read_slice(), b"headtail");
    }
}
