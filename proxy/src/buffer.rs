use bytes::{Buf, Bytes, BytesMut};

/// Resumable reader over a growable byte queue. A segment accumulates bytes
/// across multiple socket reads until its completion condition holds; on an
/// incomplete read the unconsumed remainder is pushed back to the source so
/// the caller can read more from the socket and retry.
#[derive(Debug, Default)]
pub struct BufferSegment {
    data: BytesMut,
    complete: bool,
    last_read: usize,
}

impl BufferSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete once exactly `total` bytes have been committed.
    pub fn read_up_to_bytes(&mut self, src: &mut BytesMut, total: usize) -> bool {
        if self.complete {
            return true;
        }
        let needed = total.saturating_sub(self.data.len());
        let take = needed.min(src.len());
        self.data.extend_from_slice(&src.split_to(take));
        self.last_read = take;
        if self.data.len() >= total {
            self.complete = true;
        }
        self.complete
    }

    /// Complete once `delim` is found; the delimiter is consumed but
    /// stripped from the committed view. Bytes after the delimiter stay in
    /// `src`.
    pub fn read_until(&mut self, src: &mut BytesMut, delim: &[u8]) -> bool {
        if self.complete {
            return true;
        }
        // The delimiter may span the previous read and this one.
        let search_from = self.data.len().saturating_sub(delim.len().saturating_sub(1));
        let taken = src.len();
        self.data.extend_from_slice(&src.split_to(taken));
        self.last_read = taken;

        if let Some(pos) = find(&self.data[search_from..], delim) {
            let at = search_from + pos;
            let mut rest = self.data.split_off(at);
            rest.advance(delim.len());
            rest.extend_from_slice(src);
            *src = rest;
            self.complete = true;
        }
        self.complete
    }

    /// Append everything available. Completion is decided by the caller
    /// observing end-of-stream and calling `mark_as_complete`.
    pub fn read_all(&mut self, src: &mut BytesMut) -> usize {
        let taken = src.len();
        self.data.extend_from_slice(&src.split_to(taken));
        self.last_read = taken;
        taken
    }

    pub fn bytes_committed(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_last_read(&self) -> usize {
        self.last_read
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn committed(&self) -> &[u8] {
        &self.data
    }

    pub fn mark_as_complete(&mut self) {
        self.complete = true;
    }

    /// Keep the committed bytes but accept further reads. Used for bodies
    /// assembled chunk by chunk into one buffer.
    pub fn mark_as_incomplete(&mut self) {
        self.complete = false;
    }

    pub fn take(&mut self) -> Bytes {
        let out = self.data.split().freeze();
        self.reset();
        out
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.complete = false;
        self.last_read = 0;
    }
}

/// Cursor over a borrowed slice, used where the bytes must not be consumed
/// from the stream (the TLS handshake record is replayed afterwards).
#[derive(Debug)]
pub struct ConstBufferSegment<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> ConstBufferSegment<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    /// A view of the next `count` bytes, or None when the source does not
    /// hold them yet.
    pub fn read_up_to_bytes(&mut self, count: usize) -> Option<&'a [u8]> {
        if self.pos + count > self.src.len() {
            return None;
        }
        let view = &self.src[self.pos..self.pos + count];
        self.pos += count;
        Some(view)
    }

    pub fn bytes_committed(&self) -> usize {
        self.pos
    }

    pub fn bytes_remaining(&self) -> usize {
        self.src.len() - self.pos
    }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn src(bytes: &[u8]) -> BytesMut {
        BytesMut::from(bytes)
    }

    #[test]
    fn read_up_to_bytes_across_reads() {
        let mut seg = BufferSegment::new();
        let mut first = src(b"he");
        assert!(!seg.read_up_to_bytes(&mut first, 5));
        assert_eq!(seg.bytes_committed(), 2);
        assert_eq!(seg.bytes_last_read(), 2);

        let mut second = src(b"llo, world");
        assert!(seg.read_up_to_bytes(&mut second, 5));
        assert!(seg.complete());
        assert_eq!(seg.committed(), b"hello");
        // Bytes beyond the requested count stay in the source.
        assert_eq!(&second[..], b", world");
    }

    #[test]
    fn read_until_strips_delimiter_and_returns_remainder() {
        let mut seg = BufferSegment::new();
        let mut buf = src(b"GET / HTTP/1.1\r\nrest");
        assert!(seg.read_until(&mut buf, b"\r\n"));
        assert_eq!(seg.committed(), b"GET / HTTP/1.1");
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn read_until_resumes_when_delimiter_spans_reads() {
        let mut seg = BufferSegment::new();
        let mut buf = src(b"partial\r");
        assert!(!seg.read_until(&mut buf, b"\r\n"));
        assert!(buf.is_empty());

        let mut buf = src(b"\nnext");
        assert!(seg.read_until(&mut buf, b"\r\n"));
        assert_eq!(seg.committed(), b"partial");
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn reset_clears_counters() {
        let mut seg = BufferSegment::new();
        let mut buf = src(b"abc\r\n");
        assert!(seg.read_until(&mut buf, b"\r\n"));
        seg.reset();
        assert_eq!(seg.bytes_committed(), 0);
        assert_eq!(seg.bytes_last_read(), 0);
        assert!(!seg.complete());
    }

    #[test]
    fn read_all_completes_on_explicit_mark() {
        let mut seg = BufferSegment::new();
        let mut buf = src(b"tail");
        assert_eq!(seg.read_all(&mut buf), 4);
        assert!(!seg.complete());
        seg.mark_as_complete();
        assert!(seg.complete());
        assert_eq!(seg.committed(), b"tail");
    }

    #[test]
    fn incomplete_mark_allows_appending() {
        let mut seg = BufferSegment::new();
        let mut buf = src(b"hello");
        assert!(seg.read_up_to_bytes(&mut buf, 5));
        seg.mark_as_incomplete();
        let mut buf = src(b" world");
        assert!(seg.read_up_to_bytes(&mut buf, 11));
        assert_eq!(seg.committed(), b"hello world");
    }

    #[test]
    fn const_segment_bounds() {
        let data = [0x16u8, 0x03, 0x01, 0x00, 0x05];
        let mut seg = ConstBufferSegment::new(&data);
        assert_eq!(seg.read_up_to_bytes(5).unwrap(), &data[..]);
        assert_eq!(seg.bytes_committed(), 5);
        assert!(seg.read_up_to_bytes(1).is_none());
        assert_eq!(seg.bytes_remaining(), 0);
    }
}
