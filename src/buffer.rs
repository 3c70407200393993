//! Reusable byte accumulation for headers, bodies and framing scratch.

/// Append-only growable byte container.
///
/// The worker keeps one buffer per concern (receive scratch, response
/// headers, response body) and reuses them across request iterations:
/// [`clear`](Buffer::clear) drops the length to zero but keeps the
/// allocation, so steady-state request handling does not allocate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    #[inline(always)]
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    #[inline(always)]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Appends `bytes` to the end of the buffer, growing amortized.
    #[inline(always)]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Ensures room for `additional` more bytes without reallocation.
    #[inline(always)]
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Truncates to zero length. The allocation is kept.
    #[inline(always)]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Drops the first `n` bytes, shifting the rest to the front.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::io::Write for Buffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
