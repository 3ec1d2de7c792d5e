/// Default size of the send buffer at connection creation.
pub const DEFAULT_SNDBUF: u32 = 4096;

/// Default upper bound the send buffer may grow to.
pub const DEFAULT_MAX_SNDBUF: u32 = 131_072;

/// The send buffer.
///
/// Holds the bytes between `snd.una` and `snd.last`: byte `i` of the buffer
/// carries sequence number `una + i`. A pending FIN occupies a sequence
/// number but no buffer byte. The buffer starts at [`DEFAULT_SNDBUF`] bytes
/// and grows on demand up to its configured maximum.
#[derive(Debug)]
pub struct SendBuffer {
    data: Vec<u8>,
    /// Current buffer size. Grows toward `max` as the application outruns it.
    size: u32,
    /// The size limit growth may reach.
    max: u32,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            size: DEFAULT_SNDBUF,
            max: DEFAULT_MAX_SNDBUF,
        }
    }
}

impl SendBuffer {
    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// The size limit growth may reach.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Sets the size limit, clamping to what a sequence window can express.
    pub fn set_max(&mut self, max: usize) {
        self.max = u32::try_from(max).unwrap_or(u32::MAX);
    }

    /// Bytes the application could still enqueue before hitting the limit.
    pub fn free(&self) -> usize {
        self.max as usize - self.data.len().min(self.max as usize)
    }

    /// Appends as much of `bytes` as fits, growing the buffer if allowed,
    /// and returns the number of bytes accepted.
    ///
    /// Growth targets min(max, max(2 * size, used + len)). A failed
    /// reservation keeps the old buffer and falls through to the capped
    /// length.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let used = self.data.len();
        let mut room = (self.size as usize).saturating_sub(used);
        if bytes.len() > room && self.size < self.max {
            let wanted = (self.size as u64 * 2)
                .max(used as u64 + bytes.len() as u64)
                .min(self.max as u64) as u32;
            let needed = (wanted as usize).saturating_sub(used);
            if self.data.try_reserve_exact(needed).is_ok() {
                self.size = wanted;
                room = (self.size as usize).saturating_sub(used);
            }
        }
        let accepted = bytes.len().min(room);
        self.data.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    /// Drops the `n` oldest bytes after they have been acknowledged.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }

    /// The buffered bytes at `offset`, at most `len` of them. The range is
    /// clamped so a trailing phantom FIN sequence number yields no bytes.
    pub fn window(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.data.len());
        let end = (offset + len).min(self.data.len());
        &self.data[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_to_fit() {
        let mut buf = SendBuffer::default();
        let accepted = buf.append(&[7u8; DEFAULT_SNDBUF as usize + 100]);
        assert_eq!(accepted, DEFAULT_SNDBUF as usize + 100);
        assert!(buf.len() as u32 <= buf.max());
    }

    #[test]
    fn caps_at_max() {
        let mut buf = SendBuffer::default();
        buf.set_max(8192);
        let accepted = buf.append(&[7u8; 10_000]);
        assert_eq!(accepted, 8192);
        assert_eq!(buf.append(b"more"), 0);
        buf.consume(100);
        assert_eq!(buf.append(b"more"), 4);
    }

    #[test]
    fn window_is_clamped() {
        let mut buf = SendBuffer::default();
        buf.append(b"hello");
        assert_eq!(buf.window(0, 5), b"hello");
        assert_eq!(buf.window(2, 100), b"llo");
        // One past the end, where a phantom FIN would sit.
        assert_eq!(buf.window(5, 1), b"");
    }
}
