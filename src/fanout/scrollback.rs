//! Bounded scrollback ring for raw terminal output.

use std::collections::VecDeque;

/// Ring buffer of output chunks bounded by a byte capacity.
///
/// Oldest chunks are discarded whole once the total exceeds the cap, so a
/// snapshot may come in under the cap but never over it. The buffer is
/// byte-transparent: escape sequences are preserved exactly as emitted.
pub struct Scrollback {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    /// Append a chunk, evicting oldest chunks to stay within the cap.
    ///
    /// A single chunk larger than the whole cap keeps only its tail.
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        if chunk.len() >= self.cap {
            self.chunks.clear();
            self.chunks.push_back(chunk[chunk.len() - self.cap..].to_vec());
            self.bytes = self.cap;
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.bytes += chunk.len();
        while self.bytes > self.cap {
            if let Some(oldest) = self.chunks.pop_front() {
                self.bytes -= oldest.len();
            }
        }
    }

    /// Current contents, oldest bytes first.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_under_cap_keeps_everything() {
        let mut sb = Scrollback::new(16);
        sb.append(b"abcd");
        sb.append(b"efgh");
        assert_eq!(sb.len(), 8);
        assert_eq!(sb.snapshot(), b"abcdefgh");
    }

    #[test]
    fn evicts_whole_chunks_oldest_first() {
        let mut sb = Scrollback::new(8);
        sb.append(b"aaaa");
        sb.append(b"bbbb");
        sb.append(b"cccc");
        assert_eq!(sb.snapshot(), b"bbbbcccc");
        assert!(sb.len() <= 8);
    }

    #[test]
    fn oversize_chunk_keeps_tail() {
        let mut sb = Scrollback::new(4);
        sb.append(b"0123456789");
        assert_eq!(sb.snapshot(), b"6789");
        assert_eq!(sb.len(), 4);
    }

    #[test]
    fn oversize_chunk_replaces_previous_contents() {
        let mut sb = Scrollback::new(4);
        sb.append(b"ab");
        sb.append(b"0123456789");
        assert_eq!(sb.snapshot(), b"6789");
    }

    #[test]
    fn empty_chunk_is_a_noop() {
        let mut sb = Scrollback::new(4);
        sb.append(b"");
        assert!(sb.is_empty());
        assert_eq!(sb.snapshot(), b"");
    }

    #[test]
    fn never_exceeds_cap() {
        let mut sb = Scrollback::new(100);
        for i in 0..1000u32 {
            sb.append(format!("chunk-{i}").as_bytes());
            assert!(sb.len() <= 100);
        }
    }
}
