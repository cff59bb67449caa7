// SSE frame assembly.
//
// Upstream bytes arrive in arbitrary chunk sizes. FrameBuffer accumulates
// them and yields complete frames, where a frame is everything up to and
// including a blank line (`\n\n` or `\r\n\r\n`). Raw frame bytes are
// preserved exactly; parsers only ever see whole frames.

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    // Resume position for the delimiter scan. Backs up far enough that a
    // delimiter split across two pushes is still found.
    scan: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match find_frame_end(&self.buf, self.scan) {
                Some(end) => {
                    let frame: Vec<u8> = self.buf.drain(..end).collect();
                    frames.push(Bytes::from(frame));
                    self.scan = 0;
                }
                None => {
                    self.scan = self.buf.len().saturating_sub(3);
                    break;
                }
            }
        }
        frames
    }

    /// Drain any trailing partial frame once the stream has closed.
    pub fn finish(&mut self) -> Option<Bytes> {
        self.scan = 0;
        if self.buf.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut self.buf)))
        }
    }
}

/// Index one past the blank line terminating the first complete frame,
/// scanning from `from`.
fn find_frame_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if i + 1 < buf.len() && buf[i + 1] == b'\n' {
                return Some(i + 2);
            }
            if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}
