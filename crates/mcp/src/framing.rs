//! Newline-delimited frame assembly.
//!
//! The pipe transport reads raw byte chunks off the subprocess stdout, which
//! can split a frame anywhere, including mid-codepoint. [`FrameBuffer`] keeps
//! the trailing partial line between reads and prefixes it to the next chunk
//! until a full frame is assembled.

/// Maximum size of a single buffered frame (1 MiB).
///
/// Sized for large tool outputs (file reads, search results). Exceeding it
/// indicates a misbehaving server rather than a legitimate frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame it completes.
    ///
    /// Empty lines are skipped. Returns an error if the buffered partial
    /// frame grows past [`MAX_FRAME_SIZE`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1]; // drop '\n'
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            frames.push(String::from_utf8_lossy(line).into_owned());
        }

        if self.buf.len() > MAX_FRAME_SIZE {
            let size = self.buf.len();
            self.buf.clear();
            return Err(FrameError::Oversized { size });
        }

        Ok(frames)
    }

    /// Bytes of an incomplete frame still waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds {MAX_FRAME_SIZE} bytes (got {size} so far)")]
    Oversized { size: usize },
}
