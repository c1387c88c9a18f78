//! Sliding-window frame sync shared by the frame-oriented readers.
//!
//! The window holds the last `N` bytes read. When the bytes fail validation the window
//! shifts left by one byte and pulls one new byte, so every input byte is read once.

use std::io;

use crate::source::{ByteSource, ByteSourceExt};

/// A validated header found by [`scan`].
#[derive(Clone, Debug)]
pub struct SyncHit<T, const N: usize> {
    /// Absolute offset of the first header byte.
    pub offset: u64,
    /// The header bytes; the source is positioned right after them.
    pub bytes: [u8; N],
    pub value: T,
}

/// Fixed-size sliding byte window.
#[derive(Clone, Debug)]
pub struct SyncWindow<const N: usize> {
    bytes: [u8; N],
    filled: usize,
}

impl<const N: usize> Default for SyncWindow<N> {
    fn default() -> Self {
        Self {
            bytes: [0u8; N],
            filled: 0,
        }
    }
}

impl<const N: usize> SyncWindow<N> {
    /// Top the window up to `N` bytes. Returns `false` at end of input.
    pub fn fill(&mut self, src: &mut dyn ByteSource) -> io::Result<bool> {
        if self.filled < N {
            let got = src.fill(&mut self.bytes[self.filled..])?;
            self.filled += got;
        }
        Ok(self.filled == N)
    }

    /// Drop the oldest byte and read one more. Returns `false` at end of input.
    pub fn shift(&mut self, src: &mut dyn ByteSource) -> io::Result<bool> {
        if self.filled == 0 {
            return self.fill(src);
        }
        self.bytes.copy_within(1..self.filled, 0);
        self.filled -= 1;
        match src.read_byte()? {
            Some(b) => {
                self.bytes[self.filled] = b;
                self.filled += 1;
                Ok(self.filled == N)
            }
            None => Ok(false),
        }
    }

    pub fn bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn is_full(&self) -> bool {
        self.filled == N
    }
}

/// Scan forward from the current position for a header accepted by `validate`.
///
/// Gives up after `max_scan` bytes of garbage or at end of input (`Ok(None)`).
pub fn scan<T, const N: usize>(
    src: &mut dyn ByteSource,
    max_scan: u64,
    mut validate: impl FnMut(&[u8; N]) -> Option<T>,
) -> io::Result<Option<SyncHit<T, N>>> {
    let mut window = SyncWindow::<N>::default();
    if !window.fill(src)? {
        return Ok(None);
    }
    let mut skipped = 0u64;
    loop {
        if let Some(value) = validate(window.bytes()) {
            let offset = src.position() - N as u64;
            if skipped > 0 {
                tracing::debug!(skipped, offset, "resynchronized on frame header");
            }
            return Ok(Some(SyncHit {
                offset,
                bytes: *window.bytes(),
                value,
            }));
        }
        if skipped >= max_scan {
            tracing::debug!(skipped, "sync scan limit reached");
            return Ok(None);
        }
        if !window.shift(src)? {
            return Ok(None);
        }
        skipped += 1;
    }
}
