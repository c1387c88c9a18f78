//! Byte sources consumed by readers.
//!
//! A [`ByteSource`] is either *seekable* (local file, in-memory buffer) or *serial*
//! (network stream). Serial sources cannot seek backwards and may not know their size;
//! readers check [`ByteSource::is_serial`] before relying on either.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::interrupt::Interrupt;

/// Readable byte stream with absolute positioning.
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of input.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Absolute byte offset of the next read.
    fn position(&self) -> u64;

    /// Move to an absolute offset. Serial sources fail unless `pos` is the current position.
    fn seek(&mut self, pos: u64) -> io::Result<u64>;

    /// Total size in bytes, if known.
    fn size(&self) -> Option<u64>;

    /// `true` for forward-only sources (network streams).
    fn is_serial(&self) -> bool;

    /// MIME type reported by the transport, if any.
    fn content_type(&self) -> Option<&str> {
        None
    }
}

/// Convenience helpers built on the primitive [`ByteSource`] calls.
pub trait ByteSourceExt: ByteSource {
    /// Read until `buf` is full or the source ends; returns the bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Advance by `n` bytes, seeking when possible and reading otherwise.
    ///
    /// Returns the number of bytes actually skipped (short at end of input).
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        if n == 0 {
            return Ok(0);
        }
        if !self.is_serial() {
            let start = self.position();
            let mut target = start.saturating_add(n);
            if let Some(size) = self.size() {
                target = target.min(size);
            }
            let landed = self.seek(target)?;
            return Ok(landed.saturating_sub(start));
        }
        let mut scratch = [0u8; 4096];
        let mut left = n;
        while left > 0 {
            let want = left.min(scratch.len() as u64) as usize;
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            left -= got as u64;
        }
        Ok(n - left)
    }

    /// Bytes left before the end of input, if the size is known.
    fn remaining(&self) -> Option<u64> {
        self.size().map(|s| s.saturating_sub(self.position()))
    }

    /// Read one byte, `None` at end of input.
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.fill(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }
}

impl<T: ByteSource + ?Sized> ByteSourceExt for T {}

/// Seekable source backed by a local file.
pub struct FileSource {
    inner: BufReader<File>,
    pos: u64,
    len: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {:?}", path))?
            .len();
        Ok(Self {
            inner: BufReader::with_capacity(64 * 1024, file),
            pos: 0,
            len,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> io::Result<u64> {
        self.pos = self.inner.seek(SeekFrom::Start(pos))?;
        Ok(self.pos)
    }

    fn size(&self) -> Option<u64> {
        Some(self.len)
    }

    fn is_serial(&self) -> bool {
        false
    }
}

/// In-memory source. Can be forced serial to exercise network code paths.
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    serial: bool,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            serial: false,
        }
    }

    /// Forward-only view with no reported size.
    pub fn serial(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            serial: true,
        }
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.data.len().saturating_sub(self.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn seek(&mut self, pos: u64) -> io::Result<u64> {
        if self.serial && pos != self.pos as u64 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "serial source cannot seek",
            ));
        }
        self.pos = (pos as usize).min(self.data.len());
        Ok(self.pos as u64)
    }

    fn size(&self) -> Option<u64> {
        if self.serial {
            None
        } else {
            Some(self.data.len() as u64)
        }
    }

    fn is_serial(&self) -> bool {
        self.serial
    }
}

/// Configuration for HTTP streaming.
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Connect timeout; the body itself streams without a deadline.
    pub connect_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Serial source reading an HTTP response body.
///
/// Never seekable; the size comes from `Content-Length` when the server sends one.
pub struct HttpSource {
    body: Box<dyn Read + Send>,
    pos: u64,
    len: Option<u64>,
    content_type: Option<String>,
    interrupt: Option<Interrupt>,
}

impl HttpSource {
    /// Issue the GET request and keep the body open for streaming.
    pub fn open(url: &str, config: &HttpSourceConfig, interrupt: Option<Interrupt>) -> Result<Self> {
        let resp = ureq::get(url)
            .config()
            .timeout_connect(Some(config.connect_timeout))
            .build()
            .call()
            .with_context(|| format!("http get {url}"))?;

        let len = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let content_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_ascii_lowercase());

        tracing::info!(
            url,
            content_length = ?len,
            content_type = content_type.as_deref().unwrap_or(""),
            "http stream opened"
        );

        let (_, body) = resp.into_parts();
        Ok(Self {
            body: Box::new(body.into_reader()),
            pos: 0,
            len,
            content_type,
            interrupt,
        })
    }

    fn is_canceled(&self) -> bool {
        self.interrupt.as_ref().map(|i| i.is_set()).unwrap_or(false)
    }
}

impl ByteSource for HttpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_canceled() || buf.is_empty() {
            return Ok(0);
        }
        let n = self.body.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> io::Result<u64> {
        if pos == self.pos {
            return Ok(pos);
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "http stream cannot seek",
        ))
    }

    fn size(&self) -> Option<u64> {
        self.len
    }

    fn is_serial(&self) -> bool {
        true
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// Bytes of history a serial [`ReplaySource`] keeps for short backward seeks.
pub const REPLAY_WINDOW: usize = 256 * 1024;

/// Wrapper giving serial sources a bounded replay window.
///
/// Probing and header parsing need to look ahead and step back; on a network stream that is
/// only possible within the bytes already received. Seekable sources pass straight through.
pub struct ReplaySource {
    inner: Box<dyn ByteSource>,
    history: Vec<u8>,
    /// Absolute offset of `history[0]`.
    hist_start: u64,
    /// Absolute offset of the next byte to hand out.
    pos: u64,
    window: usize,
}

impl ReplaySource {
    pub fn new(inner: Box<dyn ByteSource>) -> Self {
        Self::with_window(inner, REPLAY_WINDOW)
    }

    pub fn with_window(inner: Box<dyn ByteSource>, window: usize) -> Self {
        let pos = inner.position();
        Self {
            inner,
            history: Vec::new(),
            hist_start: pos,
            pos,
            window: window.max(1),
        }
    }

    /// Absolute offset one past the last byte pulled from the inner source.
    fn head(&self) -> u64 {
        self.hist_start + self.history.len() as u64
    }

    fn trim_history(&mut self) {
        if self.history.len() > self.window * 2 {
            let drop_n = self.history.len() - self.window;
            self.history.drain(..drop_n);
            self.hist_start += drop_n as u64;
        }
    }
}

impl ByteSource for ReplaySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.inner.is_serial() {
            let n = self.inner.read(buf)?;
            self.pos = self.inner.position();
            return Ok(n);
        }
        if self.pos < self.head() {
            let at = (self.pos - self.hist_start) as usize;
            let n = (self.history.len() - at).min(buf.len());
            buf[..n].copy_from_slice(&self.history[at..at + n]);
            self.pos += n as u64;
            return Ok(n);
        }
        let n = self.inner.read(buf)?;
        self.history.extend_from_slice(&buf[..n]);
        self.pos += n as u64;
        self.trim_history();
        Ok(n)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> io::Result<u64> {
        if !self.inner.is_serial() {
            self.pos = self.inner.seek(pos)?;
            return Ok(self.pos);
        }
        if pos >= self.hist_start && pos <= self.head() {
            self.pos = pos;
            return Ok(pos);
        }
        if pos > self.head() {
            self.pos = self.head();
            let mut left = pos - self.head();
            let mut scratch = [0u8; 4096];
            while left > 0 {
                let want = left.min(scratch.len() as u64) as usize;
                let got = self.read(&mut scratch[..want])?;
                if got == 0 {
                    break;
                }
                left -= got as u64;
            }
            return Ok(self.pos);
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "seek before replay window on serial source",
        ))
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }

    fn is_serial(&self) -> bool {
        self.inner.is_serial()
    }

    fn content_type(&self) -> Option<&str> {
        self.inner.content_type()
    }
}

/// `true` when `input` looks like a URL rather than a path.
pub fn is_url(input: &str) -> bool {
    let lower = input.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
