//! Format readers (demuxers).
//!
//! Every reader follows the same contract:
//! - [`Reader::init`] parses headers from a fresh [`ByteSource`] and returns the single
//!   configure/meta pair for the stream (`None` for playlists, which only redirect);
//! - [`Reader::process`] fills one [`Packet`] with the next encoded frame;
//! - [`Reader::seek`] / [`Reader::can_seek`] reposition seekable streams.
//!
//! The set of formats is closed: [`Reader`] is an enum and [`registry::FormatRegistry`] picks
//! the variant from the leading bytes or a name hint.

use std::io;

use audio_stream_types::MetaInfo;

use crate::event::ConfigureEvent;
use crate::packet::{Packet, PacketError};
use crate::source::ByteSource;

pub mod a52;
pub mod adts;
pub mod bits;
pub mod dca;
pub mod elementary;
pub mod flac;
pub mod id3;
pub mod mp4;
pub mod mpeg;
pub mod ogg;
pub mod playlist;
pub mod registry;
pub mod seek;
pub mod sync;
pub mod tags;
pub mod vbr;
pub mod wav;

/// Unrecoverable reader failure; terminates the stream.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed stream: {0}")]
    Malformed(String),
    #[error("unsupported stream: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl ReadError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ReadError::Malformed(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        ReadError::Unsupported(msg.into())
    }
}

/// Outcome of one [`Reader::process`] call. Errors are reported through `Err`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// A packet was produced; keep going.
    Ok,
    /// End of the logical stream; the packet carries the end-of-stream flag.
    Done,
    /// The interrupt flag was raised while reading.
    Interrupted,
    /// The input was a playlist pointing at other URIs.
    Redirect(Vec<String>),
}

/// Configure/meta pair produced once per stream by [`Reader::init`].
#[derive(Clone, Debug)]
pub struct StreamHeader {
    pub configure: ConfigureEvent,
    pub meta: MetaInfo,
}

/// Reader knobs that come from engine configuration.
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    /// Samples rewound before an Opus seek target.
    pub opus_preroll_samples: u64,
    /// Probe iterations for bisection seeking.
    pub seek_bisect_iterations: usize,
    /// How far to scan for a frame sync before giving up.
    pub max_sync_scan: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            opus_preroll_samples: 3840,
            seek_bisect_iterations: 24,
            max_sync_scan: 1 << 20,
        }
    }
}

/// Shared shape of the per-format state machines.
pub(crate) trait Demux {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError>;

    fn process(
        &mut self,
        src: &mut dyn ByteSource,
        packet: &mut Packet,
    ) -> Result<ProcessStatus, ReadError>;

    /// Reposition so the next packet contains (or precedes) `sample`.
    fn seek(&mut self, _src: &mut dyn ByteSource, _sample: u64) -> Result<bool, ReadError> {
        Ok(false)
    }

    fn can_seek(&self, _src: &dyn ByteSource) -> bool {
        false
    }
}

/// Format tag used by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReaderKind {
    Mpeg,
    Adts,
    A52,
    Dca,
    Flac,
    Ogg,
    Mp4,
    Wav,
    Playlist,
}

impl ReaderKind {
    pub fn label(self) -> &'static str {
        match self {
            ReaderKind::Mpeg => "mpeg",
            ReaderKind::Adts => "adts",
            ReaderKind::A52 => "a52",
            ReaderKind::Dca => "dca",
            ReaderKind::Flac => "flac",
            ReaderKind::Ogg => "ogg",
            ReaderKind::Mp4 => "mp4",
            ReaderKind::Wav => "wav",
            ReaderKind::Playlist => "playlist",
        }
    }
}

/// One reader instance per opened stream.
pub enum Reader {
    Mpeg(mpeg::MpegReader),
    Adts(elementary::ElementaryReader<adts::AdtsSyntax>),
    A52(elementary::ElementaryReader<a52::A52Syntax>),
    Dca(elementary::ElementaryReader<dca::DcaSyntax>),
    Flac(flac::FlacReader),
    Ogg(ogg::OggReader),
    Mp4(mp4::Mp4Reader),
    Wav(wav::WavReader),
    Playlist(playlist::PlaylistReader),
}

impl Reader {
    /// Fresh reader for `kind`.
    pub fn new(kind: ReaderKind, options: &ReaderOptions) -> Self {
        match kind {
            ReaderKind::Mpeg => Reader::Mpeg(mpeg::MpegReader::new(options.clone())),
            ReaderKind::Adts => Reader::Adts(elementary::ElementaryReader::new(options.clone())),
            ReaderKind::A52 => Reader::A52(elementary::ElementaryReader::new(options.clone())),
            ReaderKind::Dca => Reader::Dca(elementary::ElementaryReader::new(options.clone())),
            ReaderKind::Flac => Reader::Flac(flac::FlacReader::new(options.clone())),
            ReaderKind::Ogg => Reader::Ogg(ogg::OggReader::new(options.clone())),
            ReaderKind::Mp4 => Reader::Mp4(mp4::Mp4Reader::new()),
            ReaderKind::Wav => Reader::Wav(wav::WavReader::new()),
            ReaderKind::Playlist => Reader::Playlist(playlist::PlaylistReader::new()),
        }
    }

    pub fn kind(&self) -> ReaderKind {
        match self {
            Reader::Mpeg(_) => ReaderKind::Mpeg,
            Reader::Adts(_) => ReaderKind::Adts,
            Reader::A52(_) => ReaderKind::A52,
            Reader::Dca(_) => ReaderKind::Dca,
            Reader::Flac(_) => ReaderKind::Flac,
            Reader::Ogg(_) => ReaderKind::Ogg,
            Reader::Mp4(_) => ReaderKind::Mp4,
            Reader::Wav(_) => ReaderKind::Wav,
            Reader::Playlist(_) => ReaderKind::Playlist,
        }
    }

    fn demux(&mut self) -> &mut dyn Demux {
        match self {
            Reader::Mpeg(r) => r,
            Reader::Adts(r) => r,
            Reader::A52(r) => r,
            Reader::Dca(r) => r,
            Reader::Flac(r) => r,
            Reader::Ogg(r) => r,
            Reader::Mp4(r) => r,
            Reader::Wav(r) => r,
            Reader::Playlist(r) => r,
        }
    }

    fn demux_ref(&self) -> &dyn Demux {
        match self {
            Reader::Mpeg(r) => r,
            Reader::Adts(r) => r,
            Reader::A52(r) => r,
            Reader::Dca(r) => r,
            Reader::Flac(r) => r,
            Reader::Ogg(r) => r,
            Reader::Mp4(r) => r,
            Reader::Wav(r) => r,
            Reader::Playlist(r) => r,
        }
    }

    /// Parse stream headers. `None` means the input only redirects (playlist).
    pub fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        self.demux().init(src)
    }

    /// Fill `packet` with the next encoded frame.
    pub fn process(
        &mut self,
        src: &mut dyn ByteSource,
        packet: &mut Packet,
    ) -> Result<ProcessStatus, ReadError> {
        packet.clear();
        self.demux().process(src, packet)
    }

    /// Reposition to `sample` (raw decoder-output domain). `Ok(false)` if unsupported.
    pub fn seek(&mut self, src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        if !self.demux_ref().can_seek(src) {
            return Ok(false);
        }
        self.demux().seek(src, sample)
    }

    pub fn can_seek(&self, src: &dyn ByteSource) -> bool {
        self.demux_ref().can_seek(src)
    }
}

/// Mark `packet` as the end of the stream and report [`ProcessStatus::Done`].
pub(crate) fn finish(packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
    packet.set_end_of_stream();
    Ok(ProcessStatus::Done)
}

/// Bounds-checked cursor over an in-memory header block.
#[derive(Clone, Debug)]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteCursor<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| ReadError::Malformed(format!("{} truncated", self.what)))?;
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), ReadError> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn be_u16(&mut self) -> Result<u16, ReadError> {
        Ok(be_u16(self.take(2)?))
    }

    pub(crate) fn be_u24(&mut self) -> Result<u32, ReadError> {
        Ok(be_u24(self.take(3)?))
    }

    pub(crate) fn be_u32(&mut self) -> Result<u32, ReadError> {
        Ok(be_u32(self.take(4)?))
    }

    pub(crate) fn be_u64(&mut self) -> Result<u64, ReadError> {
        Ok(be_u64(self.take(8)?))
    }

    pub(crate) fn le_u16(&mut self) -> Result<u16, ReadError> {
        Ok(le_u16(self.take(2)?))
    }

    pub(crate) fn le_u32(&mut self) -> Result<u32, ReadError> {
        Ok(le_u32(self.take(4)?))
    }

    pub(crate) fn le_u64(&mut self) -> Result<u64, ReadError> {
        Ok(le_u64(self.take(8)?))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Big-endian helpers over byte slices; callers bounds-check.
pub(crate) fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub(crate) fn be_u24(b: &[u8]) -> u32 {
    (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32
}

pub(crate) fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

pub(crate) fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

pub(crate) fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
