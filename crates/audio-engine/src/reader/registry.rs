//! Format detection: magic bytes first, then the caller's name hint and content type.

use std::path::Path;

use super::a52::A52Syntax;
use super::adts::AdtsSyntax;
use super::dca::DcaSyntax;
use super::elementary::{FrameInfo, FrameSyntax, HEADER_WINDOW};
use super::id3::Id3v2Header;
use super::mpeg::MpegHeader;
use super::playlist::looks_like_pls;
use super::{ReadError, Reader, ReaderKind, ReaderOptions};
use crate::source::{ByteSource, ByteSourceExt, REPLAY_WINDOW};

/// Bytes inspected by [`FormatRegistry::detect`].
pub const PROBE_BYTES: usize = 8 * 1024;

/// Static description of one format.
#[derive(Clone, Copy, Debug)]
pub struct FormatDescriptor {
    pub kind: ReaderKind,
    pub extensions: &'static [&'static str],
    pub mime_types: &'static [&'static str],
    /// Recognises the format from its leading bytes.
    marker: fn(&[u8]) -> bool,
}

fn flac_marker(b: &[u8]) -> bool {
    b.starts_with(b"fLaC")
}

fn ogg_marker(b: &[u8]) -> bool {
    b.starts_with(b"OggS")
}

fn wav_marker(b: &[u8]) -> bool {
    b.len() >= 12 && (b.starts_with(b"RIFF") || b.starts_with(b"RF64")) && &b[8..12] == b"WAVE"
}

fn mp4_marker(b: &[u8]) -> bool {
    b.len() >= 8 && matches!(&b[4..8], b"ftyp" | b"moov")
}

fn playlist_marker(b: &[u8]) -> bool {
    let b = b.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(b);
    b.trim_ascii_start().starts_with(b"#EXTM3U") || looks_like_pls(b)
}

fn no_marker(_: &[u8]) -> bool {
    false
}

const FORMATS: [FormatDescriptor; 9] = [
    FormatDescriptor {
        kind: ReaderKind::Flac,
        extensions: &["flac"],
        mime_types: &["audio/flac", "audio/x-flac"],
        marker: flac_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Ogg,
        extensions: &["ogg", "oga", "opus"],
        mime_types: &["audio/ogg", "application/ogg", "audio/opus", "audio/vorbis"],
        marker: ogg_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Wav,
        extensions: &["wav", "wave"],
        mime_types: &["audio/wav", "audio/x-wav", "audio/wave"],
        marker: wav_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Mp4,
        extensions: &["m4a", "mp4", "m4b"],
        mime_types: &["audio/mp4", "audio/x-m4a", "video/mp4"],
        marker: mp4_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Playlist,
        extensions: &["m3u", "m3u8", "pls"],
        mime_types: &["audio/x-mpegurl", "audio/mpegurl", "application/vnd.apple.mpegurl", "audio/x-scpls"],
        marker: playlist_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Adts,
        extensions: &["aac", "adts"],
        mime_types: &["audio/aac", "audio/aacp", "audio/x-aac"],
        marker: no_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::A52,
        extensions: &["ac3", "a52"],
        mime_types: &["audio/ac3"],
        marker: no_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Dca,
        extensions: &["dts"],
        mime_types: &["audio/vnd.dts"],
        marker: no_marker,
    },
    FormatDescriptor {
        kind: ReaderKind::Mpeg,
        extensions: &["mp3", "mp2", "mp1", "mpga"],
        mime_types: &["audio/mpeg", "audio/mp3"],
        marker: no_marker,
    },
];

/// Sync-based formats in probe order.
const SYNCED: [ReaderKind; 4] = [ReaderKind::A52, ReaderKind::Dca, ReaderKind::Adts, ReaderKind::Mpeg];

/// Header of a frame-synced format at the start of `b`: `(frame length, compatibility key)`.
fn frame_at(kind: ReaderKind, b: &[u8]) -> Option<(usize, u64)> {
    fn elementary<S: FrameSyntax>(b: &[u8]) -> Option<FrameInfo> {
        let window: &[u8; HEADER_WINDOW] = b.get(..HEADER_WINDOW)?.try_into().ok()?;
        S::parse(window)
    }
    let key = |f: FrameInfo| (f.len, (f.sample_rate as u64) << 32 | (f.channels as u64) << 16 | f.config as u64);
    match kind {
        ReaderKind::A52 => elementary::<A52Syntax>(b).map(key),
        ReaderKind::Dca => elementary::<DcaSyntax>(b).map(key),
        ReaderKind::Adts => elementary::<AdtsSyntax>(b).map(key),
        ReaderKind::Mpeg => {
            let h = MpegHeader::parse(b.get(..4)?.try_into().ok()?)?;
            Some((h.frame_len(), (h.sample_rate as u64) << 16 | h.channels as u64))
        }
        _ => None,
    }
}

/// Probe result for a synced format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncMatch {
    /// Two consecutive compatible frames.
    Confirmed(ReaderKind),
    /// A lone valid header (possibly the last frame in the buffer).
    Single(ReaderKind),
}

fn scan_synced(b: &[u8]) -> Option<SyncMatch> {
    let mut single = None;
    for at in 0..b.len().saturating_sub(4) {
        for kind in SYNCED {
            let Some((len, key)) = frame_at(kind, &b[at..]) else {
                continue;
            };
            match b.get(at + len..).and_then(|rest| frame_at(kind, rest)) {
                Some((_, next)) if next == key => return Some(SyncMatch::Confirmed(kind)),
                None if at + len + HEADER_WINDOW > b.len() && single.is_none() => single = Some(kind),
                _ => {}
            }
        }
    }
    single.map(SyncMatch::Single)
}

/// Lower-cased extension of a path or URL, ignoring any query string.
pub fn extension_of(name: &str) -> Option<String> {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Closed table of supported formats.
#[derive(Clone, Debug)]
pub struct FormatRegistry {
    formats: &'static [FormatDescriptor],
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self { formats: &FORMATS }
    }

    pub fn formats(&self) -> &[FormatDescriptor] {
        self.formats
    }

    pub fn by_extension(&self, ext: &str) -> Option<ReaderKind> {
        let ext = ext.to_ascii_lowercase();
        self.formats
            .iter()
            .find(|f| f.extensions.contains(&ext.as_str()))
            .map(|f| f.kind)
    }

    pub fn by_mime(&self, mime: &str) -> Option<ReaderKind> {
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
        self.formats
            .iter()
            .find(|f| f.mime_types.contains(&mime.as_str()))
            .map(|f| f.kind)
    }

    /// Pick a format from leading bytes (past any ID3v2 tag), a name hint and a MIME type.
    pub fn probe(&self, head: &[u8], hint: Option<&str>, content_type: Option<&str>) -> Option<ReaderKind> {
        if let Some(f) = self.formats.iter().find(|f| (f.marker)(head)) {
            return Some(f.kind);
        }
        let synced = scan_synced(head);
        if let Some(SyncMatch::Confirmed(kind)) = synced {
            return Some(kind);
        }
        let hinted = hint
            .and_then(extension_of)
            .and_then(|e| self.by_extension(&e))
            .or_else(|| content_type.and_then(|m| self.by_mime(m)));
        hinted.or(match synced {
            Some(SyncMatch::Single(kind)) => Some(kind),
            _ => None,
        })
    }

    /// Detect the format of `src` without consuming it.
    ///
    /// The source must be positioned at its start; it is left there.
    pub fn detect(&self, src: &mut dyn ByteSource, hint: Option<&str>) -> Result<ReaderKind, ReadError> {
        let start = src.position();
        let mut head = vec![0u8; PROBE_BYTES];
        let got = src.fill(&mut head)?;
        head.truncate(got);

        let mut skip = 0u64;
        while let Some(tag) = head.get(skip as usize..).and_then(Id3v2Header::parse) {
            skip += tag.total_len();
        }
        if skip > 0 {
            tracing::debug!(tag_bytes = skip, "probing past ID3v2");
            let serial_limit = (REPLAY_WINDOW / 2) as u64;
            if skip as usize >= head.len() && !(src.is_serial() && skip > serial_limit) {
                src.seek(start + skip)?;
                head.resize(PROBE_BYTES, 0);
                let got = src.fill(&mut head)?;
                head.truncate(got);
                skip = 0;
            } else if skip as usize >= head.len() {
                head.clear();
                skip = 0;
            }
        }
        let kind = self.probe(&head[skip as usize..], hint, src.content_type());
        src.seek(start)?;
        match kind {
            Some(kind) => {
                tracing::debug!(format = kind.label(), "format detected");
                Ok(kind)
            }
            None => Err(ReadError::unsupported(format!(
                "unrecognised format{}",
                hint.map(|h| format!(" for {h}")).unwrap_or_default()
            ))),
        }
    }

    /// Detect and construct the matching reader.
    pub fn open(
        &self,
        src: &mut dyn ByteSource,
        hint: Option<&str>,
        options: &ReaderOptions,
    ) -> Result<Reader, ReadError> {
        let kind = self.detect(src, hint)?;
        Ok(Reader::new(kind, options))
    }
}
