//! M3U / PLS playlists. They carry no audio; the reader only reports the listed URIs.

use super::{finish, Demux, ProcessStatus, ReadError, StreamHeader};
use crate::packet::Packet;
use crate::source::{ByteSource, ByteSourceExt};

/// Playlists larger than this are not playlists.
const MAX_PLAYLIST_BYTES: usize = 256 * 1024;

/// Entries of an M3U/M3U8 body: every non-comment line.
pub fn parse_m3u(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Entries of a PLS body: `FileN=` values in `N` order.
pub fn parse_pls(body: &str) -> Vec<String> {
    let mut entries: Vec<(u32, String)> = body
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let index = key.trim().strip_prefix("File")?.parse().ok()?;
            Some((index, value.trim().to_string()))
        })
        .filter(|(_, v)| !v.is_empty())
        .collect();
    entries.sort_by_key(|(i, _)| *i);
    entries.into_iter().map(|(_, v)| v).collect()
}

/// `true` when `body` starts like a PLS file.
pub fn looks_like_pls(body: &[u8]) -> bool {
    let trimmed = body.trim_ascii_start();
    trimmed.len() >= 10 && trimmed[..10].eq_ignore_ascii_case(b"[playlist]")
}

pub struct PlaylistReader {
    entries: Option<Vec<String>>,
}

impl Default for PlaylistReader {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaylistReader {
    pub fn new() -> Self {
        Self { entries: None }
    }
}

impl Demux for PlaylistReader {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let mut body = vec![0u8; MAX_PLAYLIST_BYTES];
        let got = src.fill(&mut body)?;
        body.truncate(got);
        let text = String::from_utf8_lossy(&body);
        let text = text.trim_start_matches('\u{feff}');
        let entries = if looks_like_pls(text.as_bytes()) {
            parse_pls(text)
        } else {
            parse_m3u(text)
        };
        if entries.is_empty() {
            return Err(ReadError::malformed("playlist without entries"));
        }
        tracing::info!(entries = entries.len(), "playlist");
        self.entries = Some(entries);
        Ok(None)
    }

    fn process(&mut self, _src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        match self.entries.take() {
            Some(entries) => Ok(ProcessStatus::Redirect(entries)),
            None => finish(packet),
        }
    }
}
