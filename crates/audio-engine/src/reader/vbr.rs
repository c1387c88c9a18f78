//! Side tables carried in the first MPEG audio frame: Xing/Info (with an optional LAME
//! extension) and Fraunhofer VBRI.

use audio_stream_types::{GaplessInfo, ReplayGain};

use super::tags::apply_packed_gain;
use super::{be_u16, be_u32, ByteCursor, ReadError};

/// Decoder delay LAME adds on top of the encoder delay it records.
pub const LAME_DECODER_DELAY: u64 = 529;

/// Xing / Info header.
#[derive(Clone, Debug, PartialEq)]
pub struct XingHeader {
    /// Audio frames, excluding the frame holding this header.
    pub frames: Option<u32>,
    /// Stream bytes, including the frame holding this header.
    pub bytes: Option<u32>,
    pub toc: Option<[u8; 100]>,
    pub lame: Option<LameTag>,
}

/// Side-info length preceding the Xing/VBRI payload: index by `[mpeg1][mono]`.
pub fn side_info_len(mpeg1: bool, mono: bool) -> usize {
    match (mpeg1, mono) {
        (true, false) => 32,
        (true, true) => 17,
        (false, false) => 17,
        (false, true) => 9,
    }
}

impl XingHeader {
    /// Parse from a whole frame (`frame[0..4]` is the MPEG header).
    pub fn parse(frame: &[u8], mpeg1: bool, mono: bool) -> Option<Self> {
        let start = 4 + side_info_len(mpeg1, mono);
        let tag = frame.get(start..start + 8)?;
        if &tag[..4] != b"Xing" && &tag[..4] != b"Info" {
            return None;
        }
        let flags = be_u32(&tag[4..]);
        let mut cur = ByteCursor::new(&frame[start + 8..], "Xing header");
        let frames = if flags & 0x1 != 0 { Some(cur.be_u32().ok()?) } else { None };
        let bytes = if flags & 0x2 != 0 { Some(cur.be_u32().ok()?) } else { None };
        let toc = if flags & 0x4 != 0 {
            let mut t = [0u8; 100];
            t.copy_from_slice(cur.take(100).ok()?);
            Some(t)
        } else {
            None
        };
        if flags & 0x8 != 0 {
            cur.skip(4).ok()?;
        }
        // The LAME block follows whichever fields the flags declared.
        let lame = LameTag::parse(cur.rest());
        Some(Self {
            frames,
            bytes,
            toc,
            lame,
        })
    }

    /// Byte offset (relative to the first frame) for `percent` in `[0, 100]`.
    pub fn seek_offset(&self, percent: f64) -> Option<u64> {
        Some(toc_offset(self.toc.as_ref()?, self.bytes? as u64, percent))
    }

    /// Playback percentage represented by `offset` (inverse of [`Self::seek_offset`]).
    pub fn percent_at(&self, offset: u64) -> Option<f64> {
        Some(toc_percent(self.toc.as_ref()?, self.bytes? as u64, offset))
    }
}

fn toc_entry(toc: &[u8; 100], i: usize) -> f64 {
    if i >= 100 { 256.0 } else { toc[i] as f64 }
}

/// Interpolate entries `floor(p)` and `floor(p) + 1`, then scale by `bytes / 256`.
pub fn toc_offset(toc: &[u8; 100], bytes: u64, percent: f64) -> u64 {
    let p = percent.clamp(0.0, 100.0);
    let a = (p.floor() as usize).min(99);
    let fa = toc_entry(toc, a);
    let fb = toc_entry(toc, a + 1).max(fa);
    let fx = fa + (fb - fa) * (p - a as f64);
    (fx / 256.0 * bytes as f64) as u64
}

/// Inverse of [`toc_offset`]: percentage whose interpolated offset is `offset`.
pub fn toc_percent(toc: &[u8; 100], bytes: u64, offset: u64) -> f64 {
    if bytes == 0 {
        return 0.0;
    }
    let fx = (offset as f64 * 256.0 / bytes as f64).clamp(0.0, 256.0);
    let mut a = 0usize;
    while a < 99 && toc_entry(toc, a + 1) <= fx {
        a += 1;
    }
    let fa = toc_entry(toc, a);
    let fb = toc_entry(toc, a + 1);
    if fb <= fa {
        return a as f64;
    }
    (a as f64 + (fx - fa) / (fb - fa)).clamp(0.0, 100.0)
}

/// LAME extension of the Xing header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LameTag {
    pub encoder: String,
    pub encoder_delay: u16,
    pub encoder_padding: u16,
    pub replay_gain: ReplayGain,
}

impl LameTag {
    /// Parse the 36-byte LAME block.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < 36 {
            return None;
        }
        let encoder = &b[..9];
        if !(encoder.starts_with(b"LAME") || encoder.starts_with(b"Lavc") || encoder.starts_with(b"Lavf")) {
            return None;
        }
        let mut replay_gain = ReplayGain::default();
        let peak = be_u32(&b[11..]);
        if peak != 0 {
            replay_gain.track_peak = Some(peak as f32 / (1u32 << 23) as f32);
        }
        apply_packed_gain(&mut replay_gain, be_u16(&b[15..]));
        apply_packed_gain(&mut replay_gain, be_u16(&b[17..]));
        let delay_padding = (b[21] as u32) << 16 | (b[22] as u32) << 8 | b[23] as u32;
        Some(Self {
            encoder: String::from_utf8_lossy(encoder).trim_end_matches('\0').trim().to_string(),
            encoder_delay: (delay_padding >> 12) as u16,
            encoder_padding: (delay_padding & 0xFFF) as u16,
            replay_gain,
        })
    }

    /// Samples to trim at each edge of the decoded stream.
    pub fn gapless(&self) -> GaplessInfo {
        GaplessInfo {
            padding_start: self.encoder_delay as u64 + LAME_DECODER_DELAY,
            padding_end: (self.encoder_padding as u64).saturating_sub(LAME_DECODER_DELAY),
        }
    }
}

/// Fraunhofer VBRI header, always 32 bytes after the 4-byte frame header.
#[derive(Clone, Debug, PartialEq)]
pub struct VbriHeader {
    pub delay: u16,
    pub bytes: u32,
    pub frames: u32,
    pub frames_per_entry: u32,
    /// Byte length of each TOC chunk, already scaled.
    pub entries: Vec<u32>,
}

impl VbriHeader {
    pub const OFFSET: usize = 36;

    pub fn parse(frame: &[u8]) -> Result<Option<Self>, ReadError> {
        let Some(body) = frame.get(Self::OFFSET..) else {
            return Ok(None);
        };
        if !body.starts_with(b"VBRI") {
            return Ok(None);
        }
        let mut cur = ByteCursor::new(&body[4..], "VBRI header");
        let _version = cur.be_u16()?;
        let delay = cur.be_u16()?;
        let _quality = cur.be_u16()?;
        let bytes = cur.be_u32()?;
        let frames = cur.be_u32()?;
        let count = cur.be_u16()? as usize;
        let scale = cur.be_u16()? as u32;
        let entry_size = cur.be_u16()? as usize;
        let frames_per_entry = cur.be_u16()? as u32;
        if !(1..=4).contains(&entry_size) {
            return Err(ReadError::malformed(format!("VBRI entry size {entry_size}")));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = cur.take(entry_size)?;
            let v = raw.iter().fold(0u32, |acc, &b| acc << 8 | b as u32);
            entries.push(v.saturating_mul(scale.max(1)));
        }
        Ok(Some(Self {
            delay,
            bytes,
            frames,
            frames_per_entry,
            entries,
        }))
    }

    /// Accumulate chunk deltas up to the chunk holding `frame`.
    ///
    /// Returns the byte offset (relative to the first frame) and the first frame of that chunk.
    pub fn seek_offset(&self, frame: u64) -> (u64, u64) {
        if self.frames_per_entry == 0 {
            return (0, 0);
        }
        let chunk = ((frame / self.frames_per_entry as u64) as usize).min(self.entries.len());
        let offset: u64 = self.entries[..chunk].iter().map(|&e| e as u64).sum();
        (offset, chunk as u64 * self.frames_per_entry as u64)
    }
}

#[cfg(test)]
pub(crate) fn identity_toc() -> [u8; 100] {
    let mut toc = [0u8; 100];
    for (i, t) in toc.iter_mut().enumerate() {
        *t = (i as f64 * 2.56) as u8;
    }
    toc
}
