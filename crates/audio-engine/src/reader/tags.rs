//! Tag helpers shared by several formats: Vorbis comments, ReplayGain text values,
//! iTunes gapless (`iTunSMPB`) strings and the packed 16-bit ReplayGain field used by
//! both LAME tags and ID3 `RGAD` frames.

use audio_stream_types::{GaplessInfo, MetaInfo, ReplayGain};

use super::{ByteCursor, ReadError};

/// Metadata recovered from a tag block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagSummary {
    pub meta: MetaInfo,
    pub replay_gain: ReplayGain,
    /// Gapless info plus the original (untrimmed-by-encoder) sample count, when stated.
    pub gapless: Option<(GaplessInfo, Option<u64>)>,
}

impl TagSummary {
    /// Fill fields missing here from `other`.
    pub fn merge(&mut self, other: TagSummary) {
        self.meta.merge(other.meta);
        self.replay_gain.merge(&other.replay_gain);
        if self.gapless.is_none() {
            self.gapless = other.gapless;
        }
    }

    /// Apply one `KEY=value` style field (case-insensitive key).
    pub fn apply_field(&mut self, key: &str, value: &str) {
        let value = value.trim_end_matches('\0').trim();
        if value.is_empty() {
            return;
        }
        match key.to_ascii_uppercase().as_str() {
            "TITLE" => set_once(&mut self.meta.title, value),
            "ARTIST" => set_once(&mut self.meta.artist, value),
            "ALBUM" => set_once(&mut self.meta.album, value),
            "REPLAYGAIN_TRACK_GAIN" => self.replay_gain.track_gain = parse_gain_db(value),
            "REPLAYGAIN_TRACK_PEAK" => self.replay_gain.track_peak = value.parse().ok(),
            "REPLAYGAIN_ALBUM_GAIN" => self.replay_gain.album_gain = parse_gain_db(value),
            "REPLAYGAIN_ALBUM_PEAK" => self.replay_gain.album_peak = value.parse().ok(),
            "ITUNSMPB" => {
                if let Some(g) = parse_itunsmpb(value) {
                    self.gapless = Some(g);
                }
            }
            _ => {}
        }
    }
}

fn set_once(slot: &mut Option<String>, value: &str) {
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

/// Parse `"-6.52 dB"` / `"+1.2"` into dB.
pub fn parse_gain_db(value: &str) -> Option<f32> {
    let v = value.trim();
    let v = v
        .strip_suffix("dB")
        .or_else(|| v.strip_suffix("db"))
        .or_else(|| v.strip_suffix("DB"))
        .unwrap_or(v)
        .trim();
    v.parse::<f32>().ok()
}

/// Parse an iTunes `iTunSMPB` value.
///
/// Layout: space-separated hex words; word 1 is the encoder delay, word 2 the end padding,
/// word 3 the original sample count.
pub fn parse_itunsmpb(value: &str) -> Option<(GaplessInfo, Option<u64>)> {
    let words: Vec<&str> = value.split_whitespace().collect();
    if words.len() < 3 {
        return None;
    }
    let start = u64::from_str_radix(words[1], 16).ok()?;
    let end = u64::from_str_radix(words[2], 16).ok()?;
    let total = words
        .get(3)
        .and_then(|w| u64::from_str_radix(w, 16).ok())
        .filter(|&t| t > 0);
    Some((
        GaplessInfo {
            padding_start: start,
            padding_end: end,
        },
        total,
    ))
}

/// Which gain a packed ReplayGain field describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GainKind {
    Track,
    Album,
}

/// Decode the packed 16-bit gain field: 3-bit name, 3-bit originator, sign bit,
/// 9-bit magnitude in tenths of a dB (a signed 10-bit value).
pub fn parse_packed_gain(field: u16) -> Option<(GainKind, f32)> {
    let name = (field >> 13) & 0x7;
    let originator = (field >> 10) & 0x7;
    let negative = (field >> 9) & 0x1 == 1;
    let magnitude = (field & 0x1FF) as f32 / 10.0;
    if originator == 0 && magnitude == 0.0 {
        return None;
    }
    let kind = match name {
        1 => GainKind::Track,
        2 => GainKind::Album,
        _ => return None,
    };
    Some((kind, if negative { -magnitude } else { magnitude }))
}

/// Store a packed gain into `rg` unless already set.
pub fn apply_packed_gain(rg: &mut ReplayGain, field: u16) {
    match parse_packed_gain(field) {
        Some((GainKind::Track, g)) if rg.track_gain.is_none() => rg.track_gain = Some(g),
        Some((GainKind::Album, g)) if rg.album_gain.is_none() => rg.album_gain = Some(g),
        _ => {}
    }
}

/// Parse a Vorbis comment block (little-endian lengths).
///
/// `data` starts at the vendor length; framing bits after the list are ignored.
pub fn parse_vorbis_comments(data: &[u8]) -> Result<TagSummary, ReadError> {
    let mut out = TagSummary::default();
    let mut cur = ByteCursor::new(data, "vorbis comment");
    let vendor_len = cur.le_u32()? as usize;
    cur.skip(vendor_len)?;
    let count = cur.le_u32()?;
    for _ in 0..count {
        let len = cur.le_u32()? as usize;
        let field = cur.take(len)?;
        let text = String::from_utf8_lossy(field);
        if let Some((k, v)) = text.split_once('=') {
            out.apply_field(k, v);
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn build_vorbis_comments(fields: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    let vendor = b"test vendor";
    out.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    out.extend_from_slice(vendor);
    out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for f in fields {
        out.extend_from_slice(&(f.len() as u32).to_le_bytes());
        out.extend_from_slice(f.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itunsmpb_reads_delay_padding_and_length() {
        let v = " 00000000 00000840 000001C4 0000000000046A40 00000000 00000000";
        let (g, total) = parse_itunsmpb(v).unwrap();
        assert_eq!(g.padding_start, 0x840);
        assert_eq!(g.padding_end, 0x1C4);
        assert_eq!(total, Some(0x46A40));
    }

    #[test]
    fn packed_gain_sign_and_kind() {
        // name=1 (track), originator=3, negative, 65 tenths
        let field: u16 = (1 << 13) | (3 << 10) | (1 << 9) | 65;
        assert_eq!(parse_packed_gain(field), Some((GainKind::Track, -6.5)));
        let album: u16 = (2 << 13) | (1 << 10) | 12;
        assert_eq!(parse_packed_gain(album), Some((GainKind::Album, 1.2)));
        assert_eq!(parse_packed_gain(0), None);
    }

    #[test]
    fn vorbis_comments_map_known_fields() {
        let block = build_vorbis_comments(&[
            "TITLE=Song",
            "artist=Band",
            "ALBUM=Record",
            "REPLAYGAIN_TRACK_GAIN=-7.10 dB",
            "REPLAYGAIN_TRACK_PEAK=0.98",
        ]);
        let s = parse_vorbis_comments(&block).unwrap();
        assert_eq!(s.meta.title.as_deref(), Some("Song"));
        assert_eq!(s.meta.artist.as_deref(), Some("Band"));
        assert_eq!(s.meta.album.as_deref(), Some("Record"));
        assert_eq!(s.replay_gain.track_gain, Some(-7.1));
        assert_eq!(s.replay_gain.track_peak, Some(0.98));
    }

    #[test]
    fn vorbis_comments_reject_truncation() {
        let mut block = build_vorbis_comments(&["TITLE=Song"]);
        block.truncate(block.len() - 2);
        assert!(parse_vorbis_comments(&block).is_err());
    }
}
