//! ID3v2 tag parsing plus detection of trailing ID3v1 / Lyrics3 / APE tags.
//!
//! ID3v2 sizes are "sync-safe": 7 bits per byte, top bit always clear, so tag data can
//! never contain a false MPEG frame sync. Unsynchronisation goes further and inserts a
//! `0x00` after every `0xFF` that could start a sync; [`remove_unsync`] undoes it.

use audio_stream_types::ReplayGain;

use super::tags::{apply_packed_gain, TagSummary};
use super::{be_u16, be_u24, be_u32, ByteCursor, ReadError};
use crate::source::{ByteSource, ByteSourceExt};

/// Tags larger than this are skipped without parsing.
const MAX_TAG_BYTES: u32 = 16 << 20;

/// Decode a 4-byte sync-safe integer.
pub fn syncsafe(b: &[u8]) -> u32 {
    (b[0] as u32 & 0x7F) << 21 | (b[1] as u32 & 0x7F) << 14 | (b[2] as u32 & 0x7F) << 7 | (b[3] as u32 & 0x7F)
}

/// Encode a value below 2^28 as a sync-safe integer.
pub fn encode_syncsafe(v: u32) -> [u8; 4] {
    [
        ((v >> 21) & 0x7F) as u8,
        ((v >> 14) & 0x7F) as u8,
        ((v >> 7) & 0x7F) as u8,
        (v & 0x7F) as u8,
    ]
}

/// Remove the `0x00` following every `0xFF`, compacting `buf` in place.
pub fn remove_unsync(buf: &mut Vec<u8>) {
    let mut read = 0;
    let mut write = 0;
    while read < buf.len() {
        let b = buf[read];
        buf[write] = b;
        write += 1;
        if b == 0xFF && read + 1 < buf.len() && buf[read + 1] == 0x00 {
            read += 2;
        } else {
            read += 1;
        }
    }
    buf.truncate(write);
}

/// The encoder side: insert `0x00` after each `0xFF` that precedes `0x00`, a byte
/// `>= 0xE0`, or the end of the buffer.
pub fn apply_unsync(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for (i, &b) in data.iter().enumerate() {
        out.push(b);
        if b == 0xFF {
            match data.get(i + 1) {
                None => out.push(0x00),
                Some(&next) if next == 0x00 || next >= 0xE0 => out.push(0x00),
                Some(_) => {}
            }
        }
    }
    out
}

/// Fixed 10-byte ID3v2 header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Id3v2Header {
    pub major: u8,
    pub flags: u8,
    /// Tag size excluding header and footer.
    pub size: u32,
}

impl Id3v2Header {
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < 10 || &b[..3] != b"ID3" || b[3] == 0xFF || b[4] == 0xFF {
            return None;
        }
        if b[6..10].iter().any(|&x| x & 0x80 != 0) {
            return None;
        }
        Some(Self {
            major: b[3],
            flags: b[5],
            size: syncsafe(&b[6..10]),
        })
    }

    fn has_footer(&self) -> bool {
        self.major >= 4 && self.flags & 0x10 != 0
    }

    /// Header + body + optional footer.
    pub fn total_len(&self) -> u64 {
        10 + self.size as u64 + if self.has_footer() { 10 } else { 0 }
    }
}

/// Parse every ID3v2 tag at the current position.
///
/// Leaves the source right after the last tag; on no tag, the position is unchanged.
pub fn read_id3v2(src: &mut dyn ByteSource) -> Result<Option<TagSummary>, ReadError> {
    let mut found: Option<TagSummary> = None;
    loop {
        let start = src.position();
        let mut head = [0u8; 10];
        let got = src.fill(&mut head)?;
        let Some(header) = (got == 10).then(|| Id3v2Header::parse(&head)).flatten() else {
            src.seek(start)?;
            return Ok(found);
        };
        let body_end = start + header.total_len();
        if header.size > MAX_TAG_BYTES || header.major < 2 || header.major > 4 {
            tracing::warn!(size = header.size, major = header.major, "skipping ID3v2 tag");
            src.skip(header.total_len() - 10)?;
            continue;
        }
        let mut body = vec![0u8; header.size as usize];
        let got = src.fill(&mut body)?;
        body.truncate(got);
        if src.position() < body_end {
            src.skip(body_end - src.position())?;
        }
        tracing::debug!(major = header.major, size = header.size, "ID3v2 tag");
        let summary = parse_id3v2_body(&header, body);
        match found.as_mut() {
            Some(f) => f.merge(summary),
            None => found = Some(summary),
        }
    }
}

/// Parse a tag body (everything after the 10-byte header).
pub fn parse_id3v2_body(header: &Id3v2Header, mut body: Vec<u8>) -> TagSummary {
    let mut out = TagSummary::default();
    if header.major < 4 && header.flags & 0x80 != 0 {
        remove_unsync(&mut body);
    }
    let mut at = 0usize;
    if header.flags & 0x40 != 0 && body.len() >= 4 {
        at = match header.major {
            3 => 4 + be_u32(&body) as usize,
            4 => syncsafe(&body) as usize,
            _ => 0,
        };
    }
    let (id_len, head_len) = if header.major == 2 { (3, 6) } else { (4, 10) };
    while at + head_len <= body.len() {
        let id = &body[at..at + id_len];
        if id[0] == 0 || !id.iter().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            break;
        }
        let size = match header.major {
            2 => be_u24(&body[at + 3..]) as usize,
            3 => be_u32(&body[at + 4..]) as usize,
            _ => syncsafe(&body[at + 4..]) as usize,
        };
        let flags = if header.major == 2 { 0 } else { be_u16(&body[at + 8..]) };
        let start = at + head_len;
        let Some(end) = start.checked_add(size).filter(|&e| e <= body.len()) else {
            tracing::debug!(frame = %String::from_utf8_lossy(id), "ID3v2 frame overruns tag");
            break;
        };
        let id = String::from_utf8_lossy(id).into_owned();
        if let Some(data) = frame_payload(header.major, flags, &body[start..end]) {
            dispatch_frame(&id, &data, &mut out);
        }
        at = end;
    }
    out
}

/// Undo per-frame flags. `None` for compressed or encrypted frames.
fn frame_payload(major: u8, flags: u16, raw: &[u8]) -> Option<Vec<u8>> {
    match major {
        3 => {
            if flags & 0x0080 != 0 || flags & 0x0040 != 0 {
                return None;
            }
            Some(raw.to_vec())
        }
        4 => {
            if flags & 0x0008 != 0 || flags & 0x0004 != 0 {
                return None;
            }
            let mut data = raw.to_vec();
            if flags & 0x0002 != 0 {
                remove_unsync(&mut data);
            }
            if flags & 0x0001 != 0 {
                if data.len() < 4 {
                    return None;
                }
                data.drain(..4);
            }
            Some(data)
        }
        _ => Some(raw.to_vec()),
    }
}

fn dispatch_frame(id: &str, data: &[u8], out: &mut TagSummary) {
    match id {
        "TIT2" | "TT2" => out.apply_field("TITLE", &decode_text(data)),
        "TPE1" | "TP1" => out.apply_field("ARTIST", &decode_text(data)),
        "TALB" | "TAL" => out.apply_field("ALBUM", &decode_text(data)),
        "COMM" | "COM" => {
            if let Some((desc, text)) = parse_comment(data) {
                if desc.eq_ignore_ascii_case("iTunSMPB") {
                    out.apply_field("ITUNSMPB", &text);
                }
            }
        }
        "TXXX" | "TXX" => {
            if let Some((desc, value)) = parse_user_text(data) {
                out.apply_field(&desc, &value);
            }
        }
        "RGAD" => parse_rgad(data, &mut out.replay_gain),
        "RVA2" => parse_rva2(data, &mut out.replay_gain),
        _ => {}
    }
}

/// Decode a text frame: encoding byte then text; returns the first string.
pub fn decode_text(data: &[u8]) -> String {
    let Some((&enc, rest)) = data.split_first() else {
        return String::new();
    };
    let (text, _) = decode_string(enc, rest);
    text
}

/// Decode one terminated string in encoding `enc`; returns it and the bytes after it.
fn decode_string(enc: u8, data: &[u8]) -> (String, &[u8]) {
    match enc {
        1 | 2 => {
            let mut end = data.len() & !1;
            let mut i = 0;
            while i + 1 < data.len() {
                if data[i] == 0 && data[i + 1] == 0 {
                    end = i;
                    break;
                }
                i += 2;
            }
            let rest = data.get(end + 2..).unwrap_or(&[]);
            (decode_utf16(&data[..end], enc == 2), rest)
        }
        _ => {
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            let rest = data.get(end + 1..).unwrap_or(&[]);
            let text = if enc == 3 {
                String::from_utf8_lossy(&data[..end]).into_owned()
            } else {
                data[..end].iter().map(|&b| b as char).collect()
            };
            (text, rest)
        }
    }
}

fn decode_utf16(data: &[u8], default_be: bool) -> String {
    let (mut be, body) = match data {
        [0xFE, 0xFF, rest @ ..] => (true, rest),
        [0xFF, 0xFE, rest @ ..] => (false, rest),
        _ => (default_be, data),
    };
    if body.is_empty() {
        be = default_be;
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| {
            if be {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// `COMM`: encoding, 3-byte language, description, text.
fn parse_comment(data: &[u8]) -> Option<(String, String)> {
    if data.len() < 4 {
        return None;
    }
    let enc = data[0];
    let (desc, rest) = decode_string(enc, &data[4..]);
    let (text, _) = decode_string(enc, rest);
    Some((desc, text))
}

/// `TXXX`: encoding, description, value.
fn parse_user_text(data: &[u8]) -> Option<(String, String)> {
    let (&enc, rest) = data.split_first()?;
    let (desc, rest) = decode_string(enc, rest);
    let (value, _) = decode_string(enc, rest);
    Some((desc, value))
}

/// `RGAD`: 32-bit float peak, then radio and audiophile packed gain fields.
fn parse_rgad(data: &[u8], rg: &mut ReplayGain) {
    if data.len() < 8 {
        return;
    }
    let peak = f32::from_bits(be_u32(data));
    if peak > 0.0 && rg.track_peak.is_none() {
        rg.track_peak = Some(peak);
    }
    apply_packed_gain(rg, be_u16(&data[4..]));
    apply_packed_gain(rg, be_u16(&data[6..]));
}

/// `RVA2`: identification, then per-channel (type, i16 gain/512 dB, peak).
fn parse_rva2(data: &[u8], rg: &mut ReplayGain) {
    let (ident, rest) = decode_string(0, data);
    let mut cur = ByteCursor::new(rest, "RVA2");
    while let (Ok(channel), Ok(adj)) = (cur.u8(), cur.be_u16()) {
        let Ok(peak_bits) = cur.u8() else { break };
        if cur.skip((peak_bits as usize).div_ceil(8)).is_err() {
            break;
        }
        if channel != 1 {
            continue;
        }
        let gain = adj as i16 as f32 / 512.0;
        if ident.eq_ignore_ascii_case("album") {
            rg.album_gain.get_or_insert(gain);
        } else {
            rg.track_gain.get_or_insert(gain);
        }
    }
}

/// Parse a 128-byte ID3v1 block.
pub fn parse_id3v1(b: &[u8]) -> Option<TagSummary> {
    if b.len() < 128 || &b[..3] != b"TAG" {
        return None;
    }
    let field = |s: &[u8]| -> String {
        let end = s.iter().position(|&c| c == 0).unwrap_or(s.len());
        s[..end].iter().map(|&c| c as char).collect::<String>().trim().to_string()
    };
    let mut out = TagSummary::default();
    out.apply_field("TITLE", &field(&b[3..33]));
    out.apply_field("ARTIST", &field(&b[33..63]));
    out.apply_field("ALBUM", &field(&b[63..93]));
    Some(out)
}

/// Total size of an APE tag whose 32-byte footer is `footer`.
pub fn ape_tag_len(footer: &[u8]) -> Option<u64> {
    if footer.len() < 32 || &footer[..8] != b"APETAGEX" {
        return None;
    }
    let size = super::le_u32(&footer[12..]) as u64;
    let flags = super::le_u32(&footer[20..]);
    let header = if flags & 0x8000_0000 != 0 { 32 } else { 0 };
    Some(size + header)
}

/// Locate trailing tags on a seekable source.
///
/// Returns the offset where audio data ends and any ID3v1 metadata. The source position is
/// restored. Read failures surface as `Err` so callers can log and carry on.
pub fn scan_trailer(src: &mut dyn ByteSource) -> Result<(u64, Option<TagSummary>), ReadError> {
    let restore = src.position();
    let Some(size) = src.size() else {
        return Ok((u64::MAX, None));
    };
    let mut end = size;
    let mut v1 = None;

    if end >= 128 {
        let mut b = [0u8; 128];
        src.seek(end - 128)?;
        if src.fill(&mut b)? == 128 {
            if let Some(tag) = parse_id3v1(&b) {
                v1 = Some(tag);
                end -= 128;
            }
        }
    }
    if end >= 15 {
        let mut b = [0u8; 15];
        src.seek(end - 15)?;
        if src.fill(&mut b)? == 15 && &b[6..] == b"LYRICS200" {
            let digits = std::str::from_utf8(&b[..6]).ok().and_then(|s| s.parse::<u64>().ok());
            if let Some(len) = digits {
                end = end.saturating_sub(len + 15);
            }
        }
    }
    if end >= 32 {
        let mut b = [0u8; 32];
        src.seek(end - 32)?;
        if src.fill(&mut b)? == 32 {
            if let Some(len) = ape_tag_len(&b) {
                end = end.saturating_sub(len);
            }
        }
    }
    src.seek(restore)?;
    Ok((end, v1))
}

#[cfg(test)]
pub(crate) fn build_text_frame(id: &str, text: &str) -> Vec<u8> {
    let mut payload = vec![3u8];
    payload.extend_from_slice(text.as_bytes());
    let mut out = id.as_bytes().to_vec();
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
pub(crate) fn build_tag_v3(frames: &[Vec<u8>]) -> Vec<u8> {
    let body: Vec<u8> = frames.concat();
    let mut out = b"ID3\x03\x00\x00".to_vec();
    out.extend_from_slice(&encode_syncsafe(body.len() as u32));
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    #[test]
    fn syncsafe_roundtrip_and_top_bits() {
        let enc = encode_syncsafe(0x0FFF_FFFF);
        assert!(enc.iter().all(|b| b & 0x80 == 0));
        assert_eq!(syncsafe(&enc), 0x0FFF_FFFF);
        assert_eq!(syncsafe(&[0x00, 0x00, 0x02, 0x01]), 257);
    }

    #[test]
    fn unsync_roundtrips() {
        let original = vec![0xFF, 0x00, 0x12, 0xFF, 0xE3, 0xFF, 0x34, 0xFF, 0x00, 0x00, 0xFF];
        let encoded = apply_unsync(&original);
        assert_eq!(
            encoded,
            vec![0xFF, 0x00, 0x00, 0x12, 0xFF, 0x00, 0xE3, 0xFF, 0x34, 0xFF, 0x00, 0x00, 0x00, 0xFF, 0x00]
        );
        let mut decoded = encoded.clone();
        remove_unsync(&mut decoded);
        assert_eq!(decoded, original);
    }

    #[test]
    fn unsync_leaves_clean_data_alone() {
        let data = b"plain text without sync".to_vec();
        assert_eq!(apply_unsync(&data), data);
        let mut copy = data.clone();
        remove_unsync(&mut copy);
        assert_eq!(copy, data);
    }

    #[test]
    fn v3_text_frames_and_itunsmpb_comment() {
        let mut comm = vec![0u8];
        comm.extend_from_slice(b"eng");
        comm.extend_from_slice(b"iTunSMPB\0");
        comm.extend_from_slice(b" 00000000 00000210 00000120 0000000000000C00");
        let mut comm_frame = b"COMM".to_vec();
        comm_frame.extend_from_slice(&(comm.len() as u32).to_be_bytes());
        comm_frame.extend_from_slice(&[0, 0]);
        comm_frame.extend_from_slice(&comm);

        let tag = build_tag_v3(&[
            build_text_frame("TIT2", "Title"),
            build_text_frame("TPE1", "Artist"),
            comm_frame,
        ]);
        let mut data = tag.clone();
        data.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        let mut src = MemorySource::new(data);
        let summary = read_id3v2(&mut src).unwrap().unwrap();
        assert_eq!(src.position(), tag.len() as u64);
        assert_eq!(summary.meta.title.as_deref(), Some("Title"));
        assert_eq!(summary.meta.artist.as_deref(), Some("Artist"));
        let (g, total) = summary.gapless.unwrap();
        assert_eq!(g.padding_start, 0x210);
        assert_eq!(g.padding_end, 0x120);
        assert_eq!(total, Some(0xC00));
    }

    #[test]
    fn utf16_with_bom_and_latin1() {
        let mut utf16 = vec![1u8, 0xFF, 0xFE];
        for u in "Héllo".encode_utf16() {
            utf16.extend_from_slice(&u.to_le_bytes());
        }
        assert_eq!(decode_text(&utf16), "Héllo");
        assert_eq!(decode_text(&[0, b'c', 0xE9]), "cé");
    }

    #[test]
    fn rgad_frame_sets_track_gain_and_peak() {
        let mut data = 0.75f32.to_bits().to_be_bytes().to_vec();
        let radio: u16 = (1 << 13) | (3 << 10) | (1 << 9) | 42;
        data.extend_from_slice(&radio.to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        let mut rg = ReplayGain::default();
        parse_rgad(&data, &mut rg);
        assert_eq!(rg.track_peak, Some(0.75));
        assert_eq!(rg.track_gain, Some(-4.2));
    }

    #[test]
    fn no_tag_leaves_position() {
        let mut src = MemorySource::new(vec![0xFF, 0xFB, 0x90, 0x00, 0, 0, 0, 0, 0, 0, 0]);
        assert!(read_id3v2(&mut src).unwrap().is_none());
        assert_eq!(src.position(), 0);
    }

    #[test]
    fn trailer_detects_id3v1_and_ape() {
        let mut data = vec![0u8; 1000];
        let mut ape = b"APETAGEX".to_vec();
        ape.extend_from_slice(&2000u32.to_le_bytes());
        ape.extend_from_slice(&64u32.to_le_bytes());
        ape.extend_from_slice(&0u32.to_le_bytes());
        ape.extend_from_slice(&0u32.to_le_bytes());
        ape.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&ape);
        let mut v1 = vec![0u8; 128];
        v1[..3].copy_from_slice(b"TAG");
        v1[3..8].copy_from_slice(b"Name ");
        data.extend_from_slice(&v1);

        let mut src = MemorySource::new(data);
        let (end, tag) = scan_trailer(&mut src).unwrap();
        assert_eq!(end, 1000 + 32 - 64);
        assert_eq!(tag.unwrap().meta.title.as_deref(), Some("Name"));
        assert_eq!(src.position(), 0);
    }
}
