//! ISO-BMFF / MP4 audio (AAC, or MP3 in MP4).
//!
//! The whole `moov` atom is read into memory and walked there; samples are then fetched by
//! absolute offset from the sample table. Serial sources work only when `moov` comes
//! before `mdat`.

use audio_stream_types::{AudioFormat, CodecId, SampleEncoding};

use super::tags::TagSummary;
use super::{be_u32, be_u64, finish, ByteCursor, Demux, ProcessStatus, ReadError, StreamHeader};
use crate::event::ConfigureEvent;
use crate::packet::{Packet, PacketError};
use crate::source::{ByteSource, ByteSourceExt};

const MAX_MOOV: u64 = 64 << 20;

/// Atoms whose payload is a plain list of child atoms.
const CONTAINERS: [&[u8; 4]; 8] = [b"moov", b"trak", b"mdia", b"minf", b"stbl", b"udta", b"ilst", b"meta"];

/// One atom inside an in-memory buffer.
#[derive(Clone, Copy, Debug)]
pub struct Atom<'a> {
    pub kind: [u8; 4],
    pub payload: &'a [u8],
}

/// Iterator over sibling atoms; handles the 64-bit (`size == 1`) and to-the-end
/// (`size == 0`) escapes.
pub struct AtomIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AtomIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AtomIter<'a> {
    type Item = Result<Atom<'a>, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.pos..];
        if rest.len() < 8 {
            return None;
        }
        let size32 = be_u32(rest);
        let kind: [u8; 4] = [rest[4], rest[5], rest[6], rest[7]];
        let (header, size) = match size32 {
            0 => (8, rest.len() as u64),
            1 => {
                if rest.len() < 16 {
                    return Some(Err(ReadError::malformed("truncated 64-bit atom size")));
                }
                (16, be_u64(&rest[8..]))
            }
            n => (8, n as u64),
        };
        if size < header as u64 || size > rest.len() as u64 {
            self.pos = self.data.len();
            return Some(Err(ReadError::malformed(format!(
                "atom {} size {size} out of bounds",
                String::from_utf8_lossy(&kind)
            ))));
        }
        let size = size as usize;
        self.pos += size;
        Some(Ok(Atom {
            kind,
            payload: &rest[header..size],
        }))
    }
}

fn find<'a>(data: &'a [u8], kind: &[u8; 4]) -> Result<Option<&'a [u8]>, ReadError> {
    for atom in AtomIter::new(data) {
        let atom = atom?;
        if &atom.kind == kind {
            return Ok(Some(atom.payload));
        }
    }
    Ok(None)
}

/// Children of a `meta` atom: ISO makes it a full box, QuickTime does not.
fn meta_children(payload: &[u8]) -> &[u8] {
    if payload.len() >= 8 && &payload[4..8] == b"hdlr" {
        payload
    } else {
        payload.get(4..).unwrap_or(&[])
    }
}

/// Upper bound on samples in one track's table (days of audio at any common frame size).
const MAX_TABLE_SAMPLES: usize = 1 << 24;

/// Sample-to-offset and sample-to-time mapping for one track.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleTable {
    pub sizes: Vec<u32>,
    pub chunk_offsets: Vec<u64>,
    /// `(first_chunk (1-based), samples_per_chunk)`.
    pub stsc: Vec<(u32, u32)>,
    /// `(sample_count, delta)`.
    pub stts: Vec<(u32, u32)>,
    /// `(sample_count, composition_offset)`.
    pub ctts: Vec<(u32, i32)>,
    offsets: Vec<u64>,
}

impl SampleTable {
    /// Resolve every sample's absolute offset from the chunk tables.
    pub fn build(&mut self) -> Result<(), ReadError> {
        if self.stsc.is_empty() && !self.sizes.is_empty() {
            return Err(ReadError::malformed("empty stsc"));
        }
        let mut offsets = Vec::with_capacity(self.sizes.len());
        let mut entry = 0usize;
        let mut sample = 0usize;
        for (chunk, &chunk_offset) in self.chunk_offsets.iter().enumerate() {
            let chunk_no = chunk as u32 + 1;
            while entry + 1 < self.stsc.len() && self.stsc[entry + 1].0 <= chunk_no {
                entry += 1;
            }
            let per_chunk = self.stsc[entry].1;
            let mut offset = chunk_offset;
            for _ in 0..per_chunk {
                let Some(&size) = self.sizes.get(sample) else {
                    break;
                };
                offsets.push(offset);
                offset = offset
                    .checked_add(u64::from(size))
                    .ok_or_else(|| ReadError::malformed("sample offset overflows"))?;
                sample += 1;
            }
        }
        if offsets.len() < self.sizes.len() {
            tracing::warn!(
                mapped = offsets.len(),
                samples = self.sizes.len(),
                "sample table maps fewer samples than stsz lists"
            );
            self.sizes.truncate(offsets.len());
        }
        self.offsets = offsets;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// `(offset, size)` of sample `i`.
    pub fn sample(&self, i: usize) -> Option<(u64, u32)> {
        Some((*self.offsets.get(i)?, *self.sizes.get(i)?))
    }

    /// Decode time of sample `i`: the running sum of `count * delta` over `stts`.
    pub fn decode_time(&self, i: usize) -> u64 {
        let mut left = i as u64;
        let mut time = 0u64;
        for &(count, delta) in &self.stts {
            let n = left.min(count as u64);
            time += n * delta as u64;
            left -= n;
            if left == 0 {
                break;
            }
        }
        time
    }

    pub fn composition_offset(&self, i: usize) -> i64 {
        let mut left = i as u64;
        for &(count, offset) in &self.ctts {
            if left < count as u64 {
                return offset as i64;
            }
            left -= count as u64;
        }
        0
    }

    /// Presentation time of sample `i` (decode time plus composition offset).
    pub fn presentation_time(&self, i: usize) -> u64 {
        (self.decode_time(i) as i64 + self.composition_offset(i)).max(0) as u64
    }

    /// Index of the sample whose decode interval contains `time`.
    pub fn sample_at_time(&self, time: u64) -> usize {
        let mut index = 0u64;
        let mut start = 0u64;
        for &(count, delta) in &self.stts {
            let span = count as u64 * delta as u64;
            if delta > 0 && time < start + span {
                return (index + (time - start) / delta as u64) as usize;
            }
            start += span;
            index += count as u64;
        }
        (index as usize).min(self.len())
    }

    pub fn total_time(&self) -> u64 {
        self.stts.iter().map(|&(c, d)| c as u64 * d as u64).sum()
    }
}

#[derive(Debug, Default)]
struct Track {
    handler: [u8; 4],
    timescale: u32,
    codec: Option<CodecId>,
    channels: u16,
    sample_rate: u32,
    config: Option<Vec<u8>>,
    table: SampleTable,
}

fn full_box<'a>(payload: &'a [u8], what: &'static str) -> Result<ByteCursor<'a>, ReadError> {
    let mut cur = ByteCursor::new(payload, what);
    cur.skip(4)?;
    Ok(cur)
}

fn parse_mdhd(payload: &[u8]) -> Result<u32, ReadError> {
    let mut cur = ByteCursor::new(payload, "mdhd");
    let version = cur.u8()?;
    cur.skip(3)?;
    cur.skip(if version == 1 { 16 } else { 8 })?;
    cur.be_u32()
}

/// Read a descriptor length: up to four 7-bit groups.
fn descriptor_len(cur: &mut ByteCursor<'_>) -> Result<usize, ReadError> {
    let mut len = 0usize;
    for _ in 0..4 {
        let b = cur.u8()?;
        len = len << 7 | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(len)
}

/// Walk `esds` descriptors to the object type and decoder-specific info.
pub fn parse_esds(payload: &[u8]) -> Result<(u8, Option<Vec<u8>>), ReadError> {
    let mut cur = full_box(payload, "esds")?;
    if cur.u8()? != 0x03 {
        return Err(ReadError::malformed("esds without ES descriptor"));
    }
    descriptor_len(&mut cur)?;
    cur.skip(2)?;
    let flags = cur.u8()?;
    if flags & 0x80 != 0 {
        cur.skip(2)?;
    }
    if flags & 0x40 != 0 {
        let url_len = cur.u8()? as usize;
        cur.skip(url_len)?;
    }
    if flags & 0x20 != 0 {
        cur.skip(2)?;
    }
    if cur.u8()? != 0x04 {
        return Err(ReadError::malformed("esds without decoder config descriptor"));
    }
    let config_len = descriptor_len(&mut cur)?;
    let config = cur.take(config_len)?;
    let mut inner = ByteCursor::new(config, "decoder config descriptor");
    let object_type = inner.u8()?;
    inner.skip(12)?;
    let mut specific = None;
    if inner.remaining() > 0 && inner.u8()? == 0x05 {
        let len = descriptor_len(&mut inner)?;
        specific = Some(inner.take(len)?.to_vec());
    }
    Ok((object_type, specific))
}

fn parse_stsd(payload: &[u8], track: &mut Track) -> Result<(), ReadError> {
    let mut cur = full_box(payload, "stsd")?;
    let _count = cur.be_u32()?;
    let entries = cur.rest();
    let Some(entry) = AtomIter::new(entries).next().transpose()? else {
        return Ok(());
    };
    let codec = match &entry.kind {
        b"mp4a" => None,
        b".mp3" => Some(CodecId::Mp3),
        other => {
            tracing::debug!(entry = %String::from_utf8_lossy(other), "unsupported sample entry");
            return Ok(());
        }
    };
    let mut cur = ByteCursor::new(entry.payload, "audio sample entry");
    cur.skip(8)?;
    let version = cur.be_u16()?;
    cur.skip(6)?;
    track.channels = cur.be_u16()?;
    cur.skip(6)?;
    track.sample_rate = cur.be_u32()? >> 16;
    match version {
        1 => cur.skip(16)?,
        2 => cur.skip(36)?,
        _ => {}
    }
    track.codec = codec;
    if let Some(esds) = find(cur.rest(), b"esds")? {
        let (object_type, config) = parse_esds(esds)?;
        track.codec = match object_type {
            0x40 | 0x66 | 0x67 | 0x68 => Some(CodecId::Aac),
            0x69 | 0x6B => Some(CodecId::Mp3),
            other => {
                tracing::debug!(object_type = other, "unsupported esds object type");
                None
            }
        };
        track.config = config;
    }
    Ok(())
}

fn parse_stbl(payload: &[u8], track: &mut Track) -> Result<(), ReadError> {
    for atom in AtomIter::new(payload) {
        let atom = atom?;
        match &atom.kind {
            b"stsd" => parse_stsd(atom.payload, track)?,
            b"stsz" => {
                let mut cur = full_box(atom.payload, "stsz")?;
                let fixed = cur.be_u32()?;
                let count = cur.be_u32()? as usize;
                if count > MAX_TABLE_SAMPLES || (fixed == 0 && count > cur.remaining() / 4) {
                    return Err(ReadError::malformed(format!("stsz lists {count} samples")));
                }
                track.table.sizes = if fixed != 0 {
                    vec![fixed; count]
                } else {
                    (0..count).map(|_| cur.be_u32()).collect::<Result<_, _>>()?
                };
            }
            b"stco" => {
                let mut cur = full_box(atom.payload, "stco")?;
                let count = cur.be_u32()? as usize;
                track.table.chunk_offsets = (0..count)
                    .map(|_| cur.be_u32().map(u64::from))
                    .collect::<Result<_, _>>()?;
            }
            b"co64" => {
                let mut cur = full_box(atom.payload, "co64")?;
                let count = cur.be_u32()? as usize;
                track.table.chunk_offsets = (0..count).map(|_| cur.be_u64()).collect::<Result<_, _>>()?;
            }
            b"stsc" => {
                let mut cur = full_box(atom.payload, "stsc")?;
                let count = cur.be_u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(1 << 16));
                for _ in 0..count {
                    let first = cur.be_u32()?;
                    let per_chunk = cur.be_u32()?;
                    cur.skip(4)?;
                    entries.push((first, per_chunk));
                }
                track.table.stsc = entries;
            }
            b"stts" => {
                let mut cur = full_box(atom.payload, "stts")?;
                let count = cur.be_u32()? as usize;
                track.table.stts = (0..count)
                    .map(|_| Ok((cur.be_u32()?, cur.be_u32()?)))
                    .collect::<Result<_, ReadError>>()?;
            }
            b"ctts" => {
                let mut cur = full_box(atom.payload, "ctts")?;
                let count = cur.be_u32()? as usize;
                track.table.ctts = (0..count)
                    .map(|_| Ok((cur.be_u32()?, cur.be_u32()? as i32)))
                    .collect::<Result<_, ReadError>>()?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_trak(payload: &[u8]) -> Result<Track, ReadError> {
    let mut track = Track::default();
    let Some(mdia) = find(payload, b"mdia")? else {
        return Ok(track);
    };
    for atom in AtomIter::new(mdia) {
        let atom = atom?;
        match &atom.kind {
            b"mdhd" => track.timescale = parse_mdhd(atom.payload)?,
            b"hdlr" => {
                let mut cur = full_box(atom.payload, "hdlr")?;
                cur.skip(4)?;
                let h = cur.take(4)?;
                track.handler = [h[0], h[1], h[2], h[3]];
            }
            b"minf" => {
                if let Some(stbl) = find(atom.payload, b"stbl")? {
                    parse_stbl(stbl, &mut track)?;
                }
            }
            _ => {}
        }
    }
    Ok(track)
}

/// Value of an `ilst` item's `data` child.
fn ilst_data(item: &[u8]) -> Result<Option<String>, ReadError> {
    let Some(data) = find(item, b"data")? else {
        return Ok(None);
    };
    Ok(data.get(8..).map(|v| String::from_utf8_lossy(v).into_owned()))
}

fn parse_ilst(payload: &[u8], tags: &mut TagSummary) -> Result<(), ReadError> {
    for atom in AtomIter::new(payload) {
        let atom = atom?;
        let key = match &atom.kind {
            b"\xA9nam" => "TITLE".to_string(),
            b"\xA9ART" => "ARTIST".to_string(),
            b"\xA9alb" => "ALBUM".to_string(),
            b"----" => {
                let name = find(atom.payload, b"name")?
                    .and_then(|n| n.get(4..))
                    .map(|n| String::from_utf8_lossy(n).into_owned());
                match name {
                    Some(n) => n,
                    None => continue,
                }
            }
            _ => continue,
        };
        if let Some(value) = ilst_data(atom.payload)? {
            tags.apply_field(&key, &value);
        }
    }
    Ok(())
}

fn parse_udta(payload: &[u8], tags: &mut TagSummary) -> Result<(), ReadError> {
    let Some(meta) = find(payload, b"meta")? else {
        return Ok(());
    };
    if let Some(ilst) = find(meta_children(meta), b"ilst")? {
        parse_ilst(ilst, tags)?;
    }
    Ok(())
}

/// Everything the reader needs from `moov`.
#[derive(Debug, Default)]
struct Movie {
    track: Option<Track>,
    tags: TagSummary,
}

fn parse_moov(payload: &[u8]) -> Result<Movie, ReadError> {
    let mut movie = Movie::default();
    for atom in AtomIter::new(payload) {
        let atom = atom?;
        match &atom.kind {
            b"trak" if movie.track.is_none() => {
                let track = parse_trak(atom.payload)?;
                if &track.handler == b"soun" && track.codec.is_some() {
                    movie.track = Some(track);
                }
            }
            b"udta" => parse_udta(atom.payload, &mut movie.tags)?,
            b"meta" => {
                if let Some(ilst) = find(meta_children(atom.payload), b"ilst")? {
                    parse_ilst(ilst, &mut movie.tags)?;
                }
            }
            _ => {}
        }
    }
    Ok(movie)
}

pub struct Mp4Reader {
    track: Option<Track>,
    next: usize,
    trimmed_length: Option<u64>,
}

impl Default for Mp4Reader {
    fn default() -> Self {
        Self::new()
    }
}

impl Mp4Reader {
    pub fn new() -> Self {
        Self {
            track: None,
            next: 0,
            trimmed_length: None,
        }
    }

    /// Media time to output samples.
    fn to_samples(track: &Track, time: u64) -> u64 {
        if track.timescale == 0 || track.timescale == track.sample_rate {
            return time;
        }
        (time as u128 * track.sample_rate as u128 / track.timescale as u128) as u64
    }
}

impl Demux for Mp4Reader {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let movie = loop {
            let start = src.position();
            let mut head = [0u8; 16];
            if src.fill(&mut head[..8])? < 8 {
                return Err(ReadError::malformed("no moov atom"));
            }
            let kind = [head[4], head[5], head[6], head[7]];
            let (header_len, size) = match be_u32(&head) {
                0 => match src.size() {
                    Some(total) if &kind == b"moov" => (8, total - start),
                    _ => return Err(ReadError::malformed("no moov atom")),
                },
                1 => {
                    if src.fill(&mut head[8..])? < 8 {
                        return Err(ReadError::malformed("truncated 64-bit atom size"));
                    }
                    (16, be_u64(&head[8..]))
                }
                n => (8, n as u64),
            };
            if size < header_len {
                return Err(ReadError::malformed("atom smaller than its header"));
            }
            let payload_len = size - header_len;
            match &kind {
                b"moov" => {
                    if payload_len > MAX_MOOV {
                        return Err(ReadError::unsupported(format!("moov of {payload_len} bytes")));
                    }
                    let mut payload = vec![0u8; payload_len as usize];
                    if src.fill(&mut payload)? < payload.len() {
                        return Err(ReadError::malformed("truncated moov"));
                    }
                    break parse_moov(&payload)?;
                }
                b"mdat" if src.is_serial() => {
                    return Err(ReadError::unsupported("mdat before moov on a serial stream"));
                }
                _ => {
                    src.skip(payload_len)?;
                }
            }
        };

        let Some(mut track) = movie.track else {
            return Err(ReadError::unsupported("no supported audio track"));
        };
        track.table.build()?;
        if track.sample_rate == 0 {
            track.sample_rate = track.timescale;
        }
        let codec = track.codec.unwrap_or(CodecId::Aac);
        let raw_length = Self::to_samples(&track, track.table.total_time());
        let mut configure = ConfigureEvent::new(
            codec,
            AudioFormat::new(SampleEncoding::Encoded, track.sample_rate, track.channels),
        );
        configure.extra_data = track.config.clone();
        if let [(_, delta)] = track.table.stts.as_slice() {
            configure.frame_samples = Some(Self::to_samples(&track, *delta as u64) as u32);
        }
        configure.replay_gain = movie.tags.replay_gain;
        self.trimmed_length = match movie.tags.gapless {
            Some((g, total)) => {
                configure.gapless = g;
                Some(total.unwrap_or_else(|| raw_length.saturating_sub(g.padding_start + g.padding_end)))
            }
            None => Some(raw_length).filter(|&l| l > 0),
        };
        configure.stream_length = self.trimmed_length;
        tracing::info!(
            codec = codec.label(),
            sample_rate = track.sample_rate,
            channels = track.channels,
            samples = track.table.len(),
            length = ?self.trimmed_length,
            "mp4 stream"
        );
        self.track = Some(track);
        self.next = 0;
        Ok(Some(StreamHeader {
            configure,
            meta: movie.tags.meta,
        }))
    }

    fn process(&mut self, src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        let Some(track) = &self.track else {
            return Err(ReadError::malformed("mp4 reader used before init"));
        };
        let Some((offset, size)) = track.table.sample(self.next) else {
            return finish(packet);
        };
        let size = size as usize;
        if size > packet.capacity() {
            return Err(PacketError::CapacityExceeded {
                needed: size,
                capacity: packet.capacity(),
            }
            .into());
        }
        if src.position() != offset {
            src.seek(offset)?;
        }
        let got = src.fill(&mut packet.spare_mut()[..size])?;
        if got < size {
            tracing::debug!(sample = self.next, offset, "truncated final mp4 sample");
            return finish(packet);
        }
        packet.set_len(size);
        packet.stream_position = Self::to_samples(track, track.table.presentation_time(self.next));
        packet.stream_length = self.trimmed_length;
        self.next += 1;
        Ok(ProcessStatus::Ok)
    }

    fn seek(&mut self, _src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        let Some(track) = &self.track else {
            return Ok(false);
        };
        let time = if track.sample_rate == 0 || track.timescale == track.sample_rate {
            sample
        } else {
            (sample as u128 * track.timescale as u128 / track.sample_rate as u128) as u64
        };
        self.next = track.table.sample_at_time(time).min(track.table.len());
        tracing::debug!(sample, index = self.next, "mp4 seek");
        Ok(true)
    }

    fn can_seek(&self, src: &dyn ByteSource) -> bool {
        !src.is_serial() && self.track.as_ref().is_some_and(|t| !t.table.is_empty())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    pub fn atom(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    pub fn full(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(body);
        atom(kind, &payload)
    }

    pub fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    pub fn esds(asc: &[u8]) -> Vec<u8> {
        let mut dsi = vec![0x05, asc.len() as u8];
        dsi.extend_from_slice(asc);
        let mut dcd = vec![0x04, (13 + dsi.len()) as u8, 0x40, 0x15];
        dcd.extend_from_slice(&[0u8; 11]);
        dcd.extend_from_slice(&dsi);
        let mut es = vec![0x03, (3 + dcd.len()) as u8, 0, 1, 0];
        es.extend_from_slice(&dcd);
        full(b"esds", &es)
    }

    pub fn mp4a(channels: u16, rate: u32, asc: &[u8]) -> Vec<u8> {
        let mut p = vec![0u8; 6];
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&[0u8; 8]);
        p.extend_from_slice(&channels.to_be_bytes());
        p.extend_from_slice(&16u16.to_be_bytes());
        p.extend_from_slice(&[0u8; 4]);
        p.extend_from_slice(&(rate << 16).to_be_bytes());
        p.extend(esds(asc));
        atom(b"mp4a", &p)
    }

    /// `moov` for one AAC track; sample offsets are `mdat_payload + cumulative size`, in
    /// chunks of `per_chunk` samples.
    pub fn moov(sizes: &[u32], per_chunk: u32, mdat_payload: u32, ilst: Option<Vec<u8>>) -> Vec<u8> {
        let asc = [0x12, 0x10];
        let mut stsd_body = u32s(&[1]);
        stsd_body.extend(mp4a(2, 44_100, &asc));
        let stsd = full(b"stsd", &stsd_body);
        let stts = full(b"stts", &u32s(&[1, sizes.len() as u32, 1024]));
        let stsc = full(b"stsc", &u32s(&[1, 1, per_chunk, 1]));
        let mut stsz_body = u32s(&[0, sizes.len() as u32]);
        stsz_body.extend(u32s(sizes));
        let stsz = full(b"stsz", &stsz_body);
        let mut offsets = Vec::new();
        let mut at = mdat_payload;
        for chunk in sizes.chunks(per_chunk as usize) {
            offsets.push(at);
            at += chunk.iter().sum::<u32>();
        }
        let mut stco_body = u32s(&[offsets.len() as u32]);
        stco_body.extend(u32s(&offsets));
        let stco = full(b"stco", &stco_body);
        let stbl = atom(b"stbl", &[stsd, stts, stsc, stsz, stco].concat());
        let minf = atom(b"minf", &stbl);
        let mdhd = full(b"mdhd", &u32s(&[0, 0, 44_100, sizes.len() as u32 * 1024, 0]));
        let mut hdlr_body = u32s(&[0]);
        hdlr_body.extend_from_slice(b"soun");
        hdlr_body.extend_from_slice(&[0u8; 13]);
        let hdlr = full(b"hdlr", &hdlr_body);
        let mdia = atom(b"mdia", &[mdhd, hdlr, minf].concat());
        let trak = atom(b"trak", &mdia);
        let mut children = trak;
        if let Some(ilst) = ilst {
            let meta = full(b"meta", &ilst);
            children.extend(atom(b"udta", &meta));
        }
        atom(b"moov", &children)
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::packet::PacketPool;
    use crate::source::{MemorySource, ReplaySource};

    #[test]
    fn oversized_stsz_count_is_rejected() {
        let mut track = Track::default();
        let stsz = full(b"stsz", &u32s(&[1, 0x0800_0000]));
        assert!(matches!(parse_stbl(&stsz, &mut track), Err(ReadError::Malformed(_))));
        assert!(track.table.sizes.is_empty());

        let truncated = full(b"stsz", &u32s(&[0, 1000, 4, 4]));
        assert!(matches!(parse_stbl(&truncated, &mut track), Err(ReadError::Malformed(_))));
    }

    #[test]
    fn chunk_offset_overflow_is_malformed() {
        let mut table = SampleTable {
            sizes: vec![4, 4],
            chunk_offsets: vec![u64::MAX - 2],
            stsc: vec![(1, 2)],
            ..SampleTable::default()
        };
        assert!(matches!(table.build(), Err(ReadError::Malformed(_))));
    }

    fn data_item(kind: &[u8; 4], value: &str) -> Vec<u8> {
        let mut body = u32s(&[1, 0]);
        body.extend_from_slice(value.as_bytes());
        atom(kind, &atom(b"data", &body))
    }

    fn freeform(name: &str, value: &str) -> Vec<u8> {
        let mut mean = vec![0u8; 4];
        mean.extend_from_slice(b"com.apple.iTunes");
        let mut name_body = vec![0u8; 4];
        name_body.extend_from_slice(name.as_bytes());
        let mut data_body = u32s(&[1, 0]);
        data_body.extend_from_slice(value.as_bytes());
        atom(
            b"----",
            &[atom(b"mean", &mean), atom(b"name", &name_body), atom(b"data", &data_body)].concat(),
        )
    }

    /// `ftyp`, `moov`, then `mdat` holding samples filled with their index.
    fn file(sizes: &[u32], per_chunk: u32, ilst: Option<Vec<u8>>) -> Vec<u8> {
        let ftyp = atom(b"ftyp", b"M4A \0\0\0\0");
        let probe = moov(sizes, per_chunk, 0, ilst.clone());
        let mdat_payload = (ftyp.len() + probe.len() + 8) as u32;
        let moov = moov(sizes, per_chunk, mdat_payload, ilst);
        let body: Vec<u8> = sizes
            .iter()
            .enumerate()
            .flat_map(|(i, &s)| std::iter::repeat_n(i as u8, s as usize))
            .collect();
        [ftyp, moov, atom(b"mdat", &body)].concat()
    }

    #[test]
    fn atom_iter_handles_large_size_escape() {
        let mut big = 1u32.to_be_bytes().to_vec();
        big.extend_from_slice(b"free");
        big.extend_from_slice(&20u64.to_be_bytes());
        big.extend_from_slice(&[9, 9, 9, 9]);
        big.extend(atom(b"skip", b"ab"));
        let atoms: Vec<_> = AtomIter::new(&big).collect::<Result<_, _>>().unwrap();
        assert_eq!(atoms.len(), 2);
        assert_eq!(&atoms[0].kind, b"free");
        assert_eq!(atoms[0].payload, &[9, 9, 9, 9]);
        assert_eq!(atoms[1].payload, b"ab");
    }

    #[test]
    fn sample_table_maps_offsets_and_times() {
        let mut table = SampleTable {
            sizes: vec![10, 20, 30, 40, 50],
            chunk_offsets: vec![1000, 5000],
            stsc: vec![(1, 3), (2, 2)],
            stts: vec![(3, 1024), (2, 512)],
            ..SampleTable::default()
        };
        table.build().unwrap();
        assert_eq!(table.sample(0), Some((1000, 10)));
        assert_eq!(table.sample(2), Some((1030, 30)));
        assert_eq!(table.sample(3), Some((5000, 40)));
        assert_eq!(table.sample(4), Some((5040, 50)));
        assert_eq!(table.decode_time(4), 3 * 1024 + 512);
        assert_eq!(table.sample_at_time(1023), 0);
        assert_eq!(table.sample_at_time(3 * 1024 + 600), 4);
        assert_eq!(table.total_time(), 4096);
    }

    #[test]
    fn esds_yields_audio_specific_config() {
        let payload = esds(&[0x12, 0x10]);
        let (object_type, asc) = parse_esds(&payload[8..]).unwrap();
        assert_eq!(object_type, 0x40);
        assert_eq!(asc, Some(vec![0x12, 0x10]));
    }

    #[test]
    fn reads_samples_metadata_and_gapless() {
        let ilst = atom(
            b"ilst",
            &[
                data_item(b"\xA9nam", "Mp4 Title"),
                data_item(b"\xA9ART", "Mp4 Artist"),
                freeform("iTunSMPB", " 00000000 00000840 000001C0 0000000000001C40"),
            ]
            .concat(),
        );
        let sizes = [100u32, 120, 90, 110, 105, 95, 130];
        let data = file(&sizes, 3, Some(ilst));
        let mut src = MemorySource::new(data.clone());
        let mut reader = Mp4Reader::new();
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.codec, CodecId::Aac);
        assert_eq!(header.configure.extra_data, Some(vec![0x12, 0x10]));
        assert_eq!(header.configure.format.sample_rate, 44_100);
        assert_eq!(header.configure.format.channels, 2);
        assert_eq!(header.configure.frame_samples, Some(1024));
        assert_eq!(header.configure.gapless.padding_start, 0x840);
        assert_eq!(header.configure.stream_length, Some(0x1C40));
        assert_eq!(header.meta.title.as_deref(), Some("Mp4 Title"));
        assert_eq!(header.meta.artist.as_deref(), Some("Mp4 Artist"));

        let pool = PacketPool::new("test", 2, 4096, Interrupt::new());
        for (i, &size) in sizes.iter().enumerate() {
            let mut p = pool.acquire().unwrap();
            assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
            assert_eq!(p.len(), size as usize);
            assert!(p.data().iter().all(|&b| b == i as u8));
            assert_eq!(p.stream_position, i as u64 * 1024);
        }
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Done);

        assert!(reader.seek(&mut src, 4 * 1024 + 10).unwrap());
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
        assert_eq!(p.stream_position, 4 * 1024);
        assert!(p.data().iter().all(|&b| b == 4));
    }

    #[test]
    fn serial_source_with_moov_first() {
        let sizes = [50u32, 60, 70];
        let data = file(&sizes, 2, None);
        let mut src = ReplaySource::new(Box::new(MemorySource::serial(data)));
        let mut reader = Mp4Reader::new();
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.stream_length, Some(3 * 1024));
        assert!(!reader.can_seek(&src));
        let pool = PacketPool::new("test", 2, 4096, Interrupt::new());
        for &size in &sizes {
            let mut p = pool.acquire().unwrap();
            assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
            assert_eq!(p.len(), size as usize);
        }
    }

    #[test]
    fn mdat_first_on_serial_is_unsupported() {
        let sizes = [10u32];
        let mut data = atom(b"mdat", &[0u8; 10]);
        data.extend(moov(&sizes, 1, 8, None));
        let mut src = ReplaySource::new(Box::new(MemorySource::serial(data)));
        assert!(matches!(Mp4Reader::new().init(&mut src), Err(ReadError::Unsupported(_))));
    }
}
