//! Native FLAC streams.
//!
//! Frames carry no length field: a frame ends where the next valid frame header starts.
//! Headers are validated with their CRC-8 and must advance the sample position, which
//! keeps sync-code lookalikes inside subframe data from splitting a frame.

use audio_stream_types::{AudioFormat, CodecId, SampleEncoding};

use super::id3::read_id3v2;
use super::seek::{bisect_seek, FrameProbe, SeekProbe, SeekRange};
use super::sync::scan;
use super::tags::{parse_vorbis_comments, TagSummary};
use super::{be_u16, be_u24, finish, ByteCursor, Demux, ProcessStatus, ReadError, ReaderOptions, StreamHeader};
use crate::event::ConfigureEvent;
use crate::packet::{Packet, PacketError};
use crate::source::{ByteSource, ByteSourceExt};

/// Longest possible frame header, CRC-8 included.
const MAX_HEADER: usize = 16;
const READ_CHUNK: usize = 8192;
/// Metadata blocks larger than this are skipped unread.
const MAX_METADATA_BLOCK: u32 = 1 << 20;

pub const BLOCK_STREAMINFO: u8 = 0;
pub const BLOCK_SEEKTABLE: u8 = 3;
pub const BLOCK_VORBIS_COMMENT: u8 = 4;

/// CRC-8, polynomial 0x07, as used by FLAC frame headers.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
    }
    crc
}

/// `STREAMINFO` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub min_block: u16,
    pub max_block: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// `0` when unknown.
    pub total_samples: u64,
    /// The raw 34-byte block, handed to the decoder.
    pub raw: Vec<u8>,
}

impl StreamInfo {
    pub fn parse(b: &[u8]) -> Result<Self, ReadError> {
        if b.len() < 34 {
            return Err(ReadError::malformed("STREAMINFO shorter than 34 bytes"));
        }
        let packed = super::be_u64(&b[10..18]);
        let sample_rate = (packed >> 44) as u32;
        if sample_rate == 0 {
            return Err(ReadError::malformed("STREAMINFO sample rate is zero"));
        }
        Ok(Self {
            min_block: be_u16(b),
            max_block: be_u16(&b[2..]),
            sample_rate,
            channels: ((packed >> 41) & 0x7) as u16 + 1,
            bits_per_sample: ((packed >> 36) & 0x1F) as u16 + 1,
            total_samples: packed & 0xF_FFFF_FFFF,
            raw: b[..34].to_vec(),
        })
    }

    fn fixed_block(&self) -> Option<u32> {
        (self.min_block == self.max_block).then_some(self.max_block as u32)
    }
}

/// One `SEEKTABLE` point; offsets are relative to the first frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeekPoint {
    pub sample: u64,
    pub offset: u64,
    pub samples: u16,
}

pub fn parse_seektable(b: &[u8]) -> Vec<SeekPoint> {
    let mut points: Vec<SeekPoint> = b
        .chunks_exact(18)
        .map(|c| SeekPoint {
            sample: super::be_u64(c),
            offset: super::be_u64(&c[8..]),
            samples: be_u16(&c[16..]),
        })
        .filter(|p| p.sample != u64::MAX)
        .collect();
    points.sort_by_key(|p| p.sample);
    points
}

/// Decoded frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub variable: bool,
    /// Frame number (fixed blocking) or first sample number (variable blocking).
    pub number: u64,
    pub block_size: u32,
    pub sample_rate: Option<u32>,
    pub channels: u16,
    pub header_len: usize,
}

impl FrameHeader {
    /// Parse and CRC-check a header at the start of `b`.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < 6 || b[0] != 0xFF || b[1] & 0xFE != 0xF8 {
            return None;
        }
        let variable = b[1] & 1 == 1;
        let bs_code = b[2] >> 4;
        let sr_code = b[2] & 0xF;
        let ch_code = b[3] >> 4;
        let size_code = (b[3] >> 1) & 0x7;
        if bs_code == 0 || sr_code == 0xF || ch_code > 10 || size_code == 3 || b[3] & 1 != 0 {
            return None;
        }
        let mut at = 4;
        let (number, used) = read_utf8_number(&b[at..])?;
        at += used;
        let block_size = match bs_code {
            1 => 192,
            2..=5 => 576 << (bs_code - 2),
            6 => {
                let v = *b.get(at)? as u32 + 1;
                at += 1;
                v
            }
            7 => {
                let v = be_u16(b.get(at..at + 2)?) as u32 + 1;
                at += 2;
                v
            }
            _ => 256 << (bs_code - 8),
        };
        let sample_rate = match sr_code {
            0 => None,
            1 => Some(88_200),
            2 => Some(176_400),
            3 => Some(192_000),
            4 => Some(8_000),
            5 => Some(16_000),
            6 => Some(22_050),
            7 => Some(24_000),
            8 => Some(32_000),
            9 => Some(44_100),
            10 => Some(48_000),
            11 => Some(96_000),
            12 => {
                let v = *b.get(at)? as u32 * 1000;
                at += 1;
                Some(v)
            }
            13 => {
                let v = be_u16(b.get(at..at + 2)?) as u32;
                at += 2;
                Some(v)
            }
            _ => {
                let v = be_u16(b.get(at..at + 2)?) as u32 * 10;
                at += 2;
                Some(v)
            }
        };
        let crc = *b.get(at)?;
        if crc8(&b[..at]) != crc {
            return None;
        }
        Some(Self {
            variable,
            number,
            block_size,
            sample_rate,
            channels: match ch_code {
                0..=7 => ch_code as u16 + 1,
                _ => 2,
            },
            header_len: at + 1,
        })
    }

    pub fn first_sample(&self, fixed_block: Option<u32>) -> u64 {
        if self.variable {
            self.number
        } else {
            self.number * fixed_block.unwrap_or(self.block_size) as u64
        }
    }
}

/// UTF-8 style coded number (up to 36 bits, 7 bytes).
fn read_utf8_number(b: &[u8]) -> Option<(u64, usize)> {
    let first = *b.first()?;
    let (len, mut value) = match first.leading_ones() {
        0 => return Some((first as u64, 1)),
        2..=7 => {
            let n = first.leading_ones() as usize;
            (n, (first as u64) & (0x7F >> n))
        }
        _ => return None,
    };
    for &c in b.get(1..len)? {
        if c & 0xC0 != 0x80 {
            return None;
        }
        value = value << 6 | (c & 0x3F) as u64;
    }
    Some((value, len))
}

#[derive(Default)]
pub struct FlacReader {
    options: ReaderOptions,
    info: Option<StreamInfo>,
    seektable: Vec<SeekPoint>,
    audio_start: u64,
    /// Bytes read ahead from the source, starting at a frame boundary.
    buf: Vec<u8>,
    /// Absolute offset of `buf[0]`.
    buf_offset: u64,
    eof: bool,
    done: bool,
}

impl FlacReader {
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    fn fixed_block(&self) -> Option<u32> {
        self.info.as_ref().and_then(StreamInfo::fixed_block)
    }

    fn total_samples(&self) -> Option<u64> {
        self.info.as_ref().map(|i| i.total_samples).filter(|&t| t > 0)
    }

    fn load(&mut self, src: &mut dyn ByteSource) -> Result<(), ReadError> {
        if self.eof {
            return Ok(());
        }
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let got = src.fill(&mut self.buf[start..])?;
        self.buf.truncate(start + got);
        if got < READ_CHUNK {
            self.eof = true;
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.buf_offset += n as u64;
    }

    fn reset_at(&mut self, offset: u64) {
        self.buf.clear();
        self.buf_offset = offset;
        self.eof = false;
        self.done = false;
    }

    /// Does `next` plausibly follow `current` in this stream?
    fn follows(&self, current: &FrameHeader, next: &FrameHeader) -> bool {
        let fixed = self.fixed_block();
        next.variable == current.variable
            && next.channels == current.channels
            && next.sample_rate == current.sample_rate
            && next.first_sample(fixed) > current.first_sample(fixed)
    }

    /// Position of the next frame header after `current` at `buf[0]`.
    fn find_next(&self, current: &FrameHeader, from: usize) -> (Option<usize>, usize) {
        let mut i = from.max(current.header_len);
        while i + 1 < self.buf.len() {
            if !self.eof && i + MAX_HEADER > self.buf.len() {
                break;
            }
            if self.buf[i] == 0xFF && self.buf[i + 1] & 0xFE == 0xF8 {
                if let Some(next) = FrameHeader::parse(&self.buf[i..]) {
                    if self.follows(current, &next) {
                        return (Some(i), i);
                    }
                }
            }
            i += 1;
        }
        (None, i)
    }
}

impl SeekProbe for FlacReader {
    fn probe(&mut self, src: &mut dyn ByteSource, offset: u64) -> Result<Option<FrameProbe>, ReadError> {
        src.seek(offset.max(self.audio_start))?;
        let fixed = self.fixed_block();
        let (rate, channels) = match &self.info {
            Some(info) => (info.sample_rate, info.channels),
            None => return Ok(None),
        };
        let hit = scan::<FrameHeader, MAX_HEADER>(src, self.options.max_sync_scan, |b| {
            FrameHeader::parse(b)
                .filter(|h| h.channels == channels && h.sample_rate.is_none_or(|r| r == rate))
        })?;
        Ok(hit.map(|h| FrameProbe {
            offset: h.offset,
            sample: h.value.first_sample(fixed),
            samples: h.value.block_size as u64,
            len: 0,
        }))
    }
}

impl Demux for FlacReader {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let mut tags = read_id3v2(src)?.unwrap_or_default();
        let mut magic = [0u8; 4];
        if src.fill(&mut magic)? < 4 || &magic != b"fLaC" {
            return Err(ReadError::malformed("missing fLaC marker"));
        }
        loop {
            let mut head = [0u8; 4];
            if src.fill(&mut head)? < 4 {
                return Err(ReadError::malformed("truncated metadata block header"));
            }
            let last = head[0] & 0x80 != 0;
            let kind = head[0] & 0x7F;
            let len = be_u24(&head[1..]);
            let wanted = matches!(kind, BLOCK_STREAMINFO | BLOCK_SEEKTABLE | BLOCK_VORBIS_COMMENT);
            if !wanted || len > MAX_METADATA_BLOCK {
                src.skip(len as u64)?;
            } else {
                let mut body = vec![0u8; len as usize];
                if src.fill(&mut body)? < body.len() {
                    return Err(ReadError::malformed("truncated metadata block"));
                }
                match kind {
                    BLOCK_STREAMINFO => self.info = Some(StreamInfo::parse(&body)?),
                    BLOCK_SEEKTABLE => self.seektable = parse_seektable(&body),
                    _ => match parse_vorbis_comments(&body) {
                        Ok(found) => tags.merge(found),
                        Err(err) => tracing::warn!(error = %err, "ignoring bad VORBIS_COMMENT"),
                    },
                }
            }
            if last {
                break;
            }
        }
        let Some(info) = self.info.clone() else {
            return Err(ReadError::malformed("FLAC stream without STREAMINFO"));
        };
        self.audio_start = src.position();
        self.reset_at(self.audio_start);

        let TagSummary { meta, replay_gain, .. } = tags;
        let mut configure = ConfigureEvent::new(
            CodecId::Flac,
            AudioFormat::new(SampleEncoding::Encoded, info.sample_rate, info.channels)
                .with_bits(info.bits_per_sample),
        );
        configure.extra_data = Some(info.raw.clone());
        configure.frame_samples = info.fixed_block();
        configure.stream_length = self.total_samples();
        configure.replay_gain = replay_gain;
        tracing::info!(
            sample_rate = info.sample_rate,
            channels = info.channels,
            bits = info.bits_per_sample,
            total = info.total_samples,
            seek_points = self.seektable.len(),
            "flac stream"
        );
        Ok(Some(StreamHeader { configure, meta }))
    }

    fn process(&mut self, src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        if self.done {
            return finish(packet);
        }
        // Align buf[0] with a frame header.
        let header = loop {
            if self.buf.len() < MAX_HEADER {
                self.load(src)?;
            }
            if self.buf.len() < 6 {
                self.done = true;
                return finish(packet);
            }
            if let Some(h) = FrameHeader::parse(&self.buf) {
                break h;
            }
            let skip = self.buf[1..]
                .iter()
                .position(|&b| b == 0xFF)
                .map(|p| p + 1)
                .unwrap_or(self.buf.len());
            tracing::debug!(offset = self.buf_offset, skip, "resynchronizing FLAC frame");
            self.consume(skip);
        };

        let mut from = 0;
        let end = loop {
            let (found, next_from) = self.find_next(&header, from);
            if let Some(end) = found {
                break end;
            }
            if self.eof {
                break self.buf.len();
            }
            if next_from > packet.capacity() {
                return Err(PacketError::CapacityExceeded {
                    needed: next_from,
                    capacity: packet.capacity(),
                }
                .into());
            }
            from = next_from;
            self.load(src)?;
        };

        packet.extend_from_slice(&self.buf[..end])?;
        packet.stream_position = header.first_sample(self.fixed_block());
        packet.stream_length = self.total_samples();
        self.consume(end);
        Ok(ProcessStatus::Ok)
    }

    fn seek(&mut self, src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        let Some(total) = self.total_samples() else {
            return Ok(false);
        };
        let end_byte = src.size().unwrap_or(u64::MAX);
        let target = sample.min(total - 1);

        // Bracket the target with the seektable, else search the whole stream.
        let idx = self.seektable.partition_point(|p| p.sample <= target);
        let lower = idx.checked_sub(1).map(|i| self.seektable[i]);
        let upper = self.seektable.get(idx).copied();
        let range = SeekRange {
            first_byte: lower.map_or(self.audio_start, |p| self.audio_start + p.offset),
            first_sample: lower.map_or(0, |p| p.sample),
            end_byte: upper.map_or(end_byte, |p| self.audio_start + p.offset),
            end_sample: upper.map_or(total, |p| p.sample),
        };
        let iterations = self.options.seek_bisect_iterations;
        let Some(frame) = bisect_seek(self, src, range, target, iterations)? else {
            return Ok(false);
        };
        src.seek(frame.offset)?;
        self.reset_at(frame.offset);
        tracing::debug!(target, landed = frame.sample, offset = frame.offset, "flac seek");
        Ok(true)
    }

    fn can_seek(&self, src: &dyn ByteSource) -> bool {
        !src.is_serial() && self.total_samples().is_some()
    }
}

/// Parse a metadata block sequence from memory (used by Ogg FLAC headers).
pub(crate) fn parse_metadata_block(b: &[u8]) -> Result<(u8, &[u8]), ReadError> {
    let mut cur = ByteCursor::new(b, "FLAC metadata block");
    let kind = cur.u8()? & 0x7F;
    let len = cur.be_u24()? as usize;
    Ok((kind, cur.take(len)?))
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::packet::PacketPool;
    use crate::reader::tags::build_vorbis_comments;
    use crate::source::MemorySource;

    fn block(kind: u8, last: bool, body: &[u8]) -> Vec<u8> {
        let mut out = vec![kind | if last { 0x80 } else { 0 }];
        out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    fn stream(frames: usize, seektable: Option<&[SeekPoint]>) -> (Vec<u8>, Vec<u64>) {
        let mut data = b"fLaC".to_vec();
        let total = frames as u64 * 4096;
        data.extend(block(BLOCK_STREAMINFO, false, &streaminfo(4096, 44_100, 2, total)));
        if let Some(points) = seektable {
            let mut body = Vec::new();
            for p in points {
                body.extend_from_slice(&p.sample.to_be_bytes());
                body.extend_from_slice(&p.offset.to_be_bytes());
                body.extend_from_slice(&p.samples.to_be_bytes());
            }
            data.extend(block(BLOCK_SEEKTABLE, false, &body));
        }
        let comments = build_vorbis_comments(&["TITLE=Flac Song", "REPLAYGAIN_ALBUM_GAIN=-3.5 dB"]);
        data.extend(block(BLOCK_VORBIS_COMMENT, true, &comments));
        let mut offsets = Vec::new();
        for n in 0..frames {
            offsets.push(data.len() as u64);
            data.extend(frame(n as u8, 900 + n * 13));
        }
        (data, offsets)
    }

    #[test]
    fn crc8_check_value() {
        assert_eq!(crc8(b"123456789"), 0xF4);
    }

    #[test]
    fn utf8_numbers() {
        assert_eq!(read_utf8_number(&[0x7F]), Some((0x7F, 1)));
        assert_eq!(read_utf8_number(&[0xC2, 0x80]), Some((0x80, 2)));
        assert_eq!(read_utf8_number(&[0xE0, 0xA0, 0x80]), Some((0x800, 3)));
        assert_eq!(read_utf8_number(&[0xC2, 0x00]), None);
        assert_eq!(read_utf8_number(&[0x80]), None);
    }

    #[test]
    fn header_parses_and_rejects_bad_crc() {
        let f = frame(3, 0);
        let h = FrameHeader::parse(&f).unwrap();
        assert_eq!(h.block_size, 4096);
        assert_eq!(h.sample_rate, Some(44_100));
        assert_eq!(h.channels, 2);
        assert_eq!(h.first_sample(Some(4096)), 3 * 4096);
        let mut bad = f.clone();
        bad[5] ^= 1;
        assert!(FrameHeader::parse(&bad).is_none());
    }

    #[test]
    fn frames_split_at_next_header() {
        let (data, offsets) = stream(5, None);
        let mut src = MemorySource::new(data.clone());
        let mut reader = FlacReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.codec, CodecId::Flac);
        assert_eq!(header.configure.stream_length, Some(5 * 4096));
        assert_eq!(header.configure.extra_data.as_ref().map(Vec::len), Some(34));
        assert_eq!(header.configure.format.bits_per_sample, Some(16));
        assert_eq!(header.meta.title.as_deref(), Some("Flac Song"));
        assert_eq!(header.configure.replay_gain.album_gain, Some(-3.5));

        let pool = PacketPool::new("test", 2, 8192, Interrupt::new());
        for n in 0..5 {
            let mut p = pool.acquire().unwrap();
            assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
            let start = offsets[n] as usize;
            let end = offsets.get(n + 1).map_or(data.len(), |&o| o as usize);
            assert_eq!(p.data(), &data[start..end]);
            assert_eq!(p.stream_position, n as u64 * 4096);
        }
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Done);
    }

    #[test]
    fn seek_with_and_without_seektable() {
        let (plain, offsets) = stream(12, None);
        let audio_start = offsets[0];
        let points: Vec<SeekPoint> = [0usize, 4, 8]
            .iter()
            .map(|&n| SeekPoint {
                sample: n as u64 * 4096,
                offset: offsets[n] - audio_start,
                samples: 4096,
            })
            .collect();
        // Seek point offsets are relative to the first frame, so they carry over.
        let (indexed, _) = stream(12, Some(&points));

        for data in [plain, indexed] {
            let mut src = MemorySource::new(data);
            let mut reader = FlacReader::new(ReaderOptions::default());
            reader.init(&mut src).unwrap();
            let pool = PacketPool::new("test", 2, 8192, Interrupt::new());
            for target in [0u64, 4095, 4096 * 6 + 17, 4096 * 11 + 4000] {
                assert!(reader.seek(&mut src, target).unwrap());
                let mut p = pool.acquire().unwrap();
                assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
                assert_eq!(p.stream_position, target / 4096 * 4096, "target {target}");
            }
        }
    }

    #[test]
    fn missing_marker_is_malformed() {
        let mut src = MemorySource::new(b"OggS....".to_vec());
        let mut reader = FlacReader::new(ReaderOptions::default());
        assert!(matches!(reader.init(&mut src), Err(ReadError::Malformed(_))));
    }
}
