//! MPEG-1/2/2.5 audio layers I-III.

use audio_stream_types::{AudioFormat, CodecId, SampleEncoding};

use super::id3::{read_id3v2, scan_trailer};
use super::seek::{bisect_seek, FrameProbe, SeekProbe, SeekRange};
use super::sync::scan;
use super::tags::TagSummary;
use super::vbr::{VbriHeader, XingHeader};
use super::{finish, Demux, ProcessStatus, ReadError, ReaderOptions, StreamHeader};
use crate::event::ConfigureEvent;
use crate::packet::{Packet, PacketError};
use crate::source::{ByteSource, ByteSourceExt};

/// Lookup tables indexed by the packed header fields.
pub mod tables {
    /// kbit/s by `[row][bitrate_index]`; rows: V1L1, V1L2, V1L3, V2L1, V2L2/L3.
    pub const BITRATES: [[u16; 15]; 5] = [
        [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
        [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
        [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
        [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    ];

    /// Hz by `[version_bits][rate_index]`; version bits 0 = 2.5, 1 = reserved, 2 = 2, 3 = 1.
    pub const SAMPLE_RATES: [[u32; 3]; 4] = [
        [11_025, 12_000, 8_000],
        [0, 0, 0],
        [22_050, 24_000, 16_000],
        [44_100, 48_000, 32_000],
    ];

    pub fn bitrate_row(mpeg1: bool, layer: u8) -> usize {
        match (mpeg1, layer) {
            (true, 1) => 0,
            (true, 2) => 1,
            (true, _) => 2,
            (false, 1) => 3,
            (false, _) => 4,
        }
    }
}

/// A validated 4-byte frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MpegHeader {
    raw: u32,
    pub version_bits: u8,
    pub layer: u8,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channels: u16,
}

/// Bits that must stay constant between frames of one stream: sync, version, layer,
/// sample rate.
const FIXED_MASK: u32 = 0xFFFE_0C00;

impl MpegHeader {
    pub fn parse(b: &[u8; 4]) -> Option<Self> {
        let raw = u32::from_be_bytes(*b);
        if raw & 0xFFE0_0000 != 0xFFE0_0000 {
            return None;
        }
        let version_bits = ((raw >> 19) & 0x3) as u8;
        let layer = match (raw >> 17) & 0x3 {
            1 => 3,
            2 => 2,
            3 => 1,
            _ => return None,
        };
        let bitrate_index = ((raw >> 12) & 0xF) as usize;
        let rate_index = ((raw >> 10) & 0x3) as usize;
        let emphasis = raw & 0x3;
        if version_bits == 1 || bitrate_index == 0 || emphasis == 2 {
            return None;
        }
        let mpeg1 = version_bits == 3;
        let kbps = *tables::BITRATES
            .get(tables::bitrate_row(mpeg1, layer))?
            .get(bitrate_index)?;
        let sample_rate = *tables::SAMPLE_RATES.get(version_bits as usize)?.get(rate_index)?;
        if sample_rate == 0 {
            return None;
        }
        Some(Self {
            raw,
            version_bits,
            layer,
            bitrate: kbps as u32 * 1000,
            sample_rate,
            padding: (raw >> 9) & 1 == 1,
            channels: if (raw >> 6) & 0x3 == 3 { 1 } else { 2 },
        })
    }

    pub fn is_mpeg1(&self) -> bool {
        self.version_bits == 3
    }

    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.is_mpeg1()) {
            (1, _) => 384,
            (2, _) | (3, true) => 1152,
            _ => 576,
        }
    }

    /// Whole frame length in bytes, header included.
    pub fn frame_len(&self) -> usize {
        if self.layer == 1 {
            ((12 * self.bitrate / self.sample_rate) as usize + self.padding as usize) * 4
        } else {
            let coeff = self.samples_per_frame() / 8;
            (coeff * self.bitrate / self.sample_rate) as usize + self.padding as usize
        }
    }

    /// Same stream parameters as `other`.
    pub fn matches(&self, other: &MpegHeader) -> bool {
        self.raw & FIXED_MASK == other.raw & FIXED_MASK && self.channels == other.channels
    }

    pub fn codec(&self) -> CodecId {
        match self.layer {
            1 => CodecId::Mp1,
            2 => CodecId::Mp2,
            _ => CodecId::Mp3,
        }
    }
}

/// Longest possible frame (layer II, 384 kbit/s at 32 kHz, padded).
const MAX_FRAME_LEN: usize = 1729;

pub struct MpegReader {
    options: ReaderOptions,
    first: Option<MpegHeader>,
    /// Offset of the first frame, including a Xing/VBRI frame.
    data_start: u64,
    /// Offset of the first frame carrying audio.
    audio_start: u64,
    audio_end: u64,
    xing: Option<XingHeader>,
    vbri: Option<VbriHeader>,
    raw_length: Option<u64>,
    trimmed_length: Option<u64>,
    position: u64,
    frame: Vec<u8>,
}

impl MpegReader {
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            first: None,
            data_start: 0,
            audio_start: 0,
            audio_end: u64::MAX,
            xing: None,
            vbri: None,
            raw_length: None,
            trimmed_length: None,
            position: 0,
            frame: Vec::with_capacity(MAX_FRAME_LEN),
        }
    }

    fn spf(&self) -> u64 {
        self.first.map(|h| h.samples_per_frame() as u64).unwrap_or(1152)
    }

    /// Find a frame whose successor (when present) also validates.
    fn find_first_frame(&mut self, src: &mut dyn ByteSource) -> Result<Option<(u64, MpegHeader)>, ReadError> {
        let max_scan = self.options.max_sync_scan;
        loop {
            let Some(hit) = scan::<MpegHeader, 4>(src, max_scan, MpegHeader::parse)? else {
                return Ok(None);
            };
            let header = hit.value;
            self.frame.clear();
            self.frame.extend_from_slice(&hit.bytes);
            self.frame.resize(header.frame_len(), 0);
            let got = src.fill(&mut self.frame[4..])?;
            if got + 4 < header.frame_len() {
                return Ok(None);
            }
            let mut next = [0u8; 4];
            let got = src.fill(&mut next)?;
            let confirmed = got < 4 || MpegHeader::parse(&next).is_some_and(|n| n.matches(&header));
            if confirmed {
                return Ok(Some((hit.offset, header)));
            }
            tracing::debug!(offset = hit.offset, "rejecting unconfirmed MPEG sync");
            src.seek(hit.offset + 1)?;
        }
    }

    /// Sample number of the frame at `offset`, from the side tables or the average frame size.
    fn sample_at(&self, offset: u64) -> u64 {
        let spf = self.spf();
        if offset <= self.audio_start {
            return 0;
        }
        let raw = if let (Some(xing), Some(total)) = (&self.xing, self.raw_length) {
            match xing.percent_at(offset - self.data_start) {
                Some(p) => (p / 100.0 * total as f64) as u64,
                None => self.linear_sample(offset),
            }
        } else if let Some(vbri) = &self.vbri {
            let rel = offset - self.data_start;
            let mut acc = 0u64;
            let mut frames = 0u64;
            let mut sample = None;
            for &e in &vbri.entries {
                if acc + e as u64 > rel {
                    let frac = (rel - acc) as f64 / e.max(1) as f64;
                    sample = Some(((frames as f64 + frac * vbri.frames_per_entry as f64) * spf as f64) as u64);
                    break;
                }
                acc += e as u64;
                frames += vbri.frames_per_entry as u64;
            }
            sample.unwrap_or(frames * spf)
        } else {
            self.linear_sample(offset)
        };
        raw / spf * spf
    }

    fn linear_sample(&self, offset: u64) -> u64 {
        let Some(h) = self.first else { return 0 };
        let rel = offset.saturating_sub(self.audio_start) as f64;
        let bytes_per_frame = match (self.raw_length, self.audio_end) {
            (Some(total), end) if end != u64::MAX && total > 0 => {
                (end - self.audio_start) as f64 / (total as f64 / self.spf() as f64)
            }
            _ => h.samples_per_frame() as f64 / 8.0 * h.bitrate as f64 / h.sample_rate as f64,
        };
        (rel / bytes_per_frame.max(1.0) * self.spf() as f64) as u64
    }

    fn seek_to_frame(&mut self, src: &mut dyn ByteSource, frame: FrameProbe) -> Result<bool, ReadError> {
        src.seek(frame.offset)?;
        self.position = frame.sample;
        tracing::debug!(offset = frame.offset, sample = frame.sample, "mpeg seek landed");
        Ok(true)
    }
}

impl SeekProbe for MpegReader {
    fn probe(&mut self, src: &mut dyn ByteSource, offset: u64) -> Result<Option<FrameProbe>, ReadError> {
        let Some(first) = self.first else {
            return Ok(None);
        };
        src.seek(offset.max(self.audio_start))?;
        let hit = scan::<MpegHeader, 4>(src, self.options.max_sync_scan, |b| {
            MpegHeader::parse(b).filter(|h| h.matches(&first))
        })?;
        Ok(hit.filter(|h| h.offset < self.audio_end).map(|h| FrameProbe {
            offset: h.offset,
            sample: self.sample_at(h.offset),
            samples: h.value.samples_per_frame() as u64,
            len: h.value.frame_len() as u64,
        }))
    }
}

impl Demux for MpegReader {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let mut tags = read_id3v2(src)?.unwrap_or_default();
        if !src.is_serial() {
            match scan_trailer(src) {
                Ok((end, v1)) => {
                    self.audio_end = end;
                    if let Some(v1) = v1 {
                        tags.merge(v1);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "ignoring unreadable trailing tags"),
            }
        }

        let Some((offset, header)) = self.find_first_frame(src)? else {
            return Err(ReadError::malformed("no MPEG audio frame found"));
        };
        self.first = Some(header);
        self.data_start = offset;
        self.audio_start = offset;
        let spf = header.samples_per_frame() as u64;

        self.xing = XingHeader::parse(&self.frame, header.is_mpeg1(), header.channels == 1);
        if self.xing.is_none() {
            self.vbri = VbriHeader::parse(&self.frame)?;
        }

        let mut gapless = None;
        if let Some(xing) = &self.xing {
            self.audio_start = offset + header.frame_len() as u64;
            self.raw_length = xing.frames.map(|f| f as u64 * spf);
            if let Some(lame) = &xing.lame {
                tracing::debug!(encoder = %lame.encoder, delay = lame.encoder_delay, "LAME tag");
                tags.replay_gain.merge(&lame.replay_gain);
                gapless = Some(lame.gapless());
            }
        } else if let Some(vbri) = &self.vbri {
            self.audio_start = offset + header.frame_len() as u64;
            self.raw_length = Some(vbri.frames as u64 * spf);
        } else if self.audio_end != u64::MAX {
            let bytes = header.samples_per_frame() as f64 / 8.0 * header.bitrate as f64 / header.sample_rate as f64;
            let frames = ((self.audio_end - self.audio_start) as f64 / bytes) as u64;
            self.raw_length = Some(frames * spf);
        }
        src.seek(self.audio_start)?;

        let TagSummary {
            meta,
            replay_gain,
            gapless: tag_gapless,
        } = tags;
        let mut configure = ConfigureEvent::new(
            header.codec(),
            AudioFormat::new(SampleEncoding::Encoded, header.sample_rate, header.channels),
        );
        configure.frame_samples = Some(header.samples_per_frame());
        configure.replay_gain = replay_gain;
        match (gapless, tag_gapless) {
            (Some(g), _) => {
                configure.gapless = g;
                self.trimmed_length = self
                    .raw_length
                    .map(|l| l.saturating_sub(g.padding_start + g.padding_end));
            }
            (None, Some((g, total))) => {
                configure.gapless = g;
                self.trimmed_length = total.or_else(|| {
                    self.raw_length
                        .map(|l| l.saturating_sub(g.padding_start + g.padding_end))
                });
            }
            (None, None) => self.trimmed_length = self.raw_length,
        }
        configure.stream_length = self.trimmed_length;
        tracing::info!(
            codec = configure.codec.label(),
            sample_rate = header.sample_rate,
            channels = header.channels,
            xing = self.xing.is_some(),
            vbri = self.vbri.is_some(),
            length = ?self.trimmed_length,
            "mpeg stream"
        );
        self.position = 0;
        Ok(Some(StreamHeader { configure, meta }))
    }

    fn process(&mut self, src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        let Some(first) = self.first else {
            return Err(ReadError::malformed("mpeg reader used before init"));
        };
        if src.position() >= self.audio_end {
            return finish(packet);
        }
        let hit = scan::<MpegHeader, 4>(src, self.options.max_sync_scan, |b| {
            MpegHeader::parse(b).filter(|h| h.matches(&first))
        })?;
        let Some(hit) = hit.filter(|h| h.offset < self.audio_end) else {
            return finish(packet);
        };
        let len = hit.value.frame_len();
        if len > packet.capacity() {
            return Err(PacketError::CapacityExceeded {
                needed: len,
                capacity: packet.capacity(),
            }
            .into());
        }
        packet.extend_from_slice(&hit.bytes)?;
        let got = src.fill(&mut packet.spare_mut()[..len - 4])?;
        if got + 4 < len {
            tracing::debug!(offset = hit.offset, len, got, "truncated final frame");
            packet.clear();
            return finish(packet);
        }
        packet.set_len(len);
        packet.stream_position = self.position;
        packet.stream_length = self.trimmed_length;
        self.position += hit.value.samples_per_frame() as u64;
        Ok(ProcessStatus::Ok)
    }

    fn seek(&mut self, src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        let spf = self.spf();
        let Some(total) = self.raw_length.filter(|&t| t > 0) else {
            return Ok(false);
        };
        let sample = sample.min(total.saturating_sub(1));

        if let Some(xing) = self.xing.clone().filter(|x| x.toc.is_some() && x.bytes.is_some()) {
            let percent = sample as f64 * 100.0 / total as f64;
            if let Some(rel) = xing.seek_offset(percent) {
                if let Some(frame) = self.probe(src, self.data_start + rel)? {
                    return self.seek_to_frame(src, frame);
                }
            }
        }

        if let Some(vbri) = self.vbri.clone() {
            let (rel, first_frame) = vbri.seek_offset(sample / spf);
            let mut at = self.data_start + rel;
            let mut frame_no = first_frame;
            let target_frame = sample / spf;
            let first = self.first;
            src.seek(at.max(self.audio_start))?;
            while frame_no < target_frame {
                let hit = scan::<MpegHeader, 4>(src, self.options.max_sync_scan, |b| {
                    MpegHeader::parse(b).filter(|h| first.is_some_and(|f| h.matches(&f)))
                })?;
                let Some(hit) = hit else { break };
                at = hit.offset + hit.value.frame_len() as u64;
                src.seek(at)?;
                frame_no += 1;
            }
            return self.seek_to_frame(
                src,
                FrameProbe {
                    offset: at.max(self.audio_start),
                    sample: frame_no * spf,
                    samples: spf,
                    len: 0,
                },
            );
        }

        let range = SeekRange::whole(
            self.audio_start,
            self.audio_end.min(src.size().unwrap_or(u64::MAX)),
            total,
        );
        let iterations = self.options.seek_bisect_iterations;
        match bisect_seek(self, src, range, sample, iterations)? {
            Some(frame) => self.seek_to_frame(src, frame),
            None => Ok(false),
        }
    }

    fn can_seek(&self, src: &dyn ByteSource) -> bool {
        !src.is_serial() && self.first.is_some() && self.raw_length.is_some()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::super::vbr::identity_toc;

    /// MPEG-1 layer III, 128 kbit/s, 44.1 kHz, stereo: 417-byte frames of 1152 samples.
    pub const HEADER: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];
    pub const FRAME_LEN: usize = 417;

    pub fn audio_frame(fill: u8) -> Vec<u8> {
        let mut f = HEADER.to_vec();
        f.resize(FRAME_LEN, fill);
        f
    }

    /// Xing frame with frame count, byte count, TOC and quality; optional LAME block.
    pub fn xing_frame(frames: u32, bytes: u32, lame: Option<(u16, u16)>) -> Vec<u8> {
        let mut f = HEADER.to_vec();
        f.resize(36, 0);
        f.extend_from_slice(b"Xing");
        f.extend_from_slice(&15u32.to_be_bytes());
        f.extend_from_slice(&frames.to_be_bytes());
        f.extend_from_slice(&bytes.to_be_bytes());
        f.extend_from_slice(&identity_toc());
        f.resize(156, 0);
        if let Some((delay, padding)) = lame {
            let mut tag = [0u8; 36];
            tag[..9].copy_from_slice(b"LAME3.100");
            let packed = (delay as u32) << 12 | padding as u32;
            tag[21] = (packed >> 16) as u8;
            tag[22] = (packed >> 8) as u8;
            tag[23] = packed as u8;
            f.extend_from_slice(&tag);
        }
        f.resize(FRAME_LEN, 0);
        f
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::packet::PacketPool;
    use crate::source::{MemorySource, ReplaySource};

    fn pool() -> PacketPool {
        PacketPool::new("test", 4, 4096, Interrupt::new())
    }

    fn xing_stream(lame: Option<(u16, u16)>) -> Vec<u8> {
        let mut data = xing_frame(3, 4 * FRAME_LEN as u32, lame);
        for i in 0..3 {
            data.extend_from_slice(&audio_frame(i + 1));
        }
        data
    }

    #[test]
    fn header_tables() {
        let h = MpegHeader::parse(&HEADER).unwrap();
        assert_eq!(h.bitrate, 128_000);
        assert_eq!(h.sample_rate, 44_100);
        assert_eq!(h.frame_len(), 417);
        assert_eq!(h.samples_per_frame(), 1152);
        assert_eq!(h.codec(), CodecId::Mp3);
        // reserved version, bad bitrate index, reserved sample rate
        assert!(MpegHeader::parse(&[0xFF, 0xEB, 0x90, 0x00]).is_none());
        assert!(MpegHeader::parse(&[0xFF, 0xFB, 0xF0, 0x00]).is_none());
        assert!(MpegHeader::parse(&[0xFF, 0xFB, 0x9C, 0x00]).is_none());
        // MPEG-2 layer III 64k 22.05k mono: 576 samples, 72*64000/22050 = 208
        let h2 = MpegHeader::parse(&[0xFF, 0xF3, 0x80, 0xC0]).unwrap();
        assert_eq!(h2.samples_per_frame(), 576);
        assert_eq!(h2.channels, 1);
        assert_eq!(h2.frame_len(), 208);
    }

    #[test]
    fn xing_stream_reports_length_and_frames() {
        let mut src = MemorySource::new(xing_stream(None));
        let mut reader = MpegReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.codec, CodecId::Mp3);
        assert_eq!(header.configure.stream_length, Some(3 * 1152));
        assert_eq!(header.configure.frame_samples, Some(1152));

        let pool = pool();
        let mut positions = Vec::new();
        loop {
            let mut p = pool.acquire().unwrap();
            match reader.process(&mut src, &mut p).unwrap() {
                ProcessStatus::Ok => {
                    assert_eq!(p.len(), FRAME_LEN);
                    positions.push(p.stream_position);
                }
                ProcessStatus::Done => {
                    assert!(p.is_end_of_stream());
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(positions, vec![0, 1152, 2304]);
    }

    #[test]
    fn xing_identity_toc_seek_to_half() {
        let data = xing_stream(None);
        let mut src = MemorySource::new(data);
        let mut reader = MpegReader::new(ReaderOptions::default());
        reader.init(&mut src).unwrap();
        let total = 3 * 1152u64;
        assert!(reader.seek(&mut src, total / 2).unwrap());

        let expected_offset = (identity_toc_50() / 256.0 * (4 * FRAME_LEN) as f64) as u64;
        assert!(src.position().abs_diff(expected_offset) <= FRAME_LEN as u64);

        let pool = pool();
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
        assert!(p.stream_position.abs_diff(total / 2) <= 1152, "{}", p.stream_position);
    }

    fn identity_toc_50() -> f64 {
        super::super::vbr::identity_toc()[50] as f64
    }

    #[test]
    fn lame_tag_trims_reported_length() {
        let mut src = MemorySource::new(xing_stream(Some((576, 1200))));
        let mut reader = MpegReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        let g = header.configure.gapless;
        assert_eq!(g.padding_start, 576 + 529);
        assert_eq!(g.padding_end, 1200 - 529);
        assert_eq!(
            header.configure.stream_length,
            Some(3 * 1152 - g.padding_start - g.padding_end)
        );
        assert_eq!(header.configure.raw_length(), Some(3 * 1152));
    }

    #[test]
    fn resyncs_after_garbage_and_cbr_seek() {
        let mut data = vec![0x00, 0xFF, 0x12, 0x34, 0xFF];
        for i in 0..40 {
            data.extend_from_slice(&audio_frame(i));
        }
        let mut src = MemorySource::new(data);
        let mut reader = MpegReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        // Unpadded frames average slightly below the nominal 417.96 bytes.
        let length = header.configure.stream_length.unwrap();
        assert!((39 * 1152..=40 * 1152).contains(&length), "{length}");
        assert!(reader.can_seek(&src));

        let pool = pool();
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
        assert_eq!(p.data()[..4], HEADER);
        drop(p);

        for target in [0u64, 5000, 20_000, 44_000] {
            assert!(reader.seek(&mut src, target).unwrap());
            let mut p = pool.acquire().unwrap();
            assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
            assert!(p.stream_position <= target, "{target} -> {}", p.stream_position);
            assert!(target - p.stream_position < 1152, "{target} -> {}", p.stream_position);
        }
    }

    #[test]
    fn truncated_last_frame_ends_stream() {
        let mut data = audio_frame(1);
        data.extend_from_slice(&audio_frame(2));
        data.extend_from_slice(&audio_frame(3)[..100]);
        let mut src = ReplaySource::new(Box::new(MemorySource::serial(data)));
        let mut reader = MpegReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.stream_length, None);
        let pool = pool();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let mut p = pool.acquire().unwrap();
            statuses.push(reader.process(&mut src, &mut p).unwrap());
        }
        assert_eq!(statuses, vec![ProcessStatus::Ok, ProcessStatus::Ok, ProcessStatus::Done]);
    }
}
