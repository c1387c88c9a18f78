//! Ogg container carrying Vorbis, Opus or FLAC.
//!
//! Only one logical stream is followed: the first beginning-of-stream page whose first
//! packet names a supported codec. `init` consumes that codec's header packets, so
//! [`Demux::process`] only ever hands out audio packets.

use std::collections::VecDeque;

use audio_stream_types::{AudioFormat, CodecId, GaplessInfo, SampleEncoding};

use super::flac::{parse_metadata_block, StreamInfo, BLOCK_STREAMINFO, BLOCK_VORBIS_COMMENT};
use super::sync::scan;
use super::tags::{parse_vorbis_comments, TagSummary};
use super::{be_u16, finish, le_u16, le_u32, le_u64, Demux, ProcessStatus, ReadError, ReaderOptions, StreamHeader};
use crate::event::ConfigureEvent;
use crate::packet::{Packet, PacketError};
use crate::source::{ByteSource, ByteSourceExt};

const HEADER_LEN: usize = 27;
/// Largest possible page: header, 255 lacing values, 255 * 255 body bytes.
const MAX_PAGE: u64 = (HEADER_LEN + 255 + 255 * 255) as u64;
const NO_GRANULE: u64 = u64::MAX;

const FLAG_CONTINUED: u8 = 0x01;
const FLAG_BOS: u8 = 0x02;
const FLAG_EOS: u8 = 0x04;

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 { (r << 1) ^ 0x04C1_1DB7 } else { r << 1 };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

/// Ogg page CRC-32: polynomial 0x04C11DB7, no reflection, zero init.
pub fn crc32(mut crc: u32, data: &[u8]) -> u32 {
    for &b in data {
        crc = (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ b) as usize];
    }
    crc
}

/// One verified page.
#[derive(Clone, Debug)]
pub struct Page {
    pub offset: u64,
    pub flags: u8,
    pub granule: u64,
    pub serial: u32,
    pub sequence: u32,
    pub lacing: Vec<u8>,
    pub body: Vec<u8>,
}

impl Page {
    pub fn len(&self) -> u64 {
        (HEADER_LEN + self.lacing.len() + self.body.len()) as u64
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    pub fn is_bos(&self) -> bool {
        self.flags & FLAG_BOS != 0
    }

    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    pub fn is_continued(&self) -> bool {
        self.flags & FLAG_CONTINUED != 0
    }

    fn crc_ok(head: &[u8; HEADER_LEN], lacing: &[u8], body: &[u8]) -> bool {
        let mut zeroed = *head;
        zeroed[22..26].fill(0);
        let crc = crc32(crc32(crc32(0, &zeroed), lacing), body);
        crc == le_u32(&head[22..])
    }

    fn from_parts(offset: u64, head: &[u8; HEADER_LEN], lacing: Vec<u8>, body: Vec<u8>) -> Self {
        Self {
            offset,
            flags: head[5],
            granule: le_u64(&head[6..]),
            serial: le_u32(&head[14..]),
            sequence: le_u32(&head[18..]),
            lacing,
            body,
        }
    }

    /// Parse a complete page from memory.
    pub fn parse(b: &[u8], offset: u64) -> Option<Self> {
        let head: &[u8; HEADER_LEN] = b.get(..HEADER_LEN)?.try_into().ok()?;
        if &head[..4] != b"OggS" || head[4] != 0 {
            return None;
        }
        let nsegs = head[26] as usize;
        let lacing = b.get(HEADER_LEN..HEADER_LEN + nsegs)?;
        let body_len: usize = lacing.iter().map(|&l| l as usize).sum();
        let body_start = HEADER_LEN + nsegs;
        let body = b.get(body_start..body_start + body_len)?;
        if !Self::crc_ok(head, lacing, body) {
            return None;
        }
        Some(Self::from_parts(offset, head, lacing.to_vec(), body.to_vec()))
    }
}

/// Read the next verified page, resyncing past damaged ones. `None` at end of input.
pub fn read_page(src: &mut dyn ByteSource, max_scan: u64) -> Result<Option<Page>, ReadError> {
    loop {
        let Some(hit) = scan::<(), 4>(src, max_scan, |b| (b == b"OggS").then_some(()))? else {
            return Ok(None);
        };
        let mut head = [0u8; HEADER_LEN];
        head[..4].copy_from_slice(&hit.bytes);
        if src.fill(&mut head[4..])? < HEADER_LEN - 4 {
            return Ok(None);
        }
        if head[4] != 0 {
            src.seek(hit.offset + 1)?;
            continue;
        }
        let mut lacing = vec![0u8; head[26] as usize];
        if src.fill(&mut lacing)? < lacing.len() {
            return Ok(None);
        }
        let mut body = vec![0u8; lacing.iter().map(|&l| l as usize).sum()];
        if src.fill(&mut body)? < body.len() {
            tracing::debug!(offset = hit.offset, "truncated final ogg page");
            return Ok(None);
        }
        if !Page::crc_ok(&head, &lacing, &body) {
            tracing::debug!(offset = hit.offset, "ogg page CRC mismatch");
            src.seek(hit.offset + 1)?;
            continue;
        }
        return Ok(Some(Page::from_parts(hit.offset, &head, lacing, body)));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OggCodec {
    Vorbis,
    Opus,
    Flac,
}

pub struct OggReader {
    options: ReaderOptions,
    serial: Option<u32>,
    codec: Option<OggCodec>,
    /// Header packets consumed so far, and how many the codec needs.
    headers_seen: usize,
    headers_needed: usize,
    ident: Vec<u8>,
    setup: Vec<u8>,
    flac_info: Option<StreamInfo>,
    tags: TagSummary,
    channels: u16,
    sample_rate: u32,
    pre_skip: u64,
    partial: Vec<u8>,
    ready: VecDeque<(Vec<u8>, u64)>,
    prev_granule: u64,
    audio_start: u64,
    trimmed_length: Option<u64>,
    eos: bool,
}

impl OggReader {
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            serial: None,
            codec: None,
            headers_seen: 0,
            headers_needed: 0,
            ident: Vec::new(),
            setup: Vec::new(),
            flac_info: None,
            tags: TagSummary::default(),
            channels: 0,
            sample_rate: 0,
            pre_skip: 0,
            partial: Vec::new(),
            ready: VecDeque::new(),
            prev_granule: 0,
            audio_start: 0,
            trimmed_length: None,
            eos: false,
        }
    }

    fn headers_complete(&self) -> bool {
        self.codec.is_some() && self.headers_seen >= self.headers_needed
    }

    /// Split a page into packets; completed ones queue up with the page's start position.
    fn absorb(&mut self, page: &Page) {
        let mut dropping = page.is_continued() && self.partial.is_empty();
        if !page.is_continued() && !self.partial.is_empty() {
            tracing::debug!(offset = page.offset, "dropping unfinished ogg packet");
            self.partial.clear();
        }
        let position = self.prev_granule;
        let mut at = 0usize;
        for &lace in &page.lacing {
            let chunk = &page.body[at..at + lace as usize];
            at += lace as usize;
            if !dropping {
                self.partial.extend_from_slice(chunk);
            }
            if lace < 255 {
                if !dropping {
                    self.ready.push_back((std::mem::take(&mut self.partial), position));
                }
                dropping = false;
            }
        }
        if page.granule != NO_GRANULE {
            self.prev_granule = page.granule;
        }
        if page.is_eos() {
            self.eos = true;
        }
    }

    /// Feed one header packet through the codec's header sequence.
    fn header_packet(&mut self, data: Vec<u8>) -> Result<(), ReadError> {
        let index = self.headers_seen;
        match (self.codec, index) {
            (None, _) => {
                if data.len() >= 30 && data.starts_with(b"\x01vorbis") {
                    self.codec = Some(OggCodec::Vorbis);
                    self.headers_needed = 3;
                    self.channels = data[11] as u16;
                    self.sample_rate = le_u32(&data[12..]);
                    self.ident = data;
                } else if data.len() >= 19 && data.starts_with(b"OpusHead") {
                    self.codec = Some(OggCodec::Opus);
                    self.headers_needed = 2;
                    self.channels = data[9] as u16;
                    self.pre_skip = le_u16(&data[10..]) as u64;
                    self.sample_rate = 48_000;
                    self.ident = data;
                } else if data.len() >= 13 + 38 && data.starts_with(b"\x7FFLAC") {
                    if &data[9..13] != b"fLaC" {
                        return Err(ReadError::malformed("Ogg FLAC mapping without fLaC marker"));
                    }
                    let (kind, body) = parse_metadata_block(&data[13..])?;
                    if kind != BLOCK_STREAMINFO {
                        return Err(ReadError::malformed("Ogg FLAC mapping without STREAMINFO"));
                    }
                    let info = StreamInfo::parse(body)?;
                    self.codec = Some(OggCodec::Flac);
                    self.headers_needed = 1 + be_u16(&data[7..]) as usize;
                    self.channels = info.channels;
                    self.sample_rate = info.sample_rate;
                    self.flac_info = Some(info);
                } else {
                    return Err(ReadError::unsupported("unknown ogg codec"));
                }
            }
            (Some(OggCodec::Vorbis), 1) => {
                if !data.starts_with(b"\x03vorbis") {
                    return Err(ReadError::malformed("expected vorbis comment header"));
                }
                self.merge_comments(&data[7..]);
            }
            (Some(OggCodec::Vorbis), _) => {
                if !data.starts_with(b"\x05vorbis") {
                    return Err(ReadError::malformed("expected vorbis setup header"));
                }
                self.setup = data;
            }
            (Some(OggCodec::Opus), _) => {
                if !data.starts_with(b"OpusTags") {
                    return Err(ReadError::malformed("expected OpusTags header"));
                }
                self.merge_comments(&data[8..]);
            }
            (Some(OggCodec::Flac), _) => {
                let (kind, body) = parse_metadata_block(&data)?;
                if kind == BLOCK_VORBIS_COMMENT {
                    self.merge_comments(body);
                }
            }
        }
        self.headers_seen += 1;
        Ok(())
    }

    fn merge_comments(&mut self, block: &[u8]) {
        match parse_vorbis_comments(block) {
            Ok(found) => self.tags.merge(found),
            Err(err) => tracing::warn!(error = %err, "ignoring bad ogg comment header"),
        }
    }

    /// Granule of the last page of our stream, scanning back from the end.
    fn last_granule(&mut self, src: &mut dyn ByteSource) -> Result<Option<u64>, ReadError> {
        let (Some(size), Some(serial)) = (src.size(), self.serial) else {
            return Ok(None);
        };
        let restore = src.position();
        let mut end = size;
        let mut found = None;
        while found.is_none() && end > self.audio_start && size - end < 16 * MAX_PAGE {
            let start = end.saturating_sub(MAX_PAGE).max(self.audio_start);
            let stop = (end + MAX_PAGE).min(size);
            let mut chunk = vec![0u8; (stop - start) as usize];
            src.seek(start)?;
            let got = src.fill(&mut chunk)?;
            chunk.truncate(got);
            for i in 0..chunk.len().saturating_sub(3) {
                if start + i as u64 >= end || &chunk[i..i + 4] != b"OggS" {
                    continue;
                }
                if let Some(page) = Page::parse(&chunk[i..], start + i as u64) {
                    if page.serial == serial && page.granule != NO_GRANULE {
                        found = Some(page.granule);
                    }
                }
            }
            end = start;
        }
        src.seek(restore)?;
        Ok(found)
    }

    fn next_granule_page(&mut self, src: &mut dyn ByteSource, offset: u64, limit: u64) -> Result<Option<Page>, ReadError> {
        src.seek(offset)?;
        while let Some(page) = read_page(src, self.options.max_sync_scan)? {
            if page.offset >= limit {
                return Ok(None);
            }
            if Some(page.serial) == self.serial && page.granule != NO_GRANULE {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    fn configure(&self) -> Result<ConfigureEvent, ReadError> {
        let (codec, extra) = match self.codec {
            Some(OggCodec::Vorbis) => {
                let mut extra = self.ident.clone();
                extra.extend_from_slice(&self.setup);
                (CodecId::Vorbis, extra)
            }
            Some(OggCodec::Opus) => (CodecId::Opus, self.ident.clone()),
            Some(OggCodec::Flac) => {
                let info = self.flac_info.as_ref().map(|i| i.raw.clone()).unwrap_or_default();
                (CodecId::Flac, info)
            }
            None => return Err(ReadError::malformed("ogg stream without codec headers")),
        };
        let mut format = AudioFormat::new(SampleEncoding::Encoded, self.sample_rate, self.channels);
        if let Some(info) = &self.flac_info {
            format = format.with_bits(info.bits_per_sample);
        }
        let mut ev = ConfigureEvent::new(codec, format);
        ev.extra_data = Some(extra);
        ev.stream_length = self.trimmed_length;
        ev.replay_gain = self.tags.replay_gain;
        ev.gapless = GaplessInfo {
            padding_start: self.pre_skip,
            padding_end: 0,
        };
        Ok(ev)
    }
}

impl Demux for OggReader {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let max_scan = self.options.max_sync_scan;
        while !self.headers_complete() {
            if let Some((data, _)) = self.ready.pop_front() {
                match self.header_packet(data) {
                    Err(ReadError::Unsupported(msg)) if self.headers_seen == 0 => {
                        tracing::debug!(serial = ?self.serial, %msg, "skipping logical stream");
                        self.serial = None;
                        self.ready.clear();
                        self.partial.clear();
                    }
                    other => other?,
                }
                continue;
            }
            let Some(page) = read_page(src, max_scan)? else {
                return Err(ReadError::malformed("ogg stream ended before codec headers"));
            };
            match self.serial {
                None if page.is_bos() => self.serial = Some(page.serial),
                Some(serial) if serial == page.serial => {}
                _ => continue,
            }
            self.absorb(&page);
            self.audio_start = page.end();
        }
        if self.codec == Some(OggCodec::Flac) && self.trimmed_length.is_none() {
            self.trimmed_length = self.flac_info.as_ref().map(|i| i.total_samples).filter(|&t| t > 0);
        }
        if !src.is_serial() {
            if let Some(last) = self.last_granule(src)? {
                self.trimmed_length = Some(last.saturating_sub(self.pre_skip));
            }
        }
        let configure = self.configure()?;
        tracing::info!(
            codec = configure.codec.label(),
            serial = ?self.serial,
            sample_rate = self.sample_rate,
            channels = self.channels,
            length = ?self.trimmed_length,
            "ogg stream"
        );
        Ok(Some(StreamHeader {
            configure,
            meta: self.tags.meta.clone(),
        }))
    }

    fn process(&mut self, src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        loop {
            if let Some((data, position)) = self.ready.pop_front() {
                if data.len() > packet.capacity() {
                    return Err(PacketError::CapacityExceeded {
                        needed: data.len(),
                        capacity: packet.capacity(),
                    }
                    .into());
                }
                packet.extend_from_slice(&data)?;
                packet.stream_position = position;
                packet.stream_length = self.trimmed_length;
                return Ok(ProcessStatus::Ok);
            }
            if self.eos {
                return finish(packet);
            }
            let Some(page) = read_page(src, self.options.max_sync_scan)? else {
                self.eos = true;
                continue;
            };
            if Some(page.serial) == self.serial {
                self.absorb(&page);
            }
        }
    }

    fn seek(&mut self, src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        let Some(size) = src.size() else {
            return Ok(false);
        };
        let target = match self.codec {
            Some(OggCodec::Opus) => sample.saturating_sub(self.options.opus_preroll_samples),
            _ => sample,
        };
        let (mut lo, mut hi) = (self.audio_start, size);
        let mut best: Option<(u64, u64)> = None;
        for _ in 0..self.options.seek_bisect_iterations {
            if hi.saturating_sub(lo) <= 2 * MAX_PAGE {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            match self.next_granule_page(src, mid, hi)? {
                Some(page) if page.granule < target => {
                    lo = page.end();
                    best = Some((page.end(), page.granule));
                }
                _ => hi = mid,
            }
        }
        src.seek(lo)?;
        while let Some(page) = read_page(src, self.options.max_sync_scan)? {
            if Some(page.serial) != self.serial || page.granule == NO_GRANULE {
                continue;
            }
            if page.granule >= target {
                break;
            }
            best = Some((page.end(), page.granule));
        }
        let (resume, granule) = best.unwrap_or((self.audio_start, 0));
        src.seek(resume)?;
        self.prev_granule = granule;
        self.ready.clear();
        self.partial.clear();
        self.eos = false;
        tracing::debug!(sample, target, resume, granule, "ogg seek");
        Ok(true)
    }

    fn can_seek(&self, src: &dyn ByteSource) -> bool {
        !src.is_serial() && self.headers_complete()
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::packet::PacketPool;
    use crate::reader::tags::build_vorbis_comments;
    use crate::source::MemorySource;

    fn comment(prefix: &[u8], fields: &[&str]) -> Vec<u8> {
        let mut p = prefix.to_vec();
        p.extend(build_vorbis_comments(fields));
        p
    }

    fn pool() -> PacketPool {
        PacketPool::new("test", 4, 8192, Interrupt::new())
    }

    fn drain(reader: &mut OggReader, src: &mut dyn ByteSource) -> Vec<(Vec<u8>, u64)> {
        let pool = pool();
        let mut out = Vec::new();
        loop {
            let mut p = pool.acquire().unwrap();
            match reader.process(src, &mut p).unwrap() {
                ProcessStatus::Ok => out.push((p.data().to_vec(), p.stream_position)),
                ProcessStatus::Done => return out,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn crc_matches_reference_page() {
        // Recomputing over a page with its CRC field zeroed yields the stored value.
        let p = page(FLAG_BOS, 0, 7, 0, &[b"hello"], false);
        assert!(Page::parse(&p, 0).is_some());
        let mut bad = p.clone();
        bad[30] ^= 0x20;
        assert!(Page::parse(&bad, 0).is_none());
    }

    #[test]
    fn vorbis_headers_gate_audio() {
        let ident = vorbis_ident(2, 44_100);
        let comments = comment(b"\x03vorbis", &["TITLE=Ogg Song", "ARTIST=Someone"]);
        let setup = b"\x05vorbis-setup-data".to_vec();
        let mut data = page(FLAG_BOS, 0, 42, 0, &[&ident], false);
        data.extend(page(0, 0, 42, 1, &[&comments, &setup], false));
        data.extend(page(0, 2048, 42, 2, &[b"audio-1", b"audio-2"], false));
        data.extend(page(FLAG_EOS, 4096, 42, 3, &[b"audio-3"], false));

        let mut src = MemorySource::new(data);
        let mut reader = OggReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.codec, CodecId::Vorbis);
        assert_eq!(header.configure.format.sample_rate, 44_100);
        assert_eq!(header.configure.format.channels, 2);
        assert_eq!(header.configure.stream_length, Some(4096));
        assert_eq!(header.meta.title.as_deref(), Some("Ogg Song"));
        let mut extra = ident.clone();
        extra.extend_from_slice(&setup);
        assert_eq!(header.configure.extra_data, Some(extra));

        let packets = drain(&mut reader, &mut src);
        let bodies: Vec<&[u8]> = packets.iter().map(|(d, _)| d.as_slice()).collect();
        assert_eq!(bodies, vec![&b"audio-1"[..], &b"audio-2"[..], &b"audio-3"[..]]);
        assert_eq!(packets[2].1, 2048);
    }

    #[test]
    fn out_of_order_vorbis_header_is_rejected() {
        let mut data = page(FLAG_BOS, 0, 1, 0, &[&vorbis_ident(2, 48_000)], false);
        data.extend(page(0, 0, 1, 1, &[b"\x05vorbis-setup"], false));
        let mut src = MemorySource::new(data);
        let mut reader = OggReader::new(ReaderOptions::default());
        assert!(matches!(reader.init(&mut src), Err(ReadError::Malformed(_))));
    }

    #[test]
    fn missing_setup_never_reaches_audio() {
        let mut data = page(FLAG_BOS, 0, 1, 0, &[&vorbis_ident(2, 48_000)], false);
        data.extend(page(0, 0, 1, 1, &[&comment(b"\x03vorbis", &[])], false));
        let mut src = MemorySource::new(data);
        let mut reader = OggReader::new(ReaderOptions::default());
        assert!(reader.init(&mut src).is_err());
    }

    #[test]
    fn serial_adopted_only_from_bos_page() {
        let mut data = page(0, 100, 9, 5, &[b"stray mid-stream page"], false);
        data.extend(page(FLAG_BOS, 0, 3, 0, &[b"unknown codec"], false));
        data.extend(page(FLAG_BOS, 0, 4, 0, &[&opus_head(2, 312)], false));
        data.extend(page(0, 0, 3, 1, &[b"other stream data"], false));
        data.extend(page(0, 0, 4, 1, &[&comment(b"OpusTags", &["ALBUM=Opus Album"])], false));
        data.extend(page(0, 960 + 312, 4, 2, &[b"opus-1"], false));
        data.extend(page(FLAG_EOS, 48_000 + 312, 4, 3, &[b"opus-2"], false));

        let mut src = MemorySource::new(data);
        let mut reader = OggReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.codec, CodecId::Opus);
        assert_eq!(header.configure.format.sample_rate, 48_000);
        assert_eq!(header.configure.gapless.padding_start, 312);
        assert_eq!(header.configure.stream_length, Some(48_000));
        assert_eq!(header.meta.album.as_deref(), Some("Opus Album"));
        let packets = drain(&mut reader, &mut src);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, b"opus-1");
    }

    #[test]
    fn packets_span_pages_and_bad_pages_are_skipped() {
        let big: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let mut data = page(FLAG_BOS, 0, 5, 0, &[&opus_head(1, 0)], false);
        data.extend(page(0, 0, 5, 1, &[&comment(b"OpusTags", &[])], false));
        data.extend(page(0, NO_GRANULE, 5, 2, &[&big[..510]], true));
        data.extend(page(FLAG_CONTINUED, 960, 5, 3, &[&big[510..]], false));
        let mut damaged = page(0, 1920, 5, 4, &[b"lost"], false);
        let last = damaged.len() - 1;
        damaged[last] ^= 0xFF;
        data.extend(damaged);
        data.extend(page(FLAG_EOS, 2880, 5, 5, &[b"tail"], false));

        let mut src = MemorySource::new(data);
        let mut reader = OggReader::new(ReaderOptions::default());
        reader.init(&mut src).unwrap();
        let packets = drain(&mut reader, &mut src);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].0, big);
        assert_eq!(packets[1].0, b"tail");
    }

    #[test]
    fn opus_seek_rewinds_preroll() {
        let mut data = page(FLAG_BOS, 0, 8, 0, &[&opus_head(2, 0)], false);
        data.extend(page(0, 0, 8, 1, &[&comment(b"OpusTags", &[])], false));
        // 400 pages of 960 samples with ~700-byte packets: well over the linear-scan span.
        let payload = vec![0x11u8; 700];
        let pages = 400u32;
        for i in 0..pages {
            let flags = if i + 1 == pages { FLAG_EOS } else { 0 };
            data.extend(page(flags, (i as u64 + 1) * 960, 8, i + 2, &[&payload], false));
        }
        let mut src = MemorySource::new(data);
        let mut reader = OggReader::new(ReaderOptions::default());
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.stream_length, Some(pages as u64 * 960));
        assert!(reader.can_seek(&src));

        let pool = pool();
        for target in [100_000u64, 250_000, 3_000] {
            assert!(reader.seek(&mut src, target).unwrap());
            let mut p = pool.acquire().unwrap();
            assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
            let wanted = target.saturating_sub(3840);
            assert!(p.stream_position <= wanted, "{target}: {}", p.stream_position);
            assert!(wanted - p.stream_position < 960, "{target}: {}", p.stream_position);
        }
    }
}
