//! RIFF/RF64 WAVE with PCM or IEEE-float samples.

use audio_stream_types::{AudioFormat, ChannelPosition, CodecId, SampleEncoding};

use super::tags::TagSummary;
use super::{finish, le_u32, le_u64, ByteCursor, Demux, ProcessStatus, ReadError, StreamHeader};
use crate::event::ConfigureEvent;
use crate::packet::Packet;
use crate::source::{ByteSource, ByteSourceExt};

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_FLOAT: u16 = 0x0003;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

/// Frames handed out per packet.
const MAX_PACKET_FRAMES: usize = 4096;

/// Chunks larger than this are never buffered (only `fmt `, `ds64` and `LIST` are).
const MAX_HEADER_CHUNK: u32 = 1 << 20;

/// Parsed `fmt ` chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct WaveFormat {
    pub format: AudioFormat,
    pub block_align: u16,
}

/// Map a channel mask to positions, in the order samples are interleaved.
pub fn positions_from_mask(mask: u32, channels: u16) -> Vec<ChannelPosition> {
    if mask == 0 {
        return ChannelPosition::default_layout(channels);
    }
    let mut positions: Vec<ChannelPosition> = ChannelPosition::MASK_ORDER
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1 << bit) != 0)
        .map(|(_, &p)| p)
        .take(channels as usize)
        .collect();
    positions.resize(channels as usize, ChannelPosition::Unknown);
    positions
}

fn encoding_for(tag: u16, bits: u16) -> Result<SampleEncoding, ReadError> {
    match (tag, bits) {
        (FORMAT_PCM, 8) => Ok(SampleEncoding::U8),
        (FORMAT_PCM, 16) => Ok(SampleEncoding::S16Le),
        (FORMAT_PCM, 24) => Ok(SampleEncoding::S24Le),
        (FORMAT_PCM, 32) => Ok(SampleEncoding::S32Le),
        (FORMAT_FLOAT, 32) => Ok(SampleEncoding::F32Le),
        (FORMAT_FLOAT, 64) => Ok(SampleEncoding::F64Le),
        _ => Err(ReadError::unsupported(format!("wave format {tag:#06x} with {bits} bits"))),
    }
}

impl WaveFormat {
    pub fn parse(body: &[u8]) -> Result<Self, ReadError> {
        let mut cur = ByteCursor::new(body, "fmt chunk");
        let mut tag = cur.le_u16()?;
        let channels = cur.le_u16()?;
        let sample_rate = cur.le_u32()?;
        let _byte_rate = cur.le_u32()?;
        let block_align = cur.le_u16()?;
        let bits = cur.le_u16()?;
        let mut valid_bits = bits;
        let mut mask = 0;
        if tag == FORMAT_EXTENSIBLE {
            let extra = cur.le_u16()?;
            if extra < 22 {
                return Err(ReadError::malformed("short WAVE_FORMAT_EXTENSIBLE"));
            }
            valid_bits = cur.le_u16()?;
            mask = cur.le_u32()?;
            // The first two GUID bytes carry the plain format tag.
            let guid = cur.take(16)?;
            tag = u16::from_le_bytes([guid[0], guid[1]]);
        }
        if channels == 0 || sample_rate == 0 {
            return Err(ReadError::malformed("wave format without channels or rate"));
        }
        let encoding = encoding_for(tag, bits)?;
        let frame_bytes = encoding.bytes_per_sample().unwrap_or(1) * channels as usize;
        if block_align as usize != frame_bytes {
            return Err(ReadError::unsupported(format!(
                "block align {block_align} for {channels} x {bits}-bit samples"
            )));
        }
        let mut format = AudioFormat::new(encoding, sample_rate, channels).with_bits(valid_bits.min(bits));
        format.positions = positions_from_mask(mask, channels);
        Ok(Self { format, block_align })
    }
}

/// `LIST`/`INFO` subchunks mapped to title/artist/album.
fn parse_info(body: &[u8], tags: &mut TagSummary) {
    if body.len() < 4 || &body[..4] != b"INFO" {
        return;
    }
    let mut at = 4;
    while at + 8 <= body.len() {
        let id = &body[at..at + 4];
        let len = le_u32(&body[at + 4..]) as usize;
        let start = at + 8;
        let Some(value) = body.get(start..start + len) else {
            break;
        };
        let text = String::from_utf8_lossy(value);
        match id {
            b"INAM" => tags.apply_field("TITLE", &text),
            b"IART" => tags.apply_field("ARTIST", &text),
            b"IPRD" => tags.apply_field("ALBUM", &text),
            _ => {}
        }
        at = start + len + (len & 1);
    }
}

pub struct WavReader {
    frame_bytes: usize,
    data_start: u64,
    data_end: Option<u64>,
    length: Option<u64>,
    position: u64,
}

impl Default for WavReader {
    fn default() -> Self {
        Self::new()
    }
}

impl WavReader {
    pub fn new() -> Self {
        Self {
            frame_bytes: 0,
            data_start: 0,
            data_end: None,
            length: None,
            position: 0,
        }
    }
}

impl Demux for WavReader {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let mut riff = [0u8; 12];
        if src.fill(&mut riff)? < 12 {
            return Err(ReadError::malformed("short RIFF header"));
        }
        let rf64 = match &riff[..4] {
            b"RIFF" => false,
            b"RF64" => true,
            _ => return Err(ReadError::malformed("missing RIFF marker")),
        };
        if &riff[8..12] != b"WAVE" {
            return Err(ReadError::malformed("RIFF form is not WAVE"));
        }

        let mut wave = None;
        let mut tags = TagSummary::default();
        let mut ds64_data = None;
        let data_len = loop {
            let mut head = [0u8; 8];
            if src.fill(&mut head)? < 8 {
                return Err(ReadError::malformed("no data chunk"));
            }
            let size = le_u32(&head[4..]);
            match &head[..4] {
                b"data" => {
                    break match (size, ds64_data) {
                        (0xFFFF_FFFF, Some(len)) if rf64 => Some(len),
                        // Streaming writers leave the size unset.
                        (0 | 0xFFFF_FFFF, _) => None,
                        (n, _) => Some(n as u64),
                    };
                }
                id @ (b"fmt " | b"ds64" | b"LIST") => {
                    if size > MAX_HEADER_CHUNK {
                        return Err(ReadError::malformed("oversized header chunk"));
                    }
                    let mut body = vec![0u8; size as usize + (size as usize & 1)];
                    if src.fill(&mut body)? < size as usize {
                        return Err(ReadError::malformed("truncated header chunk"));
                    }
                    body.truncate(size as usize);
                    match id {
                        b"fmt " => wave = Some(WaveFormat::parse(&body)?),
                        b"ds64" => {
                            if body.len() < 16 {
                                return Err(ReadError::malformed("short ds64 chunk"));
                            }
                            ds64_data = Some(le_u64(&body[8..]));
                        }
                        _ => parse_info(&body, &mut tags),
                    }
                }
                _ => {
                    let padded = size as u64 + (size as u64 & 1);
                    if src.skip(padded)? < padded {
                        return Err(ReadError::malformed("no data chunk"));
                    }
                }
            }
        };
        let Some(wave) = wave else {
            return Err(ReadError::malformed("data chunk before fmt chunk"));
        };

        self.frame_bytes = wave.block_align as usize;
        self.data_start = src.position();
        self.data_end = data_len
            .map(|len| self.data_start + len)
            .map(|end| src.size().map_or(end, |size| end.min(size)));
        self.length = self.data_end.map(|end| (end - self.data_start) / self.frame_bytes as u64);
        self.position = 0;

        let mut configure = ConfigureEvent::new(CodecId::Pcm, wave.format.clone());
        configure.stream_length = self.length;
        tracing::info!(
            encoding = ?wave.format.encoding,
            sample_rate = wave.format.sample_rate,
            channels = wave.format.channels,
            rf64,
            length = ?self.length,
            "wave stream"
        );
        Ok(Some(StreamHeader {
            configure,
            meta: tags.meta,
        }))
    }

    fn process(&mut self, src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        if self.frame_bytes == 0 {
            return Err(ReadError::malformed("wave reader used before init"));
        }
        let mut frames = (packet.capacity() / self.frame_bytes).min(MAX_PACKET_FRAMES);
        if let Some(length) = self.length {
            frames = frames.min(length.saturating_sub(self.position) as usize);
        }
        if frames == 0 {
            return finish(packet);
        }
        let want = frames * self.frame_bytes;
        let got = src.fill(&mut packet.spare_mut()[..want])?;
        let whole = got / self.frame_bytes;
        if whole == 0 {
            return finish(packet);
        }
        packet.set_len(whole * self.frame_bytes);
        packet.stream_position = self.position;
        packet.stream_length = self.length;
        self.position += whole as u64;
        if got < want {
            tracing::debug!(frames = whole, "wave data ended early");
            packet.set_end_of_stream();
            return Ok(ProcessStatus::Done);
        }
        Ok(ProcessStatus::Ok)
    }

    fn seek(&mut self, src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        let sample = match self.length {
            Some(len) => sample.min(len),
            None => sample,
        };
        src.seek(self.data_start.saturating_add(sample.saturating_mul(self.frame_bytes as u64)))?;
        self.position = sample;
        Ok(true)
    }

    fn can_seek(&self, src: &dyn ByteSource) -> bool {
        !src.is_serial() && self.frame_bytes > 0
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::interrupt::Interrupt;
    use crate::packet::PacketPool;
    use crate::source::{MemorySource, ReplaySource};
    use ChannelPosition::*;

    #[test]
    fn extensible_six_channel_mask_maps_canonical_order() {
        let fmt = fmt_extensible(6, 48_000, 24, 0x3F, FORMAT_PCM);
        let w = WaveFormat::parse(&fmt).unwrap();
        assert_eq!(w.format.encoding, SampleEncoding::S24Le);
        assert_eq!(w.format.positions, vec![FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight]);
        assert_eq!(w.block_align, 18);
    }

    #[test]
    fn side_channel_mask_and_short_mask() {
        assert_eq!(
            positions_from_mask(0x60F, 6),
            vec![FrontLeft, FrontRight, FrontCenter, Lfe, SideLeft, SideRight]
        );
        assert_eq!(positions_from_mask(0x4, 2), vec![FrontCenter, Unknown]);
        assert_eq!(positions_from_mask(0, 2), vec![FrontLeft, FrontRight]);
    }

    #[test]
    fn extensible_float_subformat() {
        let fmt = fmt_extensible(2, 44_100, 32, 0x3, FORMAT_FLOAT);
        assert_eq!(WaveFormat::parse(&fmt).unwrap().format.encoding, SampleEncoding::F32Le);
    }

    #[test]
    fn rejects_unsupported_formats() {
        let adpcm = fmt_pcm(0x0002, 2, 44_100, 4);
        assert!(matches!(WaveFormat::parse(&adpcm), Err(ReadError::Unsupported(_))));
    }

    #[test]
    fn reads_frames_info_and_seeks() {
        let samples: Vec<u8> = (0..400u16).flat_map(|s| s.to_le_bytes()).collect();
        let mut info = b"INFO".to_vec();
        info.extend(chunk(b"INAM", b"Wave Title\0"));
        info.extend(chunk(b"IART", b"Artist"));
        let file = wave(
            &fmt_pcm(FORMAT_PCM, 2, 8_000, 16),
            &[chunk(b"LIST", &info), chunk(b"junk", b"xyz")],
            &samples,
        );
        let mut src = MemorySource::new(file);
        let mut reader = WavReader::new();
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.codec, CodecId::Pcm);
        assert_eq!(header.configure.format.encoding, SampleEncoding::S16Le);
        assert_eq!(header.configure.stream_length, Some(200));
        assert_eq!(header.meta.title.as_deref(), Some("Wave Title"));
        assert_eq!(header.meta.artist.as_deref(), Some("Artist"));

        let pool = PacketPool::new("test", 2, 512, Interrupt::new());
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
        assert_eq!(p.len(), 512);
        assert_eq!(p.stream_position, 0);
        drop(p);

        assert!(reader.can_seek(&src));
        assert!(reader.seek(&mut src, 150).unwrap());
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Ok);
        assert_eq!(p.stream_position, 150);
        assert_eq!(p.len(), 50 * 4);
        assert_eq!(&p.data()[..2], &300u16.to_le_bytes());
        let mut p = pool.acquire().unwrap();
        assert_eq!(reader.process(&mut src, &mut p).unwrap(), ProcessStatus::Done);
        assert!(p.is_end_of_stream());
    }

    #[test]
    fn rf64_takes_data_size_from_ds64() {
        let data = vec![0u8; 64];
        let mut ds64 = 0u64.to_le_bytes().to_vec();
        ds64.extend_from_slice(&(data.len() as u64).to_le_bytes());
        ds64.extend_from_slice(&16u64.to_le_bytes());
        ds64.extend_from_slice(&0u32.to_le_bytes());
        let mut body = b"WAVE".to_vec();
        body.extend(chunk(b"ds64", &ds64));
        body.extend(chunk(b"fmt ", &fmt_pcm(FORMAT_FLOAT, 1, 48_000, 32)));
        body.extend_from_slice(b"data");
        body.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        body.extend_from_slice(&data);
        let mut file = b"RF64".to_vec();
        file.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        file.extend(body);

        let mut src = MemorySource::new(file);
        let header = WavReader::new().init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.format.encoding, SampleEncoding::F32Le);
        assert_eq!(header.configure.stream_length, Some(16));
    }

    #[test]
    fn serial_stream_with_unset_data_size() {
        let mut file = wave(&fmt_pcm(FORMAT_PCM, 1, 8_000, 8), &[], &[]);
        let len = file.len();
        file[len - 4..].copy_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&[0x80; 101]);
        let mut src = ReplaySource::new(Box::new(MemorySource::serial(file)));
        let mut reader = WavReader::new();
        let header = reader.init(&mut src).unwrap().unwrap();
        assert_eq!(header.configure.stream_length, None);
        assert!(!reader.can_seek(&src));
        let pool = PacketPool::new("test", 1, 64, Interrupt::new());
        let mut total = 0;
        loop {
            let mut p = pool.acquire().unwrap();
            let status = reader.process(&mut src, &mut p).unwrap();
            total += p.len();
            if status == ProcessStatus::Done {
                break;
            }
        }
        assert_eq!(total, 101);
    }
}
