//! Decoders: encoded packets in, interleaved `f32` out.
//!
//! Compressed codecs go through Symphonia's codec registry with parameters built from the
//! reader's [`ConfigureEvent`]; Opus goes through libopus and PCM is converted natively. Gapless trimming and post-seek
//! discard live here too, in [`GaplessTrimmer`], because both work on decoded frames.

use std::ops::Range;

use audio_stream_types::{AudioFormat, CodecId, SampleEncoding};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{self, CodecParameters, CodecType, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as CodecPacket;

use crate::event::ConfigureEvent;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// One frame could not be decoded; the stream continues.
    #[error("corrupt frame: {0}")]
    Corrupt(String),
    /// No decoder exists for this codec or configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("decoder failure: {0}")]
    Fatal(String),
}

impl DecodeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::Corrupt(_))
    }
}

impl From<SymphoniaError> for DecodeError {
    fn from(err: SymphoniaError) -> Self {
        match err {
            SymphoniaError::DecodeError(msg) => DecodeError::Corrupt(msg.to_string()),
            SymphoniaError::IoError(e) => DecodeError::Corrupt(e.to_string()),
            SymphoniaError::ResetRequired => DecodeError::Corrupt("decoder reset required".into()),
            SymphoniaError::Unsupported(msg) => DecodeError::Unsupported(msg.to_string()),
            other => DecodeError::Fatal(other.to_string()),
        }
    }
}

/// Symphonia codec type for a stream codec, when one is bundled.
pub fn symphonia_codec(codec: CodecId) -> Option<CodecType> {
    match codec {
        CodecId::Mp1 => Some(codecs::CODEC_TYPE_MP1),
        CodecId::Mp2 => Some(codecs::CODEC_TYPE_MP2),
        CodecId::Mp3 => Some(codecs::CODEC_TYPE_MP3),
        CodecId::Flac => Some(codecs::CODEC_TYPE_FLAC),
        CodecId::Vorbis => Some(codecs::CODEC_TYPE_VORBIS),
        CodecId::Aac => Some(codecs::CODEC_TYPE_AAC),
        CodecId::Opus | CodecId::A52 | CodecId::Dca | CodecId::Pcm => None,
    }
}

fn codec_parameters(cfg: &ConfigureEvent, codec: CodecType) -> CodecParameters {
    let mut params = CodecParameters::new();
    params.for_codec(codec);
    if cfg.format.sample_rate > 0 {
        params.with_sample_rate(cfg.format.sample_rate);
    }
    if cfg.format.channels > 0 {
        let mask = (1u64 << cfg.format.channels.min(32)) - 1;
        params.with_channels(codecs_channels(mask as u32));
    }
    if let Some(bits) = cfg.format.bits_per_sample {
        params.with_bits_per_sample(bits as u32);
    }
    if let Some(frames) = cfg.frame_samples {
        params.with_max_frames_per_packet(frames as u64);
    }
    if let Some(extra) = &cfg.extra_data {
        params.with_extra_data(extra.clone().into_boxed_slice());
    }
    params
}

fn codecs_channels(mask: u32) -> symphonia::core::audio::Channels {
    symphonia::core::audio::Channels::from_bits_truncate(mask)
}

/// Wrapper over a Symphonia codec.
pub struct SymphoniaDecoder {
    inner: Box<dyn codecs::Decoder>,
    samples: Option<SampleBuffer<f32>>,
    spec: Option<SignalSpec>,
    packets: u64,
}

impl SymphoniaDecoder {
    fn open(cfg: &ConfigureEvent, codec: CodecType) -> Result<Self, DecodeError> {
        let params = codec_parameters(cfg, codec);
        let inner = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| match e {
                SymphoniaError::Unsupported(msg) => DecodeError::Unsupported(msg.to_string()),
                other => DecodeError::Fatal(other.to_string()),
            })?;
        Ok(Self {
            inner,
            samples: None,
            spec: None,
            packets: 0,
        })
    }

    fn decode(&mut self, data: &[u8], out: &mut Vec<f32>) -> Result<usize, DecodeError> {
        let packet = CodecPacket::new_from_slice(0, self.packets, 0, data);
        self.packets += 1;
        let decoded = match self.inner.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::ResetRequired) => {
                self.inner.reset();
                return Err(DecodeError::Corrupt("decoder reset required".into()));
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            return Ok(0);
        }
        let fits = self
            .samples
            .as_ref()
            .is_some_and(|b| b.capacity() >= frames * spec.channels.count());
        if !fits || self.spec != Some(spec) {
            self.samples = Some(SampleBuffer::new(frames as u64, spec));
        }
        self.spec = Some(spec);
        let Some(buf) = self.samples.as_mut() else {
            return Ok(0);
        };
        buf.copy_interleaved_ref(decoded);
        out.extend_from_slice(buf.samples());
        Ok(frames)
    }
}

/// Longest Opus packet: 120 ms at 48 kHz.
const OPUS_MAX_FRAMES: usize = 5_760;

/// libopus decoder for mono/stereo streams (channel mapping family 0, or family 1 with at most
/// two channels). Output is always 48 kHz.
pub struct OpusDecoder {
    inner: opus::Decoder,
    channels: usize,
    scratch: Vec<f32>,
}

impl OpusDecoder {
    /// Open from the `OpusHead` packet carried in `extra_data`.
    pub fn open(cfg: &ConfigureEvent) -> Result<Self, DecodeError> {
        let head = cfg.extra_data.as_deref().unwrap_or_default();
        let (channels, gain, family) = if head.len() >= 19 && head.starts_with(b"OpusHead") {
            (
                head[9] as usize,
                i16::from_le_bytes([head[16], head[17]]),
                head[18],
            )
        } else {
            (usize::from(cfg.format.channels), 0, 0)
        };
        let layout = match (family, channels) {
            (0 | 1, 1) => opus::Channels::Mono,
            (0 | 1, 2) => opus::Channels::Stereo,
            _ => {
                return Err(DecodeError::Unsupported(format!(
                    "opus mapping family {family} with {channels} channels"
                )));
            }
        };
        let mut inner =
            opus::Decoder::new(48_000, layout).map_err(|e| DecodeError::Fatal(e.to_string()))?;
        if gain != 0 {
            inner
                .set_gain(i32::from(gain))
                .map_err(|e| DecodeError::Fatal(e.to_string()))?;
        }
        Ok(Self {
            inner,
            channels,
            scratch: vec![0.0; OPUS_MAX_FRAMES * channels],
        })
    }

    fn decode(&mut self, data: &[u8], out: &mut Vec<f32>) -> Result<usize, DecodeError> {
        let frames = self
            .inner
            .decode_float(data, &mut self.scratch, false)
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
        out.extend_from_slice(&self.scratch[..frames * self.channels]);
        Ok(frames)
    }

    fn reset(&mut self) {
        if let Err(e) = self.inner.reset_state() {
            tracing::warn!(error = %e, "opus decoder reset failed");
        }
    }
}

/// Native PCM-to-`f32` conversion.
#[derive(Clone, Debug)]
pub struct PcmDecoder {
    encoding: SampleEncoding,
    channels: usize,
}

impl PcmDecoder {
    pub fn new(encoding: SampleEncoding, channels: u16) -> Result<Self, DecodeError> {
        if encoding == SampleEncoding::Encoded || channels == 0 {
            return Err(DecodeError::Unsupported(format!("pcm {encoding:?} x {channels}")));
        }
        Ok(Self {
            encoding,
            channels: channels as usize,
        })
    }

    /// Convert whole frames of `data`; a trailing partial frame is dropped.
    pub fn decode(&self, data: &[u8], out: &mut Vec<f32>) -> usize {
        let Some(width) = self.encoding.bytes_per_sample() else {
            return 0;
        };
        let frames = data.len() / (width * self.channels);
        let data = &data[..frames * width * self.channels];
        let samples = data.chunks_exact(width);
        match self.encoding {
            SampleEncoding::U8 => out.extend(samples.map(|s| (s[0] as f32 - 128.0) / 128.0)),
            SampleEncoding::S16Le => {
                out.extend(samples.map(|s| i16::from_le_bytes([s[0], s[1]]) as f32 / 32_768.0))
            }
            SampleEncoding::S24Le => out.extend(samples.map(|s| {
                let v = i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8;
                v as f32 / 8_388_608.0
            })),
            SampleEncoding::S32Le => out.extend(
                samples.map(|s| i32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f32 / 2_147_483_648.0),
            ),
            SampleEncoding::F32Le => out.extend(samples.map(|s| f32::from_le_bytes([s[0], s[1], s[2], s[3]]))),
            SampleEncoding::F64Le => out.extend(samples.map(|s| {
                f64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]) as f32
            })),
            SampleEncoding::Encoded => return 0,
        }
        frames
    }
}

/// One decoder per stream.
pub enum Decoder {
    Symphonia(SymphoniaDecoder),
    Opus(OpusDecoder),
    Pcm(PcmDecoder),
}

impl Decoder {
    /// Open the decoder named by `cfg.codec`.
    pub fn open(cfg: &ConfigureEvent) -> Result<Self, DecodeError> {
        if cfg.codec == CodecId::Pcm {
            return Ok(Decoder::Pcm(PcmDecoder::new(cfg.format.encoding, cfg.format.channels)?));
        }
        if cfg.codec == CodecId::Opus {
            return Ok(Decoder::Opus(OpusDecoder::open(cfg)?));
        }
        let Some(codec) = symphonia_codec(cfg.codec) else {
            return Err(DecodeError::Unsupported(format!("no decoder for {}", cfg.codec.label())));
        };
        Ok(Decoder::Symphonia(SymphoniaDecoder::open(cfg, codec)?))
    }

    /// Decode one packet, appending interleaved samples to `out`. Returns frames produced.
    pub fn decode(&mut self, data: &[u8], out: &mut Vec<f32>) -> Result<usize, DecodeError> {
        match self {
            Decoder::Symphonia(d) => d.decode(data, out),
            Decoder::Opus(d) => d.decode(data, out),
            Decoder::Pcm(d) => Ok(d.decode(data, out)),
        }
    }

    /// Drop codec state after a flush.
    pub fn reset(&mut self) {
        match self {
            Decoder::Symphonia(d) => d.inner.reset(),
            Decoder::Opus(d) => d.reset(),
            Decoder::Pcm(_) => {}
        }
    }

    /// PCM format of the decoded output, falling back to the configured rate/channels until
    /// the first frame is decoded.
    pub fn output_format(&self, cfg: &ConfigureEvent) -> AudioFormat {
        let (rate, channels) = match self {
            Decoder::Symphonia(SymphoniaDecoder { spec: Some(spec), .. }) => {
                (spec.rate, spec.channels.count() as u16)
            }
            Decoder::Opus(d) => (48_000, d.channels as u16),
            _ => (cfg.format.sample_rate, cfg.format.channels),
        };
        let mut format = AudioFormat::new(SampleEncoding::F32Le, rate, channels);
        if channels == cfg.format.channels {
            format.positions = cfg.format.positions.clone();
        }
        format.bits_per_sample = cfg.format.bits_per_sample;
        format
    }
}

/// Raw-domain window of decoded frames that reach the output.
///
/// Frames before `start` (encoder delay, or a seek target) and from `end` on (end padding)
/// are cut. Positions are raw decoder-output sample numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GaplessTrimmer {
    padding_start: u64,
    start: u64,
    end: Option<u64>,
}

impl GaplessTrimmer {
    pub fn new(cfg: &ConfigureEvent) -> Self {
        let padding_start = cfg.gapless.padding_start;
        Self {
            padding_start,
            start: padding_start,
            end: cfg.raw_length().map(|raw| raw.saturating_sub(cfg.gapless.padding_end)),
        }
    }

    /// Also drop everything before raw position `target` (post-seek discard).
    pub fn discard_until(&mut self, target: u64) {
        self.start = target.max(self.padding_start);
    }

    /// Frame range of a block of `frames` decoded at raw position `position` to keep.
    pub fn keep(&self, position: u64, frames: usize) -> Range<usize> {
        let block_end = position + frames as u64;
        let lo = self.start.clamp(position, block_end);
        let hi = self.end.map_or(block_end, |e| e.clamp(lo, block_end));
        (lo - position) as usize..(hi - position) as usize
    }

    /// Output (trimmed) position for raw position `raw`.
    pub fn trimmed(&self, raw: u64) -> u64 {
        raw.saturating_sub(self.padding_start)
    }

    pub fn padding_start(&self) -> u64 {
        self.padding_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_stream_types::GaplessInfo;

    fn pcm_cfg(encoding: SampleEncoding, channels: u16) -> ConfigureEvent {
        ConfigureEvent::new(CodecId::Pcm, AudioFormat::new(encoding, 44_100, channels))
    }

    #[test]
    fn pcm_conversions() {
        let mut out = Vec::new();
        let d = PcmDecoder::new(SampleEncoding::S16Le, 1).unwrap();
        assert_eq!(d.decode(&[0x00, 0x80, 0xFF, 0x7F, 0x00], &mut out), 2);
        assert_eq!(out[0], -1.0);
        assert!((out[1] - 32_767.0 / 32_768.0).abs() < 1e-6);

        out.clear();
        let d = PcmDecoder::new(SampleEncoding::S24Le, 1).unwrap();
        d.decode(&[0x00, 0x00, 0x80, 0x00, 0x00, 0x40], &mut out);
        assert_eq!(out, vec![-1.0, 0.5]);

        out.clear();
        let d = PcmDecoder::new(SampleEncoding::U8, 2).unwrap();
        d.decode(&[0x80, 0x00, 0xC0], &mut out);
        assert_eq!(out, vec![0.0, -1.0]);

        out.clear();
        let d = PcmDecoder::new(SampleEncoding::F64Le, 1).unwrap();
        d.decode(&0.25f64.to_le_bytes(), &mut out);
        assert_eq!(out, vec![0.25]);
    }

    #[test]
    fn open_picks_backend_by_codec() {
        assert!(matches!(
            Decoder::open(&pcm_cfg(SampleEncoding::F32Le, 2)),
            Ok(Decoder::Pcm(_))
        ));
        for codec in [CodecId::A52, CodecId::Dca] {
            let cfg = ConfigureEvent::new(codec, AudioFormat::new(SampleEncoding::Encoded, 48_000, 2));
            assert!(matches!(Decoder::open(&cfg), Err(DecodeError::Unsupported(_))));
        }
        let mp3 = ConfigureEvent::new(CodecId::Mp3, AudioFormat::new(SampleEncoding::Encoded, 44_100, 2));
        assert!(matches!(Decoder::open(&mp3), Ok(Decoder::Symphonia(_))));
        let opus = ConfigureEvent::new(CodecId::Opus, AudioFormat::new(SampleEncoding::Encoded, 48_000, 2));
        assert!(matches!(Decoder::open(&opus), Ok(Decoder::Opus(_))));
    }

    fn opus_head(channels: u8, pre_skip: u16, family: u8) -> Vec<u8> {
        let mut head = b"OpusHead".to_vec();
        head.push(1);
        head.push(channels);
        head.extend_from_slice(&pre_skip.to_le_bytes());
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(family);
        head
    }

    #[test]
    fn opus_decodes_whole_packets_at_48k() {
        let mut cfg = ConfigureEvent::new(CodecId::Opus, AudioFormat::new(SampleEncoding::Encoded, 48_000, 2));
        cfg.extra_data = Some(opus_head(2, 312, 0));
        let mut d = Decoder::open(&cfg).unwrap();

        let mut enc = opus::Encoder::new(48_000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let mut packet = vec![0u8; 4000];
        let len = enc.encode_float(&[0.0f32; 960 * 2], &mut packet).unwrap();

        let mut out = Vec::new();
        assert_eq!(d.decode(&packet[..len], &mut out).unwrap(), 960);
        assert_eq!(out.len(), 960 * 2);
        let f = d.output_format(&cfg);
        assert_eq!((f.sample_rate, f.channels), (48_000, 2));
        d.reset();
    }

    #[test]
    fn opus_surround_mappings_are_unsupported() {
        let mut cfg = ConfigureEvent::new(CodecId::Opus, AudioFormat::new(SampleEncoding::Encoded, 48_000, 6));
        cfg.extra_data = Some(opus_head(6, 312, 1));
        assert!(matches!(Decoder::open(&cfg), Err(DecodeError::Unsupported(_))));
    }

    #[test]
    fn corrupt_mp3_frame_is_recoverable() {
        let cfg = ConfigureEvent::new(CodecId::Mp3, AudioFormat::new(SampleEncoding::Encoded, 44_100, 2));
        let mut d = Decoder::open(&cfg).unwrap();
        let mut out = Vec::new();
        match d.decode(&[0u8; 16], &mut out) {
            Err(e) => assert!(e.is_recoverable(), "{e}"),
            Ok(frames) => assert_eq!(frames, 0),
        }
    }

    #[test]
    fn output_format_is_interleaved_f32() {
        let cfg = pcm_cfg(SampleEncoding::S24Le, 2);
        let d = Decoder::open(&cfg).unwrap();
        let f = d.output_format(&cfg);
        assert_eq!(f.encoding, SampleEncoding::F32Le);
        assert_eq!(f.channels, 2);
        assert_eq!(f.sample_rate, 44_100);
    }

    #[test]
    fn trimming_removes_exactly_the_padding() {
        for (start, end, frame) in [(1105u64, 300u64, 1152usize), (2112, 0, 1024), (0, 0, 4096), (576, 1151, 1152)] {
            let frames = 12u64;
            let raw = frames * frame as u64;
            let mut cfg = ConfigureEvent::new(CodecId::Mp3, AudioFormat::new(SampleEncoding::Encoded, 44_100, 2));
            cfg.gapless = GaplessInfo {
                padding_start: start,
                padding_end: end,
            };
            cfg.stream_length = Some(raw - start - end);
            let trimmer = GaplessTrimmer::new(&cfg);
            let kept: usize = (0..frames)
                .map(|i| trimmer.keep(i * frame as u64, frame).len())
                .sum();
            assert_eq!(kept as u64, raw - start - end, "padding {start}/{end}");
        }
    }

    #[test]
    fn discard_until_cuts_inside_a_block() {
        let mut cfg = ConfigureEvent::new(CodecId::Mp3, AudioFormat::new(SampleEncoding::Encoded, 44_100, 2));
        cfg.gapless.padding_start = 100;
        let mut t = GaplessTrimmer::new(&cfg);
        assert_eq!(t.keep(0, 1152), 100..1152);
        t.discard_until(5000);
        assert_eq!(t.keep(4608, 1152), 392..1152);
        assert_eq!(t.keep(3456, 1152), 1152..1152);
        assert_eq!(t.trimmed(5000), 4900);
        t.discard_until(10);
        assert_eq!(t.keep(0, 1152), 100..1152);
    }
}
