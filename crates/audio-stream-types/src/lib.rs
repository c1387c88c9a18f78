use serde::{Deserialize, Serialize};

/// Reason why a stream ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Reader, decoder, or output error terminated the stream.
    Error,
    /// Playback was stopped by a command or interrupt.
    Stopped,
}

/// How samples are laid out in a PCM buffer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    /// Compressed payload; the codec id says what it is.
    Encoded,
    U8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
    F64Le,
}

impl SampleEncoding {
    /// Bytes per sample for PCM encodings, `None` for compressed payloads.
    pub fn bytes_per_sample(self) -> Option<usize> {
        match self {
            SampleEncoding::Encoded => None,
            SampleEncoding::U8 => Some(1),
            SampleEncoding::S16Le => Some(2),
            SampleEncoding::S24Le => Some(3),
            SampleEncoding::S32Le | SampleEncoding::F32Le => Some(4),
            SampleEncoding::F64Le => Some(8),
        }
    }
}

/// Speaker position of one channel, in canonical (WAVE channel-mask) order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPosition {
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
    TopCenter,
    TopFrontLeft,
    TopFrontCenter,
    TopFrontRight,
    TopBackLeft,
    TopBackCenter,
    TopBackRight,
    Mono,
    Unknown,
}

impl ChannelPosition {
    /// Positions indexed by WAVE_FORMAT_EXTENSIBLE channel-mask bit.
    pub const MASK_ORDER: [ChannelPosition; 18] = [
        ChannelPosition::FrontLeft,
        ChannelPosition::FrontRight,
        ChannelPosition::FrontCenter,
        ChannelPosition::Lfe,
        ChannelPosition::BackLeft,
        ChannelPosition::BackRight,
        ChannelPosition::FrontLeftOfCenter,
        ChannelPosition::FrontRightOfCenter,
        ChannelPosition::BackCenter,
        ChannelPosition::SideLeft,
        ChannelPosition::SideRight,
        ChannelPosition::TopCenter,
        ChannelPosition::TopFrontLeft,
        ChannelPosition::TopFrontCenter,
        ChannelPosition::TopFrontRight,
        ChannelPosition::TopBackLeft,
        ChannelPosition::TopBackCenter,
        ChannelPosition::TopBackRight,
    ];

    /// Default layout for a bare channel count (no explicit mask).
    pub fn default_layout(channels: u16) -> Vec<ChannelPosition> {
        use ChannelPosition::*;
        match channels {
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, FrontCenter],
            4 => vec![FrontLeft, FrontRight, BackLeft, BackRight],
            5 => vec![FrontLeft, FrontRight, FrontCenter, BackLeft, BackRight],
            6 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight],
            8 => vec![
                FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight, SideLeft, SideRight,
            ],
            n => vec![Unknown; n as usize],
        }
    }
}

/// Codec carried by a stream's packets.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CodecId {
    Pcm,
    Mp1,
    Mp2,
    Mp3,
    Flac,
    Vorbis,
    Opus,
    Aac,
    A52,
    Dca,
}

impl CodecId {
    pub fn label(self) -> &'static str {
        match self {
            CodecId::Pcm => "PCM",
            CodecId::Mp1 => "MP1",
            CodecId::Mp2 => "MP2",
            CodecId::Mp3 => "MP3",
            CodecId::Flac => "FLAC",
            CodecId::Vorbis => "VORBIS",
            CodecId::Opus => "OPUS",
            CodecId::Aac => "AAC",
            CodecId::A52 => "A52",
            CodecId::Dca => "DCA",
        }
    }
}

/// Sample format of a stream or of the PCM the decoder produces.
///
/// Immutable once published in a configure event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    /// Source bit depth when known (PCM and lossless codecs).
    pub bits_per_sample: Option<u16>,
    /// One entry per channel, in the order samples are interleaved.
    pub positions: Vec<ChannelPosition>,
}

impl AudioFormat {
    /// Format with the default channel layout for `channels`.
    pub fn new(encoding: SampleEncoding, sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding,
            sample_rate,
            channels,
            bits_per_sample: None,
            positions: ChannelPosition::default_layout(channels),
        }
    }

    pub fn with_bits(mut self, bits: u16) -> Self {
        self.bits_per_sample = Some(bits);
        self
    }

    /// Bytes per interleaved frame for PCM encodings.
    pub fn frame_bytes(&self) -> Option<usize> {
        self.encoding
            .bytes_per_sample()
            .map(|b| b * self.channels as usize)
    }
}

/// ReplayGain values in dB (gain) and linear full-scale (peak).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplayGain {
    pub track_gain: Option<f32>,
    pub track_peak: Option<f32>,
    pub album_gain: Option<f32>,
    pub album_peak: Option<f32>,
}

impl ReplayGain {
    pub fn is_empty(&self) -> bool {
        self.track_gain.is_none()
            && self.track_peak.is_none()
            && self.album_gain.is_none()
            && self.album_peak.is_none()
    }

    /// Fill fields missing here from `other`.
    pub fn merge(&mut self, other: &ReplayGain) {
        self.track_gain = self.track_gain.or(other.track_gain);
        self.track_peak = self.track_peak.or(other.track_peak);
        self.album_gain = self.album_gain.or(other.album_gain);
        self.album_peak = self.album_peak.or(other.album_peak);
    }
}

/// Encoder padding to trim, in samples per channel.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GaplessInfo {
    pub padding_start: u64,
    pub padding_end: u64,
}

/// Title/artist/album published once per stream.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl MetaInfo {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.album.is_none()
    }

    /// Fill fields missing here from `other`.
    pub fn merge(&mut self, other: MetaInfo) {
        if self.title.is_none() {
            self.title = other.title;
        }
        if self.artist.is_none() {
            self.artist = other.artist;
        }
        if self.album.is_none() {
            self.album = other.album;
        }
    }
}

/// Where a stream is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Configuring,
    Streaming,
    EndOfStream,
    #[default]
    Stopped,
}

/// Status snapshot reported by a running engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    /// Stream currently owned by the output stage.
    pub stream_id: Option<u32>,
    pub phase: StreamPhase,
    /// `true` when the output is paused.
    pub paused: bool,
    /// Playback position in samples per channel, after gapless trimming.
    pub position: Option<u64>,
    /// Trimmed stream length in samples per channel, when known.
    pub length: Option<u64>,
    pub codec: Option<CodecId>,
    pub format: Option<AudioFormat>,
    pub meta: Option<MetaInfo>,
    /// Frames handed to the output device.
    pub played_frames: u64,
    /// Frames queued inside the output backend.
    pub buffered_frames: Option<u64>,
    /// Terminal reason of the last finished stream.
    pub end_reason: Option<StreamEndReason>,
}
