//! Out-of-band events and the messages carried between pipeline stages.

use audio_stream_types::{AudioFormat, CodecId, GaplessInfo, MetaInfo, ReplayGain, StreamEndReason};

use crate::packet::Packet;

/// Everything a decoder needs to open a stream, published once per stream.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigureEvent {
    pub stream_id: u32,
    pub codec: CodecId,
    pub format: AudioFormat,
    /// Codec setup blob (FLAC STREAMINFO, Vorbis ident+setup, AAC AudioSpecificConfig).
    pub extra_data: Option<Vec<u8>>,
    /// Samples per channel in one codec frame, when constant.
    pub frame_samples: Option<u32>,
    /// Trimmed stream length in samples (raw length minus gapless padding), when known.
    pub stream_length: Option<u64>,
    pub replay_gain: ReplayGain,
    pub gapless: GaplessInfo,
}

impl ConfigureEvent {
    pub fn new(codec: CodecId, format: AudioFormat) -> Self {
        Self {
            stream_id: 0,
            codec,
            format,
            extra_data: None,
            frame_samples: None,
            stream_length: None,
            replay_gain: ReplayGain::default(),
            gapless: GaplessInfo::default(),
        }
    }

    /// Raw decoded length (trimmed length plus padding), when known.
    pub fn raw_length(&self) -> Option<u64> {
        self.stream_length
            .map(|l| {
                l.saturating_add(self.gapless.padding_start)
                    .saturating_add(self.gapless.padding_end)
            })
    }
}

/// Stream-level control markers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlEvent {
    /// Terminal marker; posted exactly once per stream.
    End {
        stream_id: u32,
        reason: StreamEndReason,
    },
}

/// Events delivered to the host application.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Configure(ConfigureEvent),
    Meta { stream_id: u32, meta: MetaInfo },
    Control(ControlEvent),
    /// The input was a playlist; the host decides whether to open `uris`.
    Redirect { stream_id: u32, uris: Vec<String> },
}

/// Payload of the queues between stages.
///
/// Configure/Meta travel in-band so the next stage sees them in order with the packets.
#[derive(Debug)]
pub enum StageMessage {
    Configure(ConfigureEvent),
    Meta { stream_id: u32, meta: MetaInfo },
    /// PCM layout of the decoded packets that follow (decode → output only).
    Format { stream_id: u32, format: AudioFormat },
    Packet(Packet),
    /// The producing stage ended the stream without an end-of-stream packet.
    End {
        stream_id: u32,
        epoch: u64,
        reason: StreamEndReason,
    },
}

impl StageMessage {
    pub fn stream_id(&self) -> u32 {
        match self {
            StageMessage::Configure(c) => c.stream_id,
            StageMessage::Meta { stream_id, .. }
            | StageMessage::Format { stream_id, .. }
            | StageMessage::End { stream_id, .. } => *stream_id,
            StageMessage::Packet(p) => p.stream_id,
        }
    }

    /// Flush generation, for messages that carry one.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            StageMessage::Packet(p) => Some(p.epoch),
            StageMessage::End { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }
}
