use std::sync::{Arc, Mutex};

use audio_stream_types::{
    AudioFormat, CodecId, EngineStatus, MetaInfo, StreamEndReason, StreamPhase,
};

use crate::event::ConfigureEvent;

/// Shared playback status updated by the output stage.
#[derive(Debug, Default)]
pub struct StatusState {
    /// Stream currently owned by the output stage.
    pub stream_id: Option<u32>,
    pub phase: StreamPhase,
    pub paused: bool,
    /// Trimmed position of the next frame handed to the backend.
    pub write_position: Option<u64>,
    /// Trimmed stream length when known.
    pub length: Option<u64>,
    pub codec: Option<CodecId>,
    /// PCM format the backend was configured with.
    pub format: Option<AudioFormat>,
    pub meta: Option<MetaInfo>,
    /// Frames handed to the backend since the engine started.
    pub written_frames: u64,
    /// Frames accepted by the backend but not played yet.
    pub buffered_frames: u64,
    /// Terminal reason of the last finished stream.
    pub end_reason: Option<StreamEndReason>,
}

impl StatusState {
    /// Create a shared, mutex-protected status store.
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Snapshot for the host. Positions subtract what is still buffered in the backend.
    pub fn snapshot(&self) -> EngineStatus {
        EngineStatus {
            stream_id: self.stream_id,
            phase: self.phase,
            paused: self.paused,
            position: self
                .write_position
                .map(|p| p.saturating_sub(self.buffered_frames)),
            length: self.length,
            codec: self.codec,
            format: self.format.clone(),
            meta: self.meta.clone(),
            played_frames: self.written_frames.saturating_sub(self.buffered_frames),
            buffered_frames: self.stream_id.map(|_| self.buffered_frames),
            end_reason: self.end_reason,
        }
    }

    /// A new stream reached the output stage.
    pub fn begin_stream(&mut self, configure: &ConfigureEvent) {
        self.stream_id = Some(configure.stream_id);
        self.phase = StreamPhase::Configuring;
        self.write_position = None;
        self.length = configure.stream_length;
        self.codec = Some(configure.codec);
        self.meta = None;
        self.end_reason = None;
    }

    /// Record the terminal reason and mark the stream finished.
    pub fn end_stream(&mut self, reason: StreamEndReason) {
        self.end_reason = Some(reason);
        self.phase = match reason {
            StreamEndReason::Eof => StreamPhase::EndOfStream,
            StreamEndReason::Error | StreamEndReason::Stopped => StreamPhase::Stopped,
        };
    }

    /// Clear stream-specific fields once nothing is playing.
    pub fn clear_playback(&mut self) {
        self.stream_id = None;
        self.phase = StreamPhase::Stopped;
        self.write_position = None;
        self.length = None;
        self.codec = None;
        self.format = None;
        self.meta = None;
        self.buffered_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_stream_types::SampleEncoding;

    #[test]
    fn snapshot_subtracts_buffered_frames() {
        let mut state = StatusState {
            stream_id: Some(1),
            write_position: Some(48_000),
            written_frames: 96_000,
            buffered_frames: 4_800,
            ..Default::default()
        };
        state.paused = true;

        let snap = state.snapshot();
        assert_eq!(snap.position, Some(43_200));
        assert_eq!(snap.played_frames, 91_200);
        assert_eq!(snap.buffered_frames, Some(4_800));
        assert!(snap.paused);
    }

    #[test]
    fn begin_and_end_stream_track_phase() {
        let mut state = StatusState::default();
        let mut cfg = ConfigureEvent::new(
            CodecId::Flac,
            AudioFormat::new(SampleEncoding::Encoded, 44_100, 2),
        );
        cfg.stream_id = 7;
        cfg.stream_length = Some(1000);
        state.begin_stream(&cfg);
        assert_eq!(state.phase, StreamPhase::Configuring);
        assert_eq!(state.snapshot().length, Some(1000));

        state.end_stream(StreamEndReason::Eof);
        assert_eq!(state.phase, StreamPhase::EndOfStream);
        state.end_stream(StreamEndReason::Stopped);
        assert_eq!(state.phase, StreamPhase::Stopped);
    }

    #[test]
    fn clear_playback_keeps_end_reason() {
        let mut state = StatusState::default();
        state.stream_id = Some(3);
        state.codec = Some(CodecId::Mp3);
        state.end_stream(StreamEndReason::Error);
        state.clear_playback();

        assert!(state.stream_id.is_none());
        assert!(state.codec.is_none());
        assert_eq!(state.snapshot().buffered_frames, None);
        assert_eq!(state.end_reason, Some(StreamEndReason::Error));
    }
}
