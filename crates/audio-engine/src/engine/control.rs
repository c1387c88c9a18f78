//! Control messages between the engine handle and its stages.

use std::collections::BTreeMap;

use crate::event::StageMessage;
use crate::source::ByteSource;

/// A stream queued by [`super::Engine::open`].
pub(crate) struct OpenRequest {
    pub stream_id: u32,
    pub source: Box<dyn ByteSource>,
    pub hint: Option<String>,
}

/// Commands for the input stage.
pub(crate) enum InputCommand {
    Open(OpenRequest),
    /// Reposition the stream being read; `sample` is in the trimmed (host) domain.
    Seek { sample: u64 },
    /// End every stream with an id up to `through`.
    Stop { through: u32 },
    /// A later stage already ended `stream_id`; stop reading it.
    Abort { stream_id: u32 },
}

/// Out-of-band control for the decode and output stages. Always drained before the next
/// queued message is handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StageControl {
    /// Packets of `stream_id` older than `epoch` are stale; reset codec/device state.
    /// `discard_until` is the raw sample the host asked for.
    Flush {
        stream_id: u32,
        epoch: u64,
        discard_until: Option<u64>,
    },
    Stop { through: u32 },
    Pause(bool),
}

/// Decides which queued messages a stage must drop after flushes and stops.
///
/// Epochs only invalidate packets of the flushed stream, so the tail of an earlier stream
/// still plays out when a seek hits the stream behind it.
#[derive(Debug, Default)]
pub(crate) struct FlushGate {
    flushed: BTreeMap<u32, u64>,
    stopped_through: u32,
}

impl FlushGate {
    pub fn flush(&mut self, stream_id: u32, epoch: u64) {
        let entry = self.flushed.entry(stream_id).or_insert(epoch);
        *entry = (*entry).max(epoch);
    }

    pub fn stop(&mut self, through: u32) {
        self.stopped_through = self.stopped_through.max(through);
        self.flushed.retain(|id, _| *id > through);
    }

    /// Forget flush records for streams before `stream_id`; nothing older can still be queued
    /// once its configure message arrived.
    pub fn retain_from(&mut self, stream_id: u32) {
        self.flushed.retain(|id, _| *id >= stream_id);
    }

    /// Latest flush epoch applied to `stream_id` (0 when never flushed).
    pub fn epoch(&self, stream_id: u32) -> u64 {
        self.flushed.get(&stream_id).copied().unwrap_or(0)
    }

    pub fn is_stopped(&self, stream_id: u32) -> bool {
        stream_id <= self.stopped_through
    }

    pub fn is_stale_packet(&self, stream_id: u32, epoch: u64) -> bool {
        self.is_stopped(stream_id) || epoch < self.epoch(stream_id)
    }

    pub fn is_stale(&self, msg: &StageMessage) -> bool {
        let id = msg.stream_id();
        match msg.epoch() {
            Some(epoch) => self.is_stale_packet(id, epoch),
            None => self.is_stopped(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_stream_types::StreamEndReason;

    fn end(stream_id: u32, epoch: u64) -> StageMessage {
        StageMessage::End {
            stream_id,
            epoch,
            reason: StreamEndReason::Eof,
        }
    }

    #[test]
    fn flush_only_invalidates_older_epochs_of_that_stream() {
        let mut gate = FlushGate::default();
        gate.flush(2, 5);
        assert!(gate.is_stale(&end(2, 4)));
        assert!(!gate.is_stale(&end(2, 5)));
        assert!(!gate.is_stale(&end(1, 0)));
        gate.flush(2, 3);
        assert_eq!(gate.epoch(2), 5);
    }

    #[test]
    fn stop_invalidates_every_message_up_to_the_bound() {
        let mut gate = FlushGate::default();
        gate.flush(3, 1);
        gate.stop(3);
        assert!(gate.is_stale(&end(1, 9)));
        assert!(gate.is_stale(&StageMessage::Meta {
            stream_id: 3,
            meta: Default::default(),
        }));
        assert!(!gate.is_stale(&end(4, 0)));
        assert_eq!(gate.epoch(3), 0);
    }

    #[test]
    fn retain_from_prunes_earlier_streams() {
        let mut gate = FlushGate::default();
        gate.flush(1, 2);
        gate.flush(2, 3);
        gate.retain_from(2);
        assert_eq!(gate.epoch(1), 0);
        assert_eq!(gate.epoch(2), 3);
    }
}
