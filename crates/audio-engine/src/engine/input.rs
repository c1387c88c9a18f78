//! Input stage: byte source → reader → encoded packets.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::STAGE_POLL;
use super::control::{InputCommand, OpenRequest, StageControl};
use crate::event::{Event, StageMessage};
use crate::interrupt::Interrupt;
use crate::packet::{Packet, PacketPool};
use crate::reader::registry::FormatRegistry;
use crate::reader::{ProcessStatus, ReadError, Reader, ReaderOptions, StreamHeader};
use crate::source::{ByteSource, ReplaySource};
use audio_stream_types::StreamEndReason;

/// The stream the input stage is reading.
struct ActiveStream {
    id: u32,
    source: Box<dyn ByteSource>,
    reader: Reader,
    padding_start: u64,
    stream_length: Option<u64>,
    /// The reader returned `Done`; kept so a late seek can resume it.
    done: bool,
}

pub(crate) struct InputStage {
    registry: Arc<FormatRegistry>,
    options: ReaderOptions,
    pool: PacketPool,
    commands: Receiver<InputCommand>,
    downstream: Sender<StageMessage>,
    decode_ctl: Sender<StageControl>,
    output_ctl: Sender<StageControl>,
    events: Sender<Event>,
    interrupt: Interrupt,
    epoch: u64,
    pending: VecDeque<OpenRequest>,
    current: Option<ActiveStream>,
    closed: bool,
}

impl InputStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FormatRegistry>,
        options: ReaderOptions,
        pool: PacketPool,
        commands: Receiver<InputCommand>,
        downstream: Sender<StageMessage>,
        decode_ctl: Sender<StageControl>,
        output_ctl: Sender<StageControl>,
        events: Sender<Event>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            registry,
            options,
            pool,
            commands,
            downstream,
            decode_ctl,
            output_ctl,
            events,
            interrupt,
            epoch: 0,
            pending: VecDeque::new(),
            current: None,
            closed: false,
        }
    }

    pub fn run(mut self) {
        loop {
            if self.interrupt.is_set() {
                tracing::debug!("input stage interrupted");
                break;
            }
            self.drain_commands();

            let reading = self.current.as_ref().is_some_and(|s| !s.done);
            if !reading {
                if let Some(request) = self.pending.pop_front() {
                    self.open(request);
                    continue;
                }
                if self.closed {
                    break;
                }
                match self.commands.recv_timeout(STAGE_POLL) {
                    Ok(cmd) => self.apply(cmd),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => self.closed = true,
                }
                continue;
            }

            let Some(packet) = self.get_decoder_packet() else {
                continue;
            };
            self.produce(packet);
        }
    }

    /// Apply every queued command without blocking. Returns `true` if any was applied.
    fn drain_commands(&mut self) -> bool {
        let mut applied = false;
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    self.apply(cmd);
                    applied = true;
                }
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        applied
    }

    fn apply(&mut self, cmd: InputCommand) {
        match cmd {
            InputCommand::Open(request) => {
                tracing::debug!(stream_id = request.stream_id, "stream queued");
                self.pending.push_back(request);
            }
            InputCommand::Seek { sample } => self.seek(sample),
            InputCommand::Stop { through } => self.stop(through),
            InputCommand::Abort { stream_id } => {
                if self.current.as_ref().is_some_and(|s| s.id == stream_id) {
                    tracing::debug!(stream_id, "stream aborted downstream");
                    self.current = None;
                }
            }
        }
    }

    /// Free encoded packet, waiting while the decoder pool is exhausted.
    ///
    /// Returns `None` when a command arrived or the interrupt fired, so the caller
    /// re-evaluates its state first.
    fn get_decoder_packet(&mut self) -> Option<Packet> {
        loop {
            if self.interrupt.is_set() {
                return None;
            }
            if let Some(packet) = self.pool.acquire_for(STAGE_POLL) {
                return Some(packet);
            }
            if self.drain_commands() {
                return None;
            }
        }
    }

    fn open(&mut self, request: OpenRequest) {
        let OpenRequest {
            stream_id,
            source,
            hint,
        } = request;
        let mut source: Box<dyn ByteSource> = if source.is_serial() {
            Box::new(ReplaySource::new(source))
        } else {
            source
        };

        let opened = self
            .registry
            .open(source.as_mut(), hint.as_deref(), &self.options)
            .and_then(|mut reader| {
                let header = reader.init(source.as_mut())?;
                Ok((reader, header))
            });
        let (reader, header) = match opened {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(stream_id, hint = ?hint, error = %e, "open failed");
                self.end_stream(stream_id, StreamEndReason::Error);
                return;
            }
        };

        let mut padding_start = 0;
        let mut stream_length = None;
        if let Some(StreamHeader {
            mut configure,
            meta,
        }) = header
        {
            configure.stream_id = stream_id;
            padding_start = configure.gapless.padding_start;
            stream_length = configure.stream_length;
            tracing::info!(
                stream_id,
                format = reader.kind().label(),
                codec = configure.codec.label(),
                rate_hz = configure.format.sample_rate,
                channels = configure.format.channels,
                length = ?configure.stream_length,
                serial = source.is_serial(),
                "stream configured"
            );
            self.post(StageMessage::Configure(configure));
            if !meta.is_empty() {
                self.post(StageMessage::Meta { stream_id, meta });
            }
        }

        self.current = Some(ActiveStream {
            id: stream_id,
            source,
            reader,
            padding_start,
            stream_length,
            done: false,
        });
    }

    fn produce(&mut self, mut packet: Packet) {
        let epoch = self.epoch;
        let Some(active) = self.current.as_mut() else {
            return;
        };
        let id = active.id;
        let status = active.reader.process(active.source.as_mut(), &mut packet);
        packet.stream_id = id;
        packet.epoch = epoch;

        match status {
            Ok(ProcessStatus::Ok) => {
                if !packet.is_empty() {
                    self.post(StageMessage::Packet(packet));
                }
            }
            Ok(ProcessStatus::Done) => {
                active.done = true;
                tracing::debug!(stream_id = id, "end of input");
                self.post(StageMessage::Packet(packet));
            }
            Ok(ProcessStatus::Redirect(uris)) => {
                tracing::info!(stream_id = id, entries = uris.len(), "redirect");
                let _ = self.events.send(Event::Redirect { stream_id: id, uris });
            }
            Ok(ProcessStatus::Interrupted) => {
                if !self.interrupt.is_set() {
                    tracing::warn!(stream_id = id, "read interrupted");
                    self.fail(id);
                }
            }
            Err(e) => {
                self.report_read_error(id, &e);
                self.fail(id);
            }
        }
    }

    fn seek(&mut self, sample: u64) {
        let Some(active) = self.current.as_mut() else {
            tracing::debug!(sample, "seek ignored: nothing is being read");
            return;
        };
        if !active.reader.can_seek(active.source.as_ref()) {
            tracing::info!(stream_id = active.id, "stream is not seekable");
            return;
        }
        let id = active.id;
        let raw = raw_seek_target(sample, active.padding_start, active.stream_length);
        match active.reader.seek(active.source.as_mut(), raw) {
            Ok(true) => {
                active.done = false;
                self.epoch += 1;
                tracing::info!(stream_id = id, sample, epoch = self.epoch, "seek");
                let flush = StageControl::Flush {
                    stream_id: id,
                    epoch: self.epoch,
                    discard_until: Some(raw),
                };
                let _ = self.decode_ctl.send(flush.clone());
                let _ = self.output_ctl.send(flush);
            }
            Ok(false) => tracing::info!(stream_id = id, "seek not supported"),
            Err(e) => {
                self.report_read_error(id, &e);
                self.fail(id);
            }
        }
    }

    fn stop(&mut self, through: u32) {
        if self.current.as_ref().is_some_and(|s| s.id <= through) {
            self.current = None;
        }
        self.pending.retain(|r| r.stream_id > through);
        tracing::info!(through, "stop");
    }

    fn report_read_error(&self, stream_id: u32, e: &ReadError) {
        tracing::warn!(stream_id, error = %e, "read failed");
    }

    fn fail(&mut self, stream_id: u32) {
        self.current = None;
        self.end_stream(stream_id, StreamEndReason::Error);
    }

    fn end_stream(&mut self, stream_id: u32, reason: StreamEndReason) {
        self.post(StageMessage::End {
            stream_id,
            epoch: self.epoch,
            reason,
        });
    }

    fn post(&self, msg: StageMessage) {
        if self.downstream.send(msg).is_err() {
            tracing::debug!("decode stage gone; dropping message");
        }
    }
}

/// Raw reader position for trimmed sample `sample`, clamped to the end of the audio.
fn raw_seek_target(sample: u64, padding_start: u64, stream_length: Option<u64>) -> u64 {
    let sample = stream_length.map_or(sample, |length| sample.min(length));
    sample.saturating_add(padding_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_target_adds_encoder_delay() {
        assert_eq!(raw_seek_target(1000, 576, Some(44_100)), 1576);
        assert_eq!(raw_seek_target(1000, 0, None), 1000);
    }

    #[test]
    fn seek_target_is_clamped_to_the_stream() {
        assert_eq!(raw_seek_target(u64::MAX, 1105, Some(88_200)), 89_305);
        assert_eq!(raw_seek_target(u64::MAX, 1105, None), u64::MAX);
        assert_eq!(raw_seek_target(88_201, 0, Some(88_200)), 88_200);
    }
}
