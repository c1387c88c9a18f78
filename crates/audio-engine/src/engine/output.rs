//! Output stage: PCM packets → backend, plus host events and playback status.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};

use super::STAGE_POLL;
use super::control::{FlushGate, InputCommand, StageControl};
use crate::event::{ControlEvent, Event, StageMessage};
use crate::interrupt::Interrupt;
use crate::output::OutputBackend;
use crate::packet::Packet;
use crate::status::StatusState;
use audio_stream_types::{AudioFormat, StreamEndReason, StreamPhase};

pub(crate) struct OutputStage {
    backend: Box<dyn OutputBackend>,
    rx: Receiver<StageMessage>,
    control: Receiver<StageControl>,
    input: Sender<InputCommand>,
    events: Sender<Event>,
    status: Arc<Mutex<StatusState>>,
    interrupt: Interrupt,
    /// Highest stream id handed out by the engine.
    last_opened: Arc<AtomicU32>,
    gate: FlushGate,
    /// Every stream up to this id already got its end event.
    ended_through: u32,
    current: Option<u32>,
    format: Option<AudioFormat>,
    samples: Vec<f32>,
}

impl OutputStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Box<dyn OutputBackend>,
        rx: Receiver<StageMessage>,
        control: Receiver<StageControl>,
        input: Sender<InputCommand>,
        events: Sender<Event>,
        status: Arc<Mutex<StatusState>>,
        interrupt: Interrupt,
        last_opened: Arc<AtomicU32>,
    ) -> Self {
        Self {
            backend,
            rx,
            control,
            input,
            events,
            status,
            interrupt,
            last_opened,
            gate: FlushGate::default(),
            ended_through: 0,
            current: None,
            format: None,
            samples: Vec::new(),
        }
    }

    pub fn run(mut self) {
        tracing::info!(backend = self.backend.name(), "output stage started");
        let rx = self.rx.clone();
        let control = self.control.clone();
        loop {
            if self.interrupt.is_set() {
                break;
            }
            select! {
                recv(control) -> msg => match msg {
                    Ok(ctl) => self.apply(ctl),
                    Err(_) => break,
                },
                recv(rx) -> msg => match msg {
                    Ok(msg) => self.handle(msg),
                    Err(_) => break,
                },
                default(STAGE_POLL) => {}
            }
        }
        self.shutdown();
    }

    fn is_stale(&self, msg: &StageMessage) -> bool {
        msg.stream_id() <= self.ended_through || self.gate.is_stale(msg)
    }

    fn is_stale_packet(&self, id: u32, epoch: u64) -> bool {
        id <= self.ended_through || self.gate.is_stale_packet(id, epoch)
    }

    fn drain_control(&mut self) {
        loop {
            match self.control.try_recv() {
                Ok(ctl) => self.apply(ctl),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply(&mut self, ctl: StageControl) {
        match ctl {
            StageControl::Flush {
                stream_id, epoch, ..
            } => {
                self.gate.flush(stream_id, epoch);
                if self.current == Some(stream_id) {
                    self.backend.discard();
                    let mut status = self.status.lock().unwrap();
                    status.write_position = None;
                    status.buffered_frames = 0;
                }
            }
            StageControl::Stop { through } => self.stop(through),
            StageControl::Pause(paused) => {
                tracing::info!(paused, "pause");
                self.backend.pause(paused);
                self.status.lock().unwrap().paused = paused;
            }
        }
    }

    fn handle(&mut self, msg: StageMessage) {
        self.drain_control();
        if self.is_stale(&msg) {
            return;
        }
        match msg {
            StageMessage::Configure(cfg) => {
                self.current = Some(cfg.stream_id);
                self.status.lock().unwrap().begin_stream(&cfg);
                self.post(Event::Configure(cfg));
            }
            StageMessage::Meta { stream_id, meta } => {
                self.status.lock().unwrap().meta = Some(meta.clone());
                self.post(Event::Meta { stream_id, meta });
            }
            StageMessage::Format { stream_id, format } => self.configure(stream_id, format),
            StageMessage::Packet(packet) => self.play(packet),
            StageMessage::End {
                stream_id, reason, ..
            } => {
                if self.current == Some(stream_id) && reason != StreamEndReason::Eof {
                    self.backend.discard();
                }
                self.post_end(stream_id, reason);
            }
        }
    }

    fn configure(&mut self, stream_id: u32, format: AudioFormat) {
        if self.format.as_ref() == Some(&format) {
            return;
        }
        if self.format.is_some() {
            // Let the previous format finish before the device is reopened.
            self.drain_backend(stream_id, self.gate.epoch(stream_id));
        }
        match self.backend.configure(&format) {
            Ok(()) => {
                tracing::info!(
                    stream_id,
                    backend = self.backend.name(),
                    rate_hz = format.sample_rate,
                    channels = format.channels,
                    "output configured"
                );
                self.status.lock().unwrap().format = Some(format.clone());
                self.format = Some(format);
            }
            Err(e) => {
                tracing::error!(stream_id, error = %e, "output configure failed");
                self.format = None;
                self.fail(stream_id);
            }
        }
    }

    fn play(&mut self, packet: Packet) {
        let id = packet.stream_id;
        let epoch = packet.epoch;
        let Some(channels) = self.format.as_ref().map(|f| usize::from(f.channels.max(1))) else {
            if packet.is_end_of_stream() {
                self.finish(id, epoch);
            }
            return;
        };

        packet.read_f32_into(&mut self.samples);
        let samples = std::mem::take(&mut self.samples);
        let mut offset = 0;
        while offset < samples.len() {
            self.drain_control();
            if self.interrupt.is_set() || self.is_stale_packet(id, epoch) {
                self.samples = samples;
                return;
            }
            match self.backend.write(&samples[offset..]) {
                Ok(accepted) => {
                    offset += accepted;
                    let mut status = self.status.lock().unwrap();
                    status.write_position = Some(packet.stream_position + (offset / channels) as u64);
                    status.written_frames += (accepted / channels) as u64;
                    status.buffered_frames = self.backend.delay();
                    if accepted > 0 {
                        status.phase = StreamPhase::Streaming;
                    }
                }
                Err(e) => {
                    tracing::error!(stream_id = id, error = %e, "output write failed");
                    self.samples = samples;
                    self.fail(id);
                    return;
                }
            }
        }
        self.samples = samples;

        if packet.is_end_of_stream() {
            self.finish(id, epoch);
        }
    }

    fn finish(&mut self, id: u32, epoch: u64) {
        // With another stream already queued the tail keeps playing into it.
        if self.last_opened.load(Ordering::Acquire) <= id && !self.drain_backend(id, epoch) {
            return;
        }
        if self.is_stale_packet(id, epoch) {
            return;
        }
        self.post_end(id, StreamEndReason::Eof);
    }

    /// Wait for the backend to play out. `false` if the stream went stale meanwhile.
    fn drain_backend(&mut self, id: u32, epoch: u64) -> bool {
        loop {
            self.drain_control();
            if self.interrupt.is_set() || self.is_stale_packet(id, epoch) {
                return false;
            }
            match self.backend.drain() {
                Ok(true) => {
                    self.status.lock().unwrap().buffered_frames = 0;
                    return true;
                }
                Ok(false) => self.status.lock().unwrap().buffered_frames = self.backend.delay(),
                Err(e) => {
                    tracing::warn!(stream_id = id, error = %e, "output drain failed");
                    return true;
                }
            }
        }
    }

    fn stop(&mut self, through: u32) {
        self.gate.stop(through);
        if self.current.is_some_and(|id| id <= through) {
            self.backend.discard();
            self.current = None;
        }
        self.status.lock().unwrap().clear_playback();
        for id in self.ended_through + 1..=through {
            self.post_end(id, StreamEndReason::Stopped);
        }
    }

    fn fail(&mut self, id: u32) {
        self.backend.discard();
        self.post_end(id, StreamEndReason::Error);
        let _ = self.input.send(InputCommand::Abort { stream_id: id });
    }

    /// Deliver the terminal event for `id`, at most once.
    fn post_end(&mut self, id: u32, reason: StreamEndReason) {
        if id <= self.ended_through {
            return;
        }
        self.ended_through = id;
        if self.current == Some(id) {
            self.current = None;
        }
        tracing::info!(stream_id = id, ?reason, "stream ended");
        self.status.lock().unwrap().end_stream(reason);
        self.post(Event::Control(ControlEvent::End {
            stream_id: id,
            reason,
        }));
    }

    fn shutdown(&mut self) {
        self.backend.discard();
        self.status.lock().unwrap().clear_playback();
        let last = self.last_opened.load(Ordering::Acquire);
        for id in self.ended_through + 1..=last {
            self.post_end(id, StreamEndReason::Stopped);
        }
        tracing::info!("output stage stopped");
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::trace!("host stopped listening for events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ConfigureEvent;
    use crate::output::MemoryOutput;
    use crate::packet::PacketPool;
    use audio_stream_types::{CodecId, SampleEncoding};
    use crossbeam_channel::unbounded;

    struct Harness {
        pool: PacketPool,
        control: Sender<StageControl>,
        events: Receiver<Event>,
        output: MemoryOutput,
        status: Arc<Mutex<StatusState>>,
        stage: OutputStage,
    }

    fn harness(last_opened: u32) -> Harness {
        let interrupt = Interrupt::new();
        let (_tx, rx) = unbounded();
        let (control, control_rx) = unbounded();
        let (input_tx, _input_rx) = unbounded();
        let (events_tx, events) = unbounded();
        let output = MemoryOutput::new();
        let status = StatusState::shared();
        let stage = OutputStage::new(
            Box::new(output.clone()),
            rx,
            control_rx,
            input_tx,
            events_tx,
            status.clone(),
            interrupt.clone(),
            Arc::new(AtomicU32::new(last_opened)),
        );
        Harness {
            pool: PacketPool::new("test", 8, 1024, interrupt),
            control,
            events,
            output,
            status,
            stage,
        }
    }

    fn start_stream(h: &mut Harness, id: u32) {
        let mut cfg = ConfigureEvent::new(
            CodecId::Pcm,
            AudioFormat::new(SampleEncoding::S16Le, 8_000, 2),
        );
        cfg.stream_id = id;
        h.stage.handle(StageMessage::Configure(cfg));
        h.stage.handle(StageMessage::Format {
            stream_id: id,
            format: AudioFormat::new(SampleEncoding::F32Le, 8_000, 2),
        });
    }

    fn pcm(h: &Harness, id: u32, position: u64, samples: &[f32], eos: bool) -> StageMessage {
        let mut p = h.pool.try_acquire().unwrap();
        p.push_f32(samples);
        p.stream_id = id;
        p.stream_position = position;
        if eos {
            p.set_end_of_stream();
        }
        StageMessage::Packet(p)
    }

    fn ends(events: &Receiver<Event>) -> Vec<(u32, StreamEndReason)> {
        events
            .try_iter()
            .filter_map(|e| match e {
                Event::Control(ControlEvent::End { stream_id, reason }) => {
                    Some((stream_id, reason))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plays_packets_and_reports_end_once() {
        let mut h = harness(1);
        start_stream(&mut h, 1);
        let first = pcm(&h, 1, 0, &[0.5; 8], false);
        h.stage.handle(first);
        let last = pcm(&h, 1, 4, &[0.25; 4], true);
        h.stage.handle(last);
        let late = StageMessage::End {
            stream_id: 1,
            epoch: 0,
            reason: StreamEndReason::Error,
        };
        h.stage.handle(late);

        assert_eq!(h.output.samples().len(), 12);
        assert_eq!(ends(&h.events), vec![(1, StreamEndReason::Eof)]);
        let status = h.status.lock().unwrap().snapshot();
        assert_eq!(status.position, Some(6));
        assert_eq!(status.played_frames, 6);
        assert_eq!(status.phase, StreamPhase::EndOfStream);
    }

    #[test]
    fn flushed_packets_are_not_played() {
        let mut h = harness(1);
        start_stream(&mut h, 1);
        h.control
            .send(StageControl::Flush {
                stream_id: 1,
                epoch: 1,
                discard_until: None,
            })
            .unwrap();
        let stale = pcm(&h, 1, 0, &[1.0; 4], false);
        h.stage.handle(stale);

        assert!(h.output.samples().is_empty());
        assert_eq!(h.output.discard_calls(), 1);
    }

    #[test]
    fn stop_ends_every_open_stream_as_stopped() {
        let mut h = harness(3);
        start_stream(&mut h, 1);
        h.stage.apply(StageControl::Stop { through: 3 });
        let late = pcm(&h, 2, 0, &[0.0; 2], true);
        h.stage.handle(late);

        assert_eq!(
            ends(&h.events),
            vec![
                (1, StreamEndReason::Stopped),
                (2, StreamEndReason::Stopped),
                (3, StreamEndReason::Stopped),
            ]
        );
        assert!(h.status.lock().unwrap().snapshot().stream_id.is_none());
    }

    #[test]
    fn shutdown_stops_streams_that_never_ended() {
        let mut h = harness(2);
        start_stream(&mut h, 1);
        let eos = pcm(&h, 1, 0, &[0.0; 2], true);
        h.stage.handle(eos);
        h.stage.shutdown();

        assert_eq!(
            ends(&h.events),
            vec![(1, StreamEndReason::Eof), (2, StreamEndReason::Stopped)]
        );
    }

    #[test]
    fn same_format_is_not_reconfigured() {
        let mut h = harness(2);
        start_stream(&mut h, 1);
        start_stream(&mut h, 2);
        assert_eq!(h.output.formats().len(), 1);
    }
}
