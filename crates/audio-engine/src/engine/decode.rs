//! Decode stage: encoded packets → trimmed interleaved `f32` PCM packets.

use crossbeam_channel::{Receiver, Sender, TryRecvError, select};

use super::STAGE_POLL;
use super::control::{FlushGate, InputCommand, StageControl};
use crate::decoder::{DecodeError, Decoder, GaplessTrimmer};
use crate::event::{ConfigureEvent, StageMessage};
use crate::interrupt::Interrupt;
use crate::packet::{Packet, PacketPool};
use audio_stream_types::{AudioFormat, StreamEndReason};

struct DecodingStream {
    cfg: ConfigureEvent,
    decoder: Decoder,
    trimmer: GaplessTrimmer,
    /// Raw position of the next decoded frame; anchored on the first packet after a flush.
    raw_position: Option<u64>,
    format: Option<AudioFormat>,
}

pub(crate) struct DecodeStage {
    pool: PacketPool,
    rx: Receiver<StageMessage>,
    control: Receiver<StageControl>,
    tx: Sender<StageMessage>,
    input: Sender<InputCommand>,
    interrupt: Interrupt,
    gate: FlushGate,
    current: Option<DecodingStream>,
    /// Stream this stage already failed; its remaining messages are dropped.
    dead: Option<u32>,
    /// Seek target that arrived before the stream's configure message.
    pending_discard: Option<(u32, u64)>,
    pcm: Vec<f32>,
}

impl DecodeStage {
    pub fn new(
        pool: PacketPool,
        rx: Receiver<StageMessage>,
        control: Receiver<StageControl>,
        tx: Sender<StageMessage>,
        input: Sender<InputCommand>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            pool,
            rx,
            control,
            tx,
            input,
            interrupt,
            gate: FlushGate::default(),
            current: None,
            dead: None,
            pending_discard: None,
            pcm: Vec::new(),
        }
    }

    pub fn run(mut self) {
        let rx = self.rx.clone();
        let control = self.control.clone();
        loop {
            if self.interrupt.is_set() {
                tracing::debug!("decode stage interrupted");
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
                stream_id,
                epoch,
                discard_until,
            } => {
                self.gate.flush(stream_id, epoch);
                match self.current.as_mut().filter(|s| s.cfg.stream_id == stream_id) {
                    Some(stream) => {
                        stream.decoder.reset();
                        stream.raw_position = None;
                        if let Some(raw) = discard_until {
                            stream.trimmer.discard_until(raw);
                        }
                    }
                    None => self.pending_discard = discard_until.map(|raw| (stream_id, raw)),
                }
                tracing::debug!(stream_id, epoch, "decoder flushed");
            }
            StageControl::Stop { through } => {
                self.gate.stop(through);
                if self
                    .current
                    .as_ref()
                    .is_some_and(|s| s.cfg.stream_id <= through)
                {
                    self.current = None;
                }
                self.pending_discard = None;
            }
            StageControl::Pause(_) => {}
        }
    }

    fn handle(&mut self, msg: StageMessage) {
        self.drain_control();
        if self.gate.is_stale(&msg) || self.dead == Some(msg.stream_id()) {
            return;
        }
        match msg {
            StageMessage::Configure(cfg) => self.configure(cfg),
            StageMessage::Packet(packet) => self.decode(packet),
            StageMessage::End {
                stream_id,
                epoch,
                reason,
            } => {
                if self.current.as_ref().is_some_and(|s| s.cfg.stream_id == stream_id) {
                    self.current = None;
                }
                self.post(StageMessage::End {
                    stream_id,
                    epoch,
                    reason,
                });
            }
            other => self.post(other),
        }
    }

    fn configure(&mut self, cfg: ConfigureEvent) {
        let id = cfg.stream_id;
        self.gate.retain_from(id);
        self.dead = None;
        self.current = None;

        let decoder = Decoder::open(&cfg);
        self.post(StageMessage::Configure(cfg.clone()));
        let decoder = match decoder {
            Ok(d) => d,
            Err(e) => {
                self.fail(id, self.gate.epoch(id), &e);
                return;
            }
        };
        let mut trimmer = GaplessTrimmer::new(&cfg);
        if let Some((pending_id, raw)) = self.pending_discard.take() {
            if pending_id == id {
                trimmer.discard_until(raw);
            }
        }
        tracing::debug!(
            stream_id = id,
            codec = cfg.codec.label(),
            padding_start = cfg.gapless.padding_start,
            padding_end = cfg.gapless.padding_end,
            "decoder opened"
        );
        self.current = Some(DecodingStream {
            cfg,
            decoder,
            trimmer,
            raw_position: None,
            format: None,
        });
    }

    fn decode(&mut self, packet: Packet) {
        let id = packet.stream_id;
        let epoch = packet.epoch;
        let Some(stream) = self.current.as_mut().filter(|s| s.cfg.stream_id == id) else {
            // Playlists and failed opens never configure a decoder.
            if packet.is_end_of_stream() {
                self.post(StageMessage::End {
                    stream_id: id,
                    epoch,
                    reason: StreamEndReason::Eof,
                });
            }
            return;
        };

        if !packet.is_empty() {
            let raw = *stream.raw_position.get_or_insert(packet.stream_position);
            let mut pcm = std::mem::take(&mut self.pcm);
            pcm.clear();
            match stream.decoder.decode(packet.data(), &mut pcm) {
                Ok(frames) => {
                    let keep = stream.trimmer.keep(raw, frames);
                    stream.raw_position = Some(raw + frames as u64);
                    let format = stream.decoder.output_format(&stream.cfg);
                    let position = stream.trimmer.trimmed(raw + keep.start as u64);
                    let length = stream.cfg.stream_length;
                    let changed = stream.format.as_ref() != Some(&format);
                    if changed {
                        stream.format = Some(format.clone());
                        tracing::debug!(
                            stream_id = id,
                            rate_hz = format.sample_rate,
                            channels = format.channels,
                            "decoded format"
                        );
                        self.post(StageMessage::Format {
                            stream_id: id,
                            format: format.clone(),
                        });
                    }

                    let channels = usize::from(format.channels.max(1));
                    let lo = (keep.start * channels).min(pcm.len());
                    let hi = (keep.end * channels).min(pcm.len());
                    let sent = self.emit(id, epoch, position, length, &pcm[lo..hi], channels);
                    self.pcm = pcm;
                    if !sent {
                        return;
                    }
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(stream_id = id, error = %e, "skipping undecodable packet");
                    self.pcm = pcm;
                }
                Err(e) => {
                    self.pcm = pcm;
                    self.fail(id, epoch, &e);
                    return;
                }
            }
        }

        if packet.is_end_of_stream() {
            self.end_of_stream(id, epoch);
        }
    }

    /// Split `samples` into output packets; `false` if the stream went stale meanwhile.
    fn emit(
        &mut self,
        id: u32,
        epoch: u64,
        mut position: u64,
        length: Option<u64>,
        mut samples: &[f32],
        channels: usize,
    ) -> bool {
        while !samples.is_empty() {
            let Some(mut out) = self.get_output_packet(id, epoch) else {
                return false;
            };
            let fit = (out.capacity() / 4 / channels).max(1) * channels;
            let take = fit.min(samples.len());
            let written = out.push_f32(&samples[..take]);
            out.stream_id = id;
            out.epoch = epoch;
            out.stream_position = position;
            out.stream_length = length;
            position += (written / channels) as u64;
            samples = &samples[written.max(1).min(samples.len())..];
            self.post(StageMessage::Packet(out));
        }
        true
    }

    fn end_of_stream(&mut self, id: u32, epoch: u64) {
        let Some((position, length)) = self.current.as_ref().map(|s| {
            let raw = s.raw_position.unwrap_or(s.trimmer.padding_start());
            let length = s.cfg.stream_length;
            let position = s.trimmer.trimmed(raw);
            (length.map_or(position, |l| position.min(l)), length)
        }) else {
            return;
        };
        let Some(mut out) = self.get_output_packet(id, epoch) else {
            return;
        };
        out.stream_id = id;
        out.epoch = epoch;
        out.stream_position = position;
        out.stream_length = length;
        out.set_end_of_stream();
        tracing::debug!(stream_id = id, position, "decoder reached end of stream");
        self.post(StageMessage::Packet(out));
    }

    /// Free PCM packet, or `None` once the stream it is for went stale.
    fn get_output_packet(&mut self, id: u32, epoch: u64) -> Option<Packet> {
        loop {
            if self.interrupt.is_set() {
                return None;
            }
            if let Some(packet) = self.pool.acquire_for(STAGE_POLL) {
                return Some(packet);
            }
            self.drain_control();
            let current = self.current.as_ref().is_some_and(|s| s.cfg.stream_id == id);
            if !current || self.gate.is_stale_packet(id, epoch) {
                return None;
            }
        }
    }

    fn fail(&mut self, id: u32, epoch: u64, e: &DecodeError) {
        tracing::warn!(stream_id = id, error = %e, "decode failed");
        self.current = None;
        self.dead = Some(id);
        self.post(StageMessage::End {
            stream_id: id,
            epoch,
            reason: StreamEndReason::Error,
        });
        let _ = self.input.send(InputCommand::Abort { stream_id: id });
    }

    fn post(&self, msg: StageMessage) {
        if self.tx.send(msg).is_err() {
            tracing::debug!("output stage gone; dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_stream_types::{CodecId, GaplessInfo, SampleEncoding};
    use crossbeam_channel::unbounded;

    struct Harness {
        input_pool: PacketPool,
        control: Sender<StageControl>,
        from_decode: Receiver<StageMessage>,
        stage: DecodeStage,
    }

    fn harness(output_packet_bytes: usize) -> Harness {
        let interrupt = Interrupt::new();
        let (_to_decode, rx) = unbounded();
        let (control, control_rx) = unbounded();
        let (tx, from_decode) = unbounded();
        let (input_tx, _input_rx) = unbounded();
        let stage = DecodeStage::new(
            PacketPool::new("test-output", 16, output_packet_bytes, interrupt.clone()),
            rx,
            control_rx,
            tx,
            input_tx,
            interrupt.clone(),
        );
        Harness {
            input_pool: PacketPool::new("test-input", 16, 4096, interrupt),
            control,
            from_decode,
            stage,
        }
    }

    fn pcm_cfg(id: u32) -> ConfigureEvent {
        let mut cfg = ConfigureEvent::new(
            CodecId::Pcm,
            AudioFormat::new(SampleEncoding::S16Le, 8_000, 1),
        );
        cfg.stream_id = id;
        cfg
    }

    fn s16_packet(pool: &PacketPool, id: u32, position: u64, samples: &[i16]) -> Packet {
        let mut p = pool.try_acquire().unwrap();
        for s in samples {
            p.extend_from_slice(&s.to_le_bytes()).unwrap();
        }
        p.stream_id = id;
        p.stream_position = position;
        p
    }

    fn collect(rx: &Receiver<StageMessage>) -> Vec<StageMessage> {
        rx.try_iter().collect()
    }

    fn pcm_frames(msgs: &[StageMessage]) -> Vec<(u64, usize)> {
        msgs.iter()
            .filter_map(|m| match m {
                StageMessage::Packet(p) if !p.is_empty() => {
                    Some((p.stream_position, p.len() / 4))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn trims_encoder_delay_and_end_padding() {
        let mut h = harness(4096);
        let mut cfg = pcm_cfg(1);
        cfg.stream_length = Some(6);
        cfg.gapless = GaplessInfo {
            padding_start: 2,
            padding_end: 2,
        };
        h.stage.handle(StageMessage::Configure(cfg));
        let mut p = s16_packet(&h.input_pool, 1, 0, &[0; 10]);
        p.set_end_of_stream();
        h.stage.handle(StageMessage::Packet(p));

        let msgs = collect(&h.from_decode);
        assert!(matches!(msgs[0], StageMessage::Configure(_)));
        assert!(matches!(msgs[1], StageMessage::Format { stream_id: 1, .. }));
        assert_eq!(pcm_frames(&msgs), vec![(0, 6)]);
        let StageMessage::Packet(eos) = msgs.last().unwrap() else {
            panic!("expected end-of-stream packet");
        };
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.stream_position, 6);
        assert_eq!(eos.stream_length, Some(6));
    }

    #[test]
    fn large_blocks_are_split_across_output_packets() {
        let mut h = harness(16);
        h.stage.handle(StageMessage::Configure(pcm_cfg(1)));
        h.stage
            .handle(StageMessage::Packet(s16_packet(&h.input_pool, 1, 0, &[1; 10])));

        let msgs = collect(&h.from_decode);
        assert_eq!(pcm_frames(&msgs), vec![(0, 4), (4, 4), (8, 2)]);
    }

    #[test]
    fn flush_drops_old_epochs_and_discards_up_to_the_target() {
        let mut h = harness(4096);
        h.stage.handle(StageMessage::Configure(pcm_cfg(1)));
        collect(&h.from_decode);

        h.control
            .send(StageControl::Flush {
                stream_id: 1,
                epoch: 1,
                discard_until: Some(13),
            })
            .unwrap();
        // Queued before the seek: dropped.
        h.stage
            .handle(StageMessage::Packet(s16_packet(&h.input_pool, 1, 40, &[0; 4])));
        assert!(collect(&h.from_decode).is_empty());

        let mut p = s16_packet(&h.input_pool, 1, 10, &[0; 8]);
        p.epoch = 1;
        h.stage.handle(StageMessage::Packet(p));
        assert_eq!(pcm_frames(&collect(&h.from_decode)), vec![(13, 5)]);
    }

    fn opus_silence() -> Vec<u8> {
        let mut enc =
            opus::Encoder::new(48_000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let mut out = vec![0u8; 4000];
        let len = enc.encode_float(&[0.0f32; 960 * 2], &mut out).unwrap();
        out.truncate(len);
        out
    }

    fn opus_cfg(id: u32, pre_skip: u16, packets: u64) -> ConfigureEvent {
        let mut cfg = ConfigureEvent::new(
            CodecId::Opus,
            AudioFormat::new(SampleEncoding::Encoded, 48_000, 2),
        );
        let mut head = b"OpusHead".to_vec();
        head.extend_from_slice(&[1, 2]);
        head.extend_from_slice(&pre_skip.to_le_bytes());
        head.extend_from_slice(&48_000u32.to_le_bytes());
        head.extend_from_slice(&[0, 0, 0]);
        cfg.extra_data = Some(head);
        cfg.stream_id = id;
        cfg.gapless.padding_start = u64::from(pre_skip);
        cfg.stream_length = Some(packets * 960 - u64::from(pre_skip));
        cfg
    }

    fn encoded_packet(pool: &PacketPool, id: u32, epoch: u64, position: u64, data: &[u8]) -> Packet {
        let mut p = pool.try_acquire().unwrap();
        p.extend_from_slice(data).unwrap();
        p.stream_id = id;
        p.epoch = epoch;
        p.stream_position = position;
        p
    }

    /// (first position, total frames) of the stereo PCM packets in `msgs`.
    fn stereo_span(msgs: &[StageMessage]) -> (Option<u64>, usize) {
        let frames = pcm_frames(msgs);
        (frames.first().map(|f| f.0), frames.iter().map(|f| f.1 / 2).sum())
    }

    #[test]
    fn opus_pre_skip_and_seek_pre_roll_are_never_played() {
        let mut h = harness(4096);
        let silence = opus_silence();
        h.stage.handle(StageMessage::Configure(opus_cfg(1, 312, 3)));
        for i in 0..3 {
            let p = encoded_packet(&h.input_pool, 1, 0, i * 960, &silence);
            h.stage.handle(StageMessage::Packet(p));
        }
        assert_eq!(stereo_span(&collect(&h.from_decode)), (Some(0), 3 * 960 - 312));

        // Seek to trimmed 2000: the reader rewinds to raw 0 for pre-roll.
        h.control
            .send(StageControl::Flush {
                stream_id: 1,
                epoch: 1,
                discard_until: Some(2000 + 312),
            })
            .unwrap();
        for i in 0..3 {
            let p = encoded_packet(&h.input_pool, 1, 1, i * 960, &silence);
            h.stage.handle(StageMessage::Packet(p));
        }
        assert_eq!(stereo_span(&collect(&h.from_decode)), (Some(2000), 3 * 960 - 2312));
    }

    #[test]
    fn end_of_stream_without_decoder_ends_the_stream() {
        let mut h = harness(4096);
        let mut p = h.input_pool.try_acquire().unwrap();
        p.stream_id = 4;
        p.set_end_of_stream();
        h.stage.handle(StageMessage::Packet(p));

        let msgs = collect(&h.from_decode);
        assert!(matches!(
            msgs.as_slice(),
            [StageMessage::End {
                stream_id: 4,
                reason: StreamEndReason::Eof,
                ..
            }]
        ));
    }

    #[test]
    fn unsupported_codec_fails_once_and_drops_the_rest() {
        let mut h = harness(4096);
        let mut cfg = pcm_cfg(2);
        cfg.format.encoding = SampleEncoding::Encoded;
        h.stage.handle(StageMessage::Configure(cfg));
        h.stage
            .handle(StageMessage::Packet(s16_packet(&h.input_pool, 2, 0, &[0; 4])));
        h.stage.handle(StageMessage::End {
            stream_id: 2,
            epoch: 0,
            reason: StreamEndReason::Error,
        });

        let ends = collect(&h.from_decode)
            .into_iter()
            .filter(|m| matches!(m, StageMessage::End { .. }))
            .count();
        assert_eq!(ends, 1);
    }
}
