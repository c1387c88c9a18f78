//! The three-stage streaming engine.
//!
//! ```text
//!  host ──open/seek/stop──▶ input ──encoded──▶ decode ──pcm──▶ output ──▶ backend
//!                             │                  ▲               ▲  │
//!                             └──── flush/stop ──┴───────────────┘  └──▶ events, status
//! ```
//!
//! Each stage runs on its own thread. Encoded and PCM packets come from bounded pools, so a
//! slow device back-pressures decoding and reading without any stage blocking on another's
//! queue. Control (flush, stop, pause) travels on separate channels that every stage drains
//! before its next queued message.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::config::EngineConfig;
use crate::event::Event;
use crate::interrupt::Interrupt;
use crate::output::OutputBackend;
use crate::packet::PacketPool;
use crate::reader::registry::FormatRegistry;
use crate::source::ByteSource;
use crate::status::StatusState;
use audio_stream_types::EngineStatus;

mod control;
mod decode;
mod input;
mod output;

use control::{InputCommand, OpenRequest, StageControl};

/// How long a stage blocks before re-checking control and the interrupt flag.
pub(crate) const STAGE_POLL: Duration = Duration::from_millis(20);

/// Handle to a running engine. Dropping it stops every stage.
pub struct Engine {
    input_ctl: Sender<InputCommand>,
    decode_ctl: Sender<StageControl>,
    output_ctl: Sender<StageControl>,
    events: Receiver<Event>,
    status: Arc<Mutex<StatusState>>,
    interrupt: Interrupt,
    last_opened: Arc<AtomicU32>,
    decoder_pool: PacketPool,
    output_pool: PacketPool,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Spawn the input, decode and output threads.
    pub fn start(
        config: EngineConfig,
        registry: Arc<FormatRegistry>,
        backend: Box<dyn OutputBackend>,
    ) -> Result<Self> {
        let interrupt = Interrupt::new();
        let decoder_pool = PacketPool::new(
            "decoder",
            config.decoder_packets,
            config.decoder_packet_bytes,
            interrupt.clone(),
        );
        let output_pool = PacketPool::new(
            "output",
            config.output_packets,
            config.output_packet_bytes,
            interrupt.clone(),
        );
        let options = config.reader_options();

        let (input_ctl, input_rx) = unbounded();
        let (decode_ctl, decode_ctl_rx) = unbounded();
        let (output_ctl, output_ctl_rx) = unbounded();
        let (encoded_tx, encoded_rx) = unbounded();
        let (pcm_tx, pcm_rx) = unbounded();
        let (events_tx, events) = unbounded();
        let status = StatusState::shared();
        let last_opened = Arc::new(AtomicU32::new(0));

        let input = input::InputStage::new(
            registry,
            options,
            decoder_pool.clone(),
            input_rx,
            encoded_tx,
            decode_ctl.clone(),
            output_ctl.clone(),
            events_tx.clone(),
            interrupt.clone(),
        );
        let decode = decode::DecodeStage::new(
            output_pool.clone(),
            encoded_rx,
            decode_ctl_rx,
            pcm_tx,
            input_ctl.clone(),
            interrupt.clone(),
        );
        let output = output::OutputStage::new(
            backend,
            pcm_rx,
            output_ctl_rx,
            input_ctl.clone(),
            events_tx,
            status.clone(),
            interrupt.clone(),
            last_opened.clone(),
        );

        let mut engine = Self {
            input_ctl,
            decode_ctl,
            output_ctl,
            events,
            status,
            interrupt,
            last_opened,
            decoder_pool,
            output_pool,
            threads: Vec::with_capacity(3),
        };
        engine.spawn("engine-input", move || input.run())?;
        engine.spawn("engine-decode", move || decode.run())?;
        engine.spawn("engine-output", move || output.run())?;
        tracing::info!(
            decoder_packets = config.decoder_packets,
            output_packets = config.output_packets,
            "engine started"
        );
        Ok(engine)
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .with_context(|| format!("spawn {name} thread"))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Queue a stream. Streams play back to back in the order they were opened.
    ///
    /// `hint` is a file name, URL or content type used when the leading bytes are ambiguous.
    pub fn open(&self, source: Box<dyn ByteSource>, hint: Option<&str>) -> Result<u32> {
        let stream_id = self.last_opened.fetch_add(1, Ordering::AcqRel) + 1;
        self.input_ctl
            .send(InputCommand::Open(OpenRequest {
                stream_id,
                source,
                hint: hint.map(str::to_string),
            }))
            .map_err(|_| anyhow!("engine stopped"))?;
        tracing::debug!(stream_id, hint, "open");
        Ok(stream_id)
    }

    /// Reposition the stream being read to trimmed sample `sample`.
    pub fn seek(&self, sample: u64) -> Result<()> {
        self.input_ctl
            .send(InputCommand::Seek { sample })
            .map_err(|_| anyhow!("engine stopped"))
    }

    pub fn pause(&self, paused: bool) -> Result<()> {
        self.output_ctl
            .send(StageControl::Pause(paused))
            .map_err(|_| anyhow!("engine stopped"))
    }

    /// End every stream opened so far; each reports [`audio_stream_types::StreamEndReason::Stopped`]
    /// unless it already ended.
    pub fn stop(&self) -> Result<()> {
        let through = self.last_opened.load(Ordering::Acquire);
        let sent = self.input_ctl.send(InputCommand::Stop { through }).is_ok()
            && self.decode_ctl.send(StageControl::Stop { through }).is_ok()
            && self.output_ctl.send(StageControl::Stop { through }).is_ok();
        if !sent {
            return Err(anyhow!("engine stopped"));
        }
        Ok(())
    }

    /// Host event stream: configure, meta, redirect and end events.
    pub fn events(&self) -> Receiver<Event> {
        self.events.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.lock().unwrap().snapshot()
    }

    /// Flag shared with every stage; pass it to sources so blocking reads give up on shutdown.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Stop every stage and wait for the threads to exit.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.interrupt.trigger();
        self.decoder_pool.wake_all();
        self.output_pool.wake_all();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("engine").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "engine thread panicked");
            }
        }
        tracing::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.join();
    }
}
