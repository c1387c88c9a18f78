//! Player runtime: device listing, playback of a queue of inputs, and stream probing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;

use crate::config::{PlayConfig, ProbeConfig, http_config};
use audio_engine::output::{CpalOutput, CpalOutputConfig, device};
use audio_engine::packet::PacketPool;
use audio_engine::reader::ProcessStatus;
use audio_engine::reader::registry::FormatRegistry;
use audio_engine::source::{ByteSource, FileSource, HttpSource, HttpSourceConfig, is_url};
use audio_engine::{ControlEvent, Engine, Event, Interrupt};
use audio_stream_types::{
    AudioFormat, CodecId, GaplessInfo, MetaInfo, ReplayGain, StreamEndReason,
};

const EVENT_POLL: Duration = Duration::from_millis(200);
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    device::list_devices()
}

/// Play every input back to back and return once all of them ended.
pub fn run_play(config: PlayConfig, install_ctrlc: bool) -> Result<()> {
    let output = CpalOutput::new(CpalOutputConfig {
        device: normalize_device_name(config.device.clone()),
        buffer_seconds: config.engine.buffer_seconds,
        refill_max_frames: config.engine.refill_max_frames,
    });
    let engine = Engine::start(
        config.engine.clone(),
        Arc::new(FormatRegistry::new()),
        Box::new(output),
    )?;
    let interrupt = engine.interrupt();
    if install_ctrlc {
        let on_signal = interrupt.clone();
        let _ = ctrlc::set_handler(move || {
            tracing::info!("interrupted");
            on_signal.trigger();
        });
    }

    let http = http_config(config.connect_timeout_secs);
    let mut session = Session::default();
    for input in &config.inputs {
        session.open(&engine, &http, input, 0);
    }
    if session.pending.is_empty() {
        bail!("nothing to play");
    }

    let events = engine.events();
    let mut last_status = Instant::now();
    while !session.pending.is_empty() {
        let event = match events.recv_timeout(EVENT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                if last_status.elapsed() >= STATUS_LOG_INTERVAL {
                    last_status = Instant::now();
                    let status = engine.status();
                    tracing::debug!(
                        stream_id = ?status.stream_id,
                        position = ?status.position,
                        length = ?status.length,
                        buffered = ?status.buffered_frames,
                        "status"
                    );
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match event {
            Event::Configure(cfg) => {
                let label = session.labels.get(&cfg.stream_id).cloned().unwrap_or_default();
                tracing::info!(
                    stream_id = cfg.stream_id,
                    input = %label,
                    codec = cfg.codec.label(),
                    rate_hz = cfg.format.sample_rate,
                    channels = cfg.format.channels,
                    length = ?cfg.stream_length,
                    "now playing"
                );
            }
            Event::Meta { stream_id, meta } => {
                tracing::info!(
                    stream_id,
                    title = ?meta.title,
                    artist = ?meta.artist,
                    album = ?meta.album,
                    "metadata"
                );
            }
            Event::Redirect { stream_id, uris } => {
                let depth = session.depth.get(&stream_id).copied().unwrap_or(0) + 1;
                if depth > config.max_redirects {
                    tracing::warn!(stream_id, depth, "too many playlist hops; ignoring");
                } else if !interrupt.is_set() {
                    let base = session.labels.get(&stream_id).cloned().unwrap_or_default();
                    for uri in &uris {
                        session.open(&engine, &http, &resolve_entry(&base, uri), depth);
                    }
                }
            }
            Event::Control(ControlEvent::End { stream_id, reason }) => {
                session.pending.remove(&stream_id);
                match reason {
                    StreamEndReason::Eof => session.played += 1,
                    StreamEndReason::Error => session.failed += 1,
                    StreamEndReason::Stopped => {}
                }
                tracing::info!(stream_id, ?reason, "stream finished");
            }
        }
    }

    engine.shutdown();
    tracing::info!(
        played = session.played,
        failed = session.failed,
        "playback finished"
    );
    if session.played == 0 && session.failed > 0 && !interrupt.is_set() {
        bail!("no stream could be played");
    }
    Ok(())
}

/// Streams opened on the engine that have not ended yet.
#[derive(Default)]
struct Session {
    pending: BTreeSet<u32>,
    labels: BTreeMap<u32, String>,
    /// Playlist nesting level of each stream.
    depth: BTreeMap<u32, usize>,
    played: usize,
    failed: usize,
}

impl Session {
    fn open(&mut self, engine: &Engine, http: &HttpSourceConfig, input: &str, depth: usize) {
        let opened = open_source(input, http, Some(engine.interrupt()))
            .and_then(|source| engine.open(source, Some(input)));
        match opened {
            Ok(id) => {
                self.pending.insert(id);
                self.labels.insert(id, input.to_string());
                self.depth.insert(id, depth);
            }
            Err(e) => {
                tracing::warn!(input, "skipping input: {e:#}");
                self.failed += 1;
            }
        }
    }
}

fn open_source(
    input: &str,
    http: &HttpSourceConfig,
    interrupt: Option<Interrupt>,
) -> Result<Box<dyn ByteSource>> {
    if is_url(input) {
        Ok(Box::new(HttpSource::open(input, http, interrupt)?))
    } else {
        Ok(Box::new(FileSource::open(Path::new(input))?))
    }
}

/// Resolve a playlist entry against the playlist's own location.
fn resolve_entry(playlist: &str, entry: &str) -> String {
    if is_url(entry) || Path::new(entry).is_absolute() {
        return entry.to_string();
    }
    if is_url(playlist) {
        let base = playlist.split(['?', '#']).next().unwrap_or(playlist);
        return match base.rfind('/') {
            Some(slash) => format!("{}{entry}", &base[..=slash]),
            None => entry.to_string(),
        };
    }
    match Path::new(playlist).parent() {
        Some(dir) => dir.join(entry).to_string_lossy().into_owned(),
        None => entry.to_string(),
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Stream header as printed by `probe`.
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub input: String,
    pub container: &'static str,
    pub seekable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub redirect: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StreamReport {
    pub codec: CodecId,
    pub format: AudioFormat,
    pub length: Option<u64>,
    pub frame_samples: Option<u32>,
    pub gapless: GaplessInfo,
    pub replay_gain: ReplayGain,
    pub meta: MetaInfo,
}

/// Read the header of one input and print it as JSON.
pub fn run_probe(config: ProbeConfig) -> Result<()> {
    let report = probe(&config)?;
    let json = serde_json::to_string_pretty(&report).context("encode probe report")?;
    println!("{json}");
    Ok(())
}

pub fn probe(config: &ProbeConfig) -> Result<ProbeReport> {
    let http = http_config(config.connect_timeout_secs);
    let mut source = open_source(&config.input, &http, None)?;
    let registry = FormatRegistry::new();
    let mut reader = registry
        .open(
            source.as_mut(),
            Some(&config.input),
            &config.engine.reader_options(),
        )
        .with_context(|| format!("detect format of {}", config.input))?;
    let header = reader
        .init(source.as_mut())
        .with_context(|| format!("read header of {}", config.input))?;

    let mut redirect = Vec::new();
    if header.is_none() {
        let pool = PacketPool::new(
            "probe",
            1,
            config.engine.decoder_packet_bytes,
            Interrupt::new(),
        );
        if let Some(mut packet) = pool.try_acquire() {
            if let ProcessStatus::Redirect(uris) = reader.process(source.as_mut(), &mut packet)? {
                redirect = uris;
            }
        }
    }

    Ok(ProbeReport {
        input: config.input.clone(),
        container: reader.kind().label(),
        seekable: reader.can_seek(source.as_ref()),
        stream: header.map(|h| StreamReport {
            codec: h.configure.codec,
            format: h.configure.format,
            length: h.configure.stream_length,
            frame_samples: h.configure.frame_samples,
            gapless: h.configure.gapless,
            replay_gain: h.configure.replay_gain,
            meta: h.meta,
        }),
        redirect,
    })
}
