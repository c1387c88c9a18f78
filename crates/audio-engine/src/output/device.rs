//! CPAL device backend.
//!
//! The CPAL stream lives on its own thread (streams are not `Send` on every host); the
//! backend talks to it through a bounded [`SharedAudio`] queue. The real-time callback:
//! - refills a small local buffer from the queue without blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use audio_stream_types::AudioFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, bounded};

use super::resample::StreamResampler;
use super::{OutputBackend, POLL_SLICE};
use crate::queue::{SharedAudio, calc_max_buffered_samples};

/// Device selection and buffering knobs.
#[derive(Clone, Debug)]
pub struct CpalOutputConfig {
    /// Case-insensitive substring of the device name; `None` picks the host default.
    pub device: Option<String>,
    /// Target queue duration between the output stage and the callback.
    pub buffer_seconds: f32,
    /// Max frames pulled from the queue per callback refill.
    pub refill_max_frames: usize,
}

impl Default for CpalOutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_seconds: 2.0,
            refill_max_frames: 4096,
        }
    }
}

/// Counters shared with the callback.
#[derive(Debug, Default)]
struct CallbackCounters {
    paused: AtomicBool,
    played_frames: AtomicU64,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
}

/// What the stream thread reports once the device is running.
struct StreamInfo {
    device_name: String,
    sample_rate: u32,
    channels: u16,
    sample_format: cpal::SampleFormat,
    queue: Arc<SharedAudio>,
}

/// Owner of the running CPAL stream; dropping it stops the stream.
struct StreamHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Output backend playing through a CPAL device.
pub struct CpalOutput {
    config: CpalOutputConfig,
    counters: Arc<CallbackCounters>,
    format: Option<AudioFormat>,
    stream: Option<StreamHandle>,
    queue: Option<Arc<SharedAudio>>,
    device_rate: u32,
    resampler: Option<StreamResampler>,
    /// Converted samples that did not fit into the queue yet.
    pending: Vec<f32>,
    device_name: String,
}

impl CpalOutput {
    pub fn new(config: CpalOutputConfig) -> Self {
        Self {
            config,
            counters: Arc::new(CallbackCounters::default()),
            format: None,
            stream: None,
            queue: None,
            device_rate: 0,
            resampler: None,
            pending: Vec::new(),
            device_name: "cpal".to_string(),
        }
    }

    /// Frames the callback has played since the backend was created.
    pub fn played_frames(&self) -> u64 {
        self.counters.played_frames.load(Ordering::Relaxed)
    }

    /// Silence frames emitted because the queue ran dry.
    pub fn underrun_frames(&self) -> u64 {
        self.counters.underrun_frames.load(Ordering::Relaxed)
    }

    fn close_stream(&mut self) {
        self.stream = None;
        self.queue = None;
        self.resampler = None;
        self.pending.clear();
    }

    /// Move as much of `pending` into the device queue as fits within one poll slice.
    fn push_pending(&mut self) {
        let Some(queue) = &self.queue else {
            self.pending.clear();
            return;
        };
        let pushed = queue.push_for(&self.pending, POLL_SLICE);
        self.pending.drain(..pushed);
    }
}

impl OutputBackend for CpalOutput {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn configure(&mut self, format: &AudioFormat) -> Result<()> {
        if self.format.as_ref() == Some(format) && self.stream.is_some() {
            return Ok(());
        }
        self.close_stream();

        let (ready_tx, ready_rx) = bounded::<Result<StreamInfo>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let needle = self.config.device.clone();
        let buffer_seconds = self.config.buffer_seconds;
        let refill_max_frames = self.config.refill_max_frames.max(1);
        let counters = self.counters.clone();
        let target_rate = format.sample_rate;
        let src_channels = format.channels as usize;

        let thread = thread::Builder::new()
            .name("cpal-stream".into())
            .spawn(move || {
                run_stream(
                    needle.as_deref(),
                    target_rate,
                    src_channels,
                    buffer_seconds,
                    refill_max_frames,
                    counters,
                    ready_tx,
                    stop_rx,
                )
            })
            .context("spawn cpal stream thread")?;
        let handle = StreamHandle {
            stop: stop_tx,
            thread: Some(thread),
        };

        let info = ready_rx
            .recv()
            .map_err(|_| anyhow!("cpal stream thread exited before reporting"))??;

        tracing::info!(
            device = %info.device_name,
            rate_hz = info.sample_rate,
            channels = info.channels,
            sample_format = ?info.sample_format,
            source_rate_hz = format.sample_rate,
            source_channels = format.channels,
            "output device configured"
        );

        self.resampler = if info.sample_rate != format.sample_rate {
            Some(StreamResampler::new(
                format.sample_rate,
                info.sample_rate,
                src_channels,
            )?)
        } else {
            None
        };
        self.device_rate = info.sample_rate;
        self.device_name = info.device_name;
        self.queue = Some(info.queue);
        self.stream = Some(handle);
        self.format = Some(format.clone());
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        if self.queue.is_none() {
            return Err(anyhow!("write before configure"));
        }
        if !self.pending.is_empty() {
            self.push_pending();
            if !self.pending.is_empty() {
                return Ok(0);
            }
        }
        match &mut self.resampler {
            Some(resampler) => {
                resampler.process(samples, &mut self.pending)?;
                self.push_pending();
                Ok(samples.len())
            }
            None => Ok(self
                .queue
                .as_ref()
                .map_or(0, |q| q.push_for(samples, POLL_SLICE))),
        }
    }

    fn delay(&self) -> u64 {
        let Some(queue) = &self.queue else {
            return 0;
        };
        let channels = queue.channels();
        let device_frames = (queue.len_frames() + self.pending.len() / channels) as u64;
        let staged = self.resampler.as_ref().map_or(0, |r| r.staged_frames()) as u64;
        match (&self.format, self.device_rate) {
            (Some(format), rate) if rate > 0 && rate != format.sample_rate => {
                device_frames * format.sample_rate as u64 / rate as u64 + staged
            }
            _ => device_frames,
        }
    }

    fn discard(&mut self) {
        if let Some(queue) = &self.queue {
            let dropped = queue.clear();
            tracing::debug!(frames = dropped, "discarded queued audio");
        }
        self.pending.clear();
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
    }

    fn drain(&mut self) -> Result<bool> {
        if let Some(resampler) = &mut self.resampler {
            resampler.flush(&mut self.pending)?;
        }
        if !self.pending.is_empty() {
            self.push_pending();
            return Ok(false);
        }
        if self.counters.paused.load(Ordering::Relaxed) {
            thread::sleep(POLL_SLICE);
            return Ok(false);
        }
        Ok(self
            .queue
            .as_ref()
            .is_none_or(|q| q.wait_empty_for(POLL_SLICE)))
    }

    fn pause(&mut self, paused: bool) {
        self.counters.paused.store(paused, Ordering::Relaxed);
    }
}

/// Body of the stream thread: open the device, report back, then keep the stream alive
/// until told to stop.
#[allow(clippy::too_many_arguments)]
fn run_stream(
    needle: Option<&str>,
    target_rate: u32,
    src_channels: usize,
    buffer_seconds: f32,
    refill_max_frames: usize,
    counters: Arc<CallbackCounters>,
    ready: Sender<Result<StreamInfo>>,
    stop: Receiver<()>,
) {
    let opened = (|| -> Result<(cpal::Stream, StreamInfo)> {
        let host = cpal::default_host();
        let device = pick_device(&host, needle)?;
        let device_name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let supported = pick_output_config(&device, Some(target_rate))?;
        let mut stream_config: cpal::StreamConfig = supported.config();
        if let Some(size) = pick_buffer_size(&supported) {
            stream_config.buffer_size = size;
        }
        let queue = Arc::new(SharedAudio::new(
            src_channels,
            calc_max_buffered_samples(stream_config.sample_rate, src_channels, buffer_seconds),
        ));
        let stream = build_output_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            &queue,
            refill_max_frames,
            counters,
        )?;
        stream.play().context("start output stream")?;
        let info = StreamInfo {
            device_name,
            sample_rate: stream_config.sample_rate,
            channels: stream_config.channels,
            sample_format: supported.sample_format(),
            queue,
        };
        Ok((stream, info))
    })();

    match opened {
        Ok((stream, info)) => {
            if ready.send(Ok(info)).is_err() {
                return;
            }
            let _ = stop.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

/// Build a CPAL output stream that plays audio from `queue`.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SharedAudio>,
    refill_max_frames: usize,
    counters: Arc<CallbackCounters>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, refill_max_frames, counters),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, refill_max_frames, counters),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, refill_max_frames, counters),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, refill_max_frames, counters),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
    refill_max_frames: usize,
    counters: Arc<CallbackCounters>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels_out = config.channels as usize;
    let mut st = CallbackState {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::with_capacity(refill_max_frames * queue.channels()),
    };
    let queue = queue.clone();
    let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if counters.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }
            let frames = data.len() / channels_out;
            let mut filled = 0usize;
            for frame in 0..frames {
                if st.pos >= st.src.len() {
                    st.pos = 0;
                    st.src.clear();
                    if queue.pop_into(&mut st.src, refill_max_frames) == 0 {
                        counters.underrun_events.fetch_add(1, Ordering::Relaxed);
                        counters
                            .underrun_frames
                            .fetch_add((frames - frame) as u64, Ordering::Relaxed);
                        data[frame * channels_out..].fill(silence);
                        break;
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_sample_mapped(&mut st, channels_out, ch);
                    data[frame * channels_out + ch] = <T as cpal::Sample>::from_sample::<f32>(sample);
                }
                filled += 1;
            }
            if filled > 0 {
                counters.played_frames.fetch_add(filled as u64, Ordering::Relaxed);
            }
        },
        |err| tracing::warn!("stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Local refill buffer owned by the callback.
struct CallbackState {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Next output sample for `dst_ch`; `st.pos` advances after the last destination channel.
///
/// mono→stereo duplicates, stereo→mono averages, other layouts clamp to the available
/// source channels.
fn next_sample_mapped(st: &mut CallbackState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }
    let frame_start = st.pos;
    let get = |ch: usize, st: &CallbackState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };
    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get(0, st) + get(1, st)),
        (1, _) => get(0, st),
        _ => get(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };
    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels;
    }
    out
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("no output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|desc| matches_device_name(&desc.to_string(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("no output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

/// Choose an output config for `target_rate`: the exact rate when a range contains it,
/// otherwise the highest rate below it, otherwise the lowest rate above it. Ties prefer
/// float sample formats.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;
    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.is_none_or(|t| rate <= t);
        let rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, rank, range.with_sample_rate(rate)));
        }
    }
    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("no supported output configs"))
}

/// Prefer the largest fixed buffer the device advertises, capped at 16k frames.
///
/// `None` leaves the device default in place.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    const MAX_FRAMES: u32 = 16_384;
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            let chosen = if *max > MAX_FRAMES {
                (*min).max(MAX_FRAMES)
            } else {
                *max
            };
            Some(cpal::BufferSize::Fixed(chosen))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout (`--list-devices`).
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("no output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below
    } else if rate != best_rate {
        if below { rate > best_rate } else { rate < best_rate }
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}
