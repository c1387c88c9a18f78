//! Output backends.
//!
//! The output stage drives one [`OutputBackend`] with interleaved `f32` PCM. A backend may
//! block inside [`OutputBackend::write`] and [`OutputBackend::drain`], but never for longer
//! than one poll slice, so the stage keeps observing control messages while the device is
//! full or paused.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use audio_stream_types::AudioFormat;

pub mod device;
pub mod resample;

pub use device::{CpalOutput, CpalOutputConfig};

/// Upper bound for one blocking wait inside a backend call.
pub const POLL_SLICE: Duration = Duration::from_millis(20);

/// Device contract used by the output stage.
pub trait OutputBackend: Send {
    fn name(&self) -> &str;

    /// Prepare the device for `format`. Called before the first write and on format changes.
    fn configure(&mut self, format: &AudioFormat) -> Result<()>;

    /// Queue interleaved samples. Returns how many were accepted (whole frames); `0` means the
    /// device stayed full for a poll slice.
    fn write(&mut self, samples: &[f32]) -> Result<usize>;

    /// Frames accepted but not yet audible, at the configured rate.
    fn delay(&self) -> u64;

    /// Throw away everything queued (flush or stop).
    fn discard(&mut self);

    /// Push any staged audio to the device and wait up to a poll slice for playback to finish.
    /// Returns `true` once nothing is left to play.
    fn drain(&mut self) -> Result<bool>;

    fn pause(&mut self, paused: bool);
}

#[derive(Debug, Default)]
struct Captured {
    formats: Vec<AudioFormat>,
    samples: Vec<f32>,
    discarded: usize,
}

/// Backend that records everything written to it; cloned handles share the capture.
#[derive(Clone, Debug, Default)]
pub struct MemoryOutput {
    captured: Arc<Mutex<Captured>>,
    configured: bool,
    channels: usize,
    paused: bool,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples written so far, interleaved.
    pub fn samples(&self) -> Vec<f32> {
        self.captured.lock().unwrap().samples.clone()
    }

    /// Every format the backend was configured with, in order.
    pub fn formats(&self) -> Vec<AudioFormat> {
        self.captured.lock().unwrap().formats.clone()
    }

    /// How many times the stage asked this backend to discard queued audio.
    pub fn discard_calls(&self) -> usize {
        self.captured.lock().unwrap().discarded
    }
}

impl OutputBackend for MemoryOutput {
    fn name(&self) -> &str {
        "memory"
    }

    fn configure(&mut self, format: &AudioFormat) -> Result<()> {
        if format.channels == 0 {
            bail!("cannot configure zero channels");
        }
        self.channels = format.channels as usize;
        self.configured = true;
        self.captured.lock().unwrap().formats.push(format.clone());
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        if !self.configured {
            bail!("write before configure");
        }
        if self.paused {
            thread::sleep(POLL_SLICE);
            return Ok(0);
        }
        let take = samples.len() / self.channels * self.channels;
        self.captured
            .lock()
            .unwrap()
            .samples
            .extend_from_slice(&samples[..take]);
        Ok(take)
    }

    fn delay(&self) -> u64 {
        0
    }

    fn discard(&mut self) {
        self.captured.lock().unwrap().discarded += 1;
    }

    fn drain(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn pause(&mut self, paused: bool) {
        self.paused = paused;
    }
}

/// Backend that accepts and forgets samples immediately.
#[derive(Debug, Default)]
pub struct NullOutput {
    configured: Option<AudioFormat>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputBackend for NullOutput {
    fn name(&self) -> &str {
        "null"
    }

    fn configure(&mut self, format: &AudioFormat) -> Result<()> {
        self.configured = Some(format.clone());
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<usize> {
        match &self.configured {
            Some(_) => Ok(samples.len()),
            None => bail!("write before configure"),
        }
    }

    fn delay(&self) -> u64 {
        0
    }

    fn discard(&mut self) {}

    fn drain(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn pause(&mut self, _paused: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use audio_stream_types::SampleEncoding;

    #[test]
    fn memory_output_keeps_whole_frames() {
        let mut out = MemoryOutput::new();
        let view = out.clone();
        out.configure(&AudioFormat::new(SampleEncoding::F32Le, 48_000, 2))
            .unwrap();
        assert_eq!(out.write(&[0.1, 0.2, 0.3]).unwrap(), 2);
        assert_eq!(view.samples(), vec![0.1, 0.2]);
        assert_eq!(view.formats().len(), 1);
    }

    #[test]
    fn memory_output_refuses_writes_while_paused() {
        let mut out = MemoryOutput::new();
        out.configure(&AudioFormat::new(SampleEncoding::F32Le, 48_000, 1))
            .unwrap();
        out.pause(true);
        assert_eq!(out.write(&[1.0]).unwrap(), 0);
        out.pause(false);
        assert_eq!(out.write(&[1.0]).unwrap(), 1);
    }

    #[test]
    fn write_before_configure_fails() {
        assert!(MemoryOutput::new().write(&[0.0]).is_err());
        assert!(NullOutput::new().write(&[0.0]).is_err());
    }
}
