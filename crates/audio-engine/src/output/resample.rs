//! Sample-rate conversion for devices that cannot run at the stream rate.
//!
//! Wraps Rubato's asynchronous sinc resampler in fixed-input mode: input is staged until a
//! full chunk is available, and [`StreamResampler::flush`] pushes the partial tail through at
//! end of stream.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Input frames handed to Rubato per call.
const CHUNK_FRAMES: usize = 1024;

pub struct StreamResampler {
    inner: Box<dyn Resampler<f32> + Send>,
    channels: usize,
    from_rate: u32,
    to_rate: u32,
    staged: Vec<f32>,
    scratch: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let ratio = to_rate as f64 / from_rate as f64;
        let inner = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        )
        .with_context(|| format!("create resampler {from_rate} -> {to_rate} Hz"))?;
        let scratch = vec![0.0; inner.output_frames_max() * channels];
        tracing::info!(from_rate, to_rate, channels, "resampling enabled");
        Ok(Self {
            inner: Box::new(inner),
            channels,
            from_rate,
            to_rate,
            staged: Vec::with_capacity(CHUNK_FRAMES * channels),
            scratch,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Input frames waiting for a full chunk.
    pub fn staged_frames(&self) -> usize {
        self.staged.len() / self.channels
    }

    /// Feed interleaved input; converted output is appended to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        let chunk = CHUNK_FRAMES * self.channels;
        let mut input = input;
        while !input.is_empty() {
            let take = (chunk - self.staged.len()).min(input.len());
            self.staged.extend_from_slice(&input[..take]);
            input = &input[take..];
            if self.staged.len() == chunk {
                self.run(CHUNK_FRAMES, None, out)?;
                self.staged.clear();
            }
        }
        Ok(())
    }

    /// Convert whatever is staged, padding the final partial chunk.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let frames = self.staged_frames();
        if frames == 0 {
            return Ok(());
        }
        self.staged.resize(CHUNK_FRAMES * self.channels, 0.0);
        self.run(CHUNK_FRAMES, Some(frames), out)?;
        self.staged.clear();
        Ok(())
    }

    /// Forget staged input and filter history.
    pub fn reset(&mut self) {
        self.staged.clear();
        self.inner.reset();
    }

    fn run(&mut self, frames: usize, partial: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let input = InterleavedSlice::new(&self.staged, self.channels, frames)
            .context("resampler input layout")?;
        let capacity = self.scratch.len() / self.channels;
        let mut output = InterleavedSlice::new_mut(&mut self.scratch, self.channels, capacity)
            .context("resampler output layout")?;
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: partial,
        };
        let (_consumed, produced) = self
            .inner
            .process_into_buffer(&input, &mut output, Some(&indexing))
            .context("resample chunk")?;
        out.extend_from_slice(&self.scratch[..produced * self.channels]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsampling_roughly_doubles_frame_count() {
        let mut r = StreamResampler::new(24_000, 48_000, 2).unwrap();
        let input = vec![0.0f32; 2 * 24_000];
        let mut out = Vec::new();
        r.process(&input, &mut out).unwrap();
        r.flush(&mut out).unwrap();
        let frames = out.len() / 2;
        assert!(frames > 40_000 && frames < 56_000, "{frames}");
        assert_eq!(r.staged_frames(), 0);
    }

    #[test]
    fn input_is_staged_until_a_chunk_fills() {
        let mut r = StreamResampler::new(44_100, 48_000, 1).unwrap();
        let mut out = Vec::new();
        r.process(&[0.0; 100], &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(r.staged_frames(), 100);
        r.reset();
        assert_eq!(r.staged_frames(), 0);
    }
}
