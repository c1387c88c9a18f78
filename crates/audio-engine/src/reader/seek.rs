//! Interpolate-then-correct seeking shared by readers without an exact index.
//!
//! The search keeps a byte/sample bracket `[lo, hi]` around the target. Each step guesses a
//! byte offset by linear interpolation inside the bracket, resyncs to the next frame there
//! and narrows the bracket with that frame's sample number. When the bracket stops shrinking
//! the search walks frames forward from `lo`.

use super::ReadError;
use crate::source::ByteSource;

/// A frame located by [`SeekProbe::probe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameProbe {
    /// Byte offset of the frame header.
    pub offset: u64,
    /// First sample of the frame.
    pub sample: u64,
    /// Samples per channel in the frame.
    pub samples: u64,
    /// Frame length in bytes; `0` when unknown.
    pub len: u64,
}

impl FrameProbe {
    pub fn contains(&self, sample: u64) -> bool {
        sample >= self.sample && sample < self.sample + self.samples.max(1)
    }

    fn next_offset(&self) -> u64 {
        self.offset + self.len.max(1)
    }
}

/// Reader-side hook: find the first frame at or after a byte offset.
pub trait SeekProbe {
    fn probe(&mut self, src: &mut dyn ByteSource, offset: u64) -> Result<Option<FrameProbe>, ReadError>;
}

/// Byte/sample extent of the searchable audio.
#[derive(Clone, Copy, Debug)]
pub struct SeekRange {
    pub first_byte: u64,
    /// Sample number of the frame at `first_byte`.
    pub first_sample: u64,
    pub end_byte: u64,
    /// Sample number at `end_byte` (the stream length when it is the end of the audio).
    pub end_sample: u64,
}

impl SeekRange {
    /// The whole stream: `[first_byte, end_byte)` holding samples `[0, total)`.
    pub fn whole(first_byte: u64, end_byte: u64, total: u64) -> Self {
        Self {
            first_byte,
            first_sample: 0,
            end_byte,
            end_sample: total,
        }
    }
}

/// Cap on frames visited by the final linear walk.
const MAX_LINEAR_FRAMES: usize = 4096;

/// Locate the frame containing `target`, or the last frame before it.
pub fn bisect_seek(
    prober: &mut dyn SeekProbe,
    src: &mut dyn ByteSource,
    range: SeekRange,
    target: u64,
    iterations: usize,
) -> Result<Option<FrameProbe>, ReadError> {
    let (mut lo_off, mut lo_sample) = (range.first_byte, range.first_sample);
    let (mut hi_off, mut hi_sample) = (range.end_byte, range.end_sample.max(lo_sample + 1));
    let target = target.clamp(lo_sample, hi_sample - 1);

    for step in 0..iterations {
        if hi_off <= lo_off + 1 || hi_sample <= lo_sample {
            break;
        }
        let ratio = (target.saturating_sub(lo_sample)) as f64 / (hi_sample - lo_sample) as f64;
        let guess = lo_off + ((hi_off - lo_off) as f64 * ratio.clamp(0.0, 1.0)) as u64;
        let guess = guess.min(hi_off - 1);
        let Some(frame) = prober.probe(src, guess)? else {
            hi_off = guess;
            continue;
        };
        tracing::trace!(step, guess, frame_sample = frame.sample, target, "seek probe");
        if frame.contains(target) {
            return Ok(Some(frame));
        }
        if frame.sample > target {
            if guess <= lo_off {
                break;
            }
            hi_off = guess;
            hi_sample = frame.sample;
        } else {
            if frame.offset <= lo_off && step > 0 {
                lo_off = frame.next_offset();
                lo_sample = frame.sample + frame.samples;
                continue;
            }
            lo_off = frame.offset;
            lo_sample = frame.sample;
        }
    }

    // Walk forward from the lower bound.
    let mut last = None;
    let mut at = lo_off;
    for _ in 0..MAX_LINEAR_FRAMES {
        let Some(frame) = prober.probe(src, at)? else {
            break;
        };
        if frame.sample > target {
            break;
        }
        last = Some(frame);
        if frame.contains(target) {
            break;
        }
        at = frame.next_offset();
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    /// Frames of varying size; sample numbers are recoverable from each frame.
    struct FakeFrames {
        frames: Vec<FrameProbe>,
        probes: usize,
    }

    impl FakeFrames {
        fn new(count: usize) -> Self {
            let mut frames = Vec::new();
            let mut offset = 100;
            for i in 0..count as u64 {
                let len = 200 + (i * 37) % 300;
                frames.push(FrameProbe {
                    offset,
                    sample: i * 1152,
                    samples: 1152,
                    len,
                });
                offset += len;
            }
            Self { frames, probes: 0 }
        }

        fn end(&self) -> u64 {
            let last = self.frames.last().unwrap();
            last.offset + last.len
        }
    }

    impl SeekProbe for FakeFrames {
        fn probe(&mut self, _src: &mut dyn ByteSource, offset: u64) -> Result<Option<FrameProbe>, ReadError> {
            self.probes += 1;
            Ok(self.frames.iter().find(|f| f.offset >= offset).copied())
        }
    }

    #[test]
    fn converges_within_one_frame() {
        let mut frames = FakeFrames::new(500);
        let range = SeekRange::whole(100, frames.end(), 500 * 1152);
        let mut src = MemorySource::new(Vec::new());
        for target in [0u64, 1, 1151, 1152, 100_000, 287_999, 500 * 1152 - 1] {
            let f = bisect_seek(&mut frames, &mut src, range, target, 24).unwrap().unwrap();
            assert!(f.contains(target), "target {target} landed at {f:?}");
        }
    }

    #[test]
    fn bounded_probe_count() {
        let mut frames = FakeFrames::new(2000);
        let range = SeekRange::whole(100, frames.end(), 2000 * 1152);
        let mut src = MemorySource::new(Vec::new());
        bisect_seek(&mut frames, &mut src, range, 1_234_567, 24).unwrap().unwrap();
        assert!(frames.probes < 200, "{} probes", frames.probes);
    }

    #[test]
    fn narrowed_range_starts_from_its_lower_bound() {
        let mut frames = FakeFrames::new(300);
        let lo = frames.frames[100];
        let hi = frames.frames[200];
        let range = SeekRange {
            first_byte: lo.offset,
            first_sample: lo.sample,
            end_byte: hi.offset,
            end_sample: hi.sample,
        };
        let mut src = MemorySource::new(Vec::new());
        let f = bisect_seek(&mut frames, &mut src, range, 150 * 1152 + 7, 24).unwrap().unwrap();
        assert_eq!(f.sample, 150 * 1152);
    }
}
