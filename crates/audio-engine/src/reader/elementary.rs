//! Framed elementary streams (ADTS, A52, DCA) sharing one reader.
//!
//! Each format only describes its header through [`FrameSyntax`]; sync, framing, length
//! estimation and byte-interpolated seeking are common.

use std::marker::PhantomData;

use audio_stream_types::{AudioFormat, CodecId, SampleEncoding};

use super::id3::read_id3v2;
use super::sync::scan;
use super::{finish, Demux, ProcessStatus, ReadError, ReaderOptions, StreamHeader};
use crate::event::ConfigureEvent;
use crate::packet::{Packet, PacketError};
use crate::source::{ByteSource, ByteSourceExt};

/// Bytes examined when validating a frame header.
pub const HEADER_WINDOW: usize = 12;

/// Fields of one validated frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Whole frame length including the header.
    pub len: usize,
    /// Leading bytes not forwarded to the decoder.
    pub strip: usize,
    pub samples: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Format-specific bits that must stay constant across frames.
    pub config: u32,
}

/// Header syntax of one elementary format.
pub trait FrameSyntax: Send + 'static {
    const CODEC: CodecId;

    fn parse(header: &[u8; HEADER_WINDOW]) -> Option<FrameInfo>;

    /// Decoder setup derived from the first header.
    fn extra_data(_first: &FrameInfo) -> Option<Vec<u8>> {
        None
    }

    fn compatible(first: &FrameInfo, next: &FrameInfo) -> bool {
        first.sample_rate == next.sample_rate && first.channels == next.channels && first.config == next.config
    }
}

pub struct ElementaryReader<S: FrameSyntax> {
    options: ReaderOptions,
    first: Option<FrameInfo>,
    data_start: u64,
    data_end: Option<u64>,
    length: Option<u64>,
    position: u64,
    _syntax: PhantomData<S>,
}

impl<S: FrameSyntax> ElementaryReader<S> {
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            first: None,
            data_start: 0,
            data_end: None,
            length: None,
            position: 0,
            _syntax: PhantomData,
        }
    }

    fn accept(first: Option<FrameInfo>) -> impl FnMut(&[u8; HEADER_WINDOW]) -> Option<FrameInfo> {
        move |b| S::parse(b).filter(|h| first.is_none_or(|f| S::compatible(&f, h)))
    }

    /// First header whose successor (when one exists) also validates.
    fn find_first_frame(&self, src: &mut dyn ByteSource) -> Result<Option<(u64, FrameInfo)>, ReadError> {
        loop {
            let Some(hit) = scan(src, self.options.max_sync_scan, Self::accept(None))? else {
                return Ok(None);
            };
            let next_at = hit.offset + hit.value.len as u64;
            src.seek(next_at)?;
            let mut next = [0u8; HEADER_WINDOW];
            let got = src.fill(&mut next)?;
            let confirmed = got < HEADER_WINDOW || S::parse(&next).is_some_and(|n| S::compatible(&hit.value, &n));
            if confirmed {
                src.seek(hit.offset)?;
                return Ok(Some((hit.offset, hit.value)));
            }
            tracing::debug!(codec = S::CODEC.label(), offset = hit.offset, "rejecting unconfirmed sync");
            src.seek(hit.offset + 1)?;
        }
    }

    fn bytes_per_sample(&self) -> Option<f64> {
        let (end, length) = (self.data_end?, self.length?);
        (length > 0).then(|| (end - self.data_start) as f64 / length as f64)
    }
}

impl<S: FrameSyntax> Demux for ElementaryReader<S> {
    fn init(&mut self, src: &mut dyn ByteSource) -> Result<Option<StreamHeader>, ReadError> {
        let tags = read_id3v2(src)?.unwrap_or_default();
        let Some((offset, first)) = self.find_first_frame(src)? else {
            return Err(ReadError::malformed(format!("no {} frame found", S::CODEC.label())));
        };
        self.first = Some(first);
        self.data_start = offset;
        self.data_end = if src.is_serial() { None } else { src.size() };
        self.length = self.data_end.map(|end| {
            let frames = (end - offset) / first.len.max(1) as u64;
            frames * first.samples as u64
        });
        self.position = 0;

        let mut configure = ConfigureEvent::new(
            S::CODEC,
            AudioFormat::new(SampleEncoding::Encoded, first.sample_rate, first.channels),
        );
        configure.extra_data = S::extra_data(&first);
        configure.frame_samples = Some(first.samples);
        configure.stream_length = self.length;
        configure.replay_gain = tags.replay_gain;
        tracing::info!(
            codec = S::CODEC.label(),
            sample_rate = first.sample_rate,
            channels = first.channels,
            frame_len = first.len,
            length = ?self.length,
            "elementary stream"
        );
        Ok(Some(StreamHeader {
            configure,
            meta: tags.meta,
        }))
    }

    fn process(&mut self, src: &mut dyn ByteSource, packet: &mut Packet) -> Result<ProcessStatus, ReadError> {
        let Some(first) = self.first else {
            return Err(ReadError::malformed("elementary reader used before init"));
        };
        let Some(hit) = scan(src, self.options.max_sync_scan, Self::accept(Some(first)))? else {
            return finish(packet);
        };
        let frame = hit.value;
        let payload = frame.len - frame.strip;
        if payload > packet.capacity() {
            return Err(PacketError::CapacityExceeded {
                needed: payload,
                capacity: packet.capacity(),
            }
            .into());
        }
        // The window already consumed HEADER_WINDOW bytes of the frame.
        let in_window = HEADER_WINDOW.min(frame.len);
        if frame.len < HEADER_WINDOW {
            src.seek(hit.offset + frame.len as u64)?;
        }
        if frame.strip < in_window {
            packet.extend_from_slice(&hit.bytes[frame.strip..in_window])?;
        } else {
            src.skip((frame.strip - in_window) as u64)?;
        }
        let tail = frame.len - in_window.max(frame.strip);
        let start = packet.len();
        let got = src.fill(&mut packet.spare_mut()[..tail])?;
        if got < tail {
            tracing::debug!(offset = hit.offset, len = frame.len, "truncated final frame");
            packet.clear();
            return finish(packet);
        }
        packet.set_len(start + tail);
        packet.stream_position = self.position;
        packet.stream_length = self.length;
        self.position += frame.samples as u64;
        Ok(ProcessStatus::Ok)
    }

    fn seek(&mut self, src: &mut dyn ByteSource, sample: u64) -> Result<bool, ReadError> {
        let (Some(first), Some(per_sample), Some(end)) = (self.first, self.bytes_per_sample(), self.data_end) else {
            return Ok(false);
        };
        let guess = self.data_start + (sample as f64 * per_sample) as u64;
        src.seek(guess.min(end.saturating_sub(1)))?;
        let Some(hit) = scan(src, self.options.max_sync_scan, Self::accept(Some(first)))? else {
            return Ok(false);
        };
        let spf = first.samples.max(1) as u64;
        let estimate = ((hit.offset - self.data_start) as f64 / per_sample) as u64;
        self.position = estimate / spf * spf;
        src.seek(hit.offset)?;
        tracing::debug!(codec = S::CODEC.label(), sample, landed = self.position, offset = hit.offset, "byte seek");
        Ok(true)
    }

    fn can_seek(&self, src: &dyn ByteSource) -> bool {
        !src.is_serial() && self.length.is_some_and(|l| l > 0)
    }
}
