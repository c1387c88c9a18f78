use crate::reader::ReaderOptions;

/// Engine tuning parameters shared by the input/decode/output stages.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Encoded packets in the decoder pool (input → decode).
    pub decoder_packets: usize,
    /// Fixed capacity of one encoded packet, in bytes.
    pub decoder_packet_bytes: usize,
    /// PCM packets in the output pool (decode → output).
    pub output_packets: usize,
    /// Fixed capacity of one PCM packet, in bytes.
    pub output_packet_bytes: usize,
    /// Target device queue duration for the CPAL backend.
    pub buffer_seconds: f32,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Samples rewound before an Opus seek target so the codec state settles.
    pub opus_preroll_samples: u64,
    /// Probe iterations for the interpolate-then-bisect seek fallback.
    pub seek_bisect_iterations: usize,
}

impl Default for EngineConfig {
    /// Defaults sized for a couple of seconds of compressed audio in flight.
    fn default() -> Self {
        Self {
            decoder_packets: 64,
            decoder_packet_bytes: 64 * 1024,
            output_packets: 32,
            output_packet_bytes: 32 * 1024,
            buffer_seconds: 2.0,
            refill_max_frames: 4096,
            opus_preroll_samples: 3840,
            seek_bisect_iterations: 24,
        }
    }
}

impl EngineConfig {
    /// Reader knobs derived from this configuration.
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            opus_preroll_samples: self.opus_preroll_samples,
            seek_bisect_iterations: self.seek_bisect_iterations,
            ..ReaderOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pools_are_non_empty() {
        let cfg = EngineConfig::default();
        assert!(cfg.decoder_packets > 0);
        assert!(cfg.output_packets > 0);
        assert!(cfg.output_packet_bytes % 4 == 0);
    }
}
