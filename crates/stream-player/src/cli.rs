use clap::{Parser, Subcommand};

use crate::config::{PlayConfig, ProbeConfig};
use audio_engine::EngineConfig;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "stream-player", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Device queue target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Encoded packets buffered between reader and decoder
    #[arg(long, default_value_t = 64)]
    pub decoder_packets: usize,

    /// Decoded packets buffered between decoder and device
    #[arg(long, default_value_t = 32)]
    pub output_packets: usize,

    /// Size of one encoded packet buffer in bytes
    #[arg(long, default_value_t = 64 * 1024)]
    pub packet_bytes: usize,

    /// HTTP connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// How many playlist hops to follow before giving up
    #[arg(long, default_value_t = 4)]
    pub max_redirects: usize,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play files or URLs back to back
    Play {
        /// Paths or http(s) URLs
        #[arg(required = true)]
        inputs: Vec<String>,
    },

    /// Print the stream header of a file or URL as JSON
    Probe {
        /// Path or http(s) URL
        input: String,
    },
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            decoder_packets: self.decoder_packets,
            decoder_packet_bytes: self.packet_bytes,
            output_packets: self.output_packets,
            buffer_seconds: self.buffer_seconds,
            refill_max_frames: self.refill_max_frames,
            ..EngineConfig::default()
        }
    }

    pub fn play_config(&self, inputs: Vec<String>) -> PlayConfig {
        PlayConfig {
            inputs,
            device: self.device.clone(),
            engine: self.engine_config(),
            connect_timeout_secs: self.connect_timeout_secs,
            max_redirects: self.max_redirects,
        }
    }

    pub fn probe_config(&self, input: String) -> ProbeConfig {
        ProbeConfig {
            input,
            engine: self.engine_config(),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_takes_several_inputs_and_engine_flags() {
        let args = Args::try_parse_from([
            "stream-player",
            "--decoder-packets",
            "8",
            "--packet-bytes",
            "4096",
            "play",
            "a.flac",
            "http://radio.example/stream.mp3",
        ])
        .unwrap();
        let Some(Command::Play { inputs }) = args.cmd.as_ref() else {
            panic!("expected play");
        };
        assert_eq!(inputs.len(), 2);
        let cfg = args.engine_config();
        assert_eq!(cfg.decoder_packets, 8);
        assert_eq!(cfg.decoder_packet_bytes, 4096);
        assert_eq!(cfg.output_packets, 32);
    }

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["stream-player", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
    }

    #[test]
    fn play_without_inputs_is_rejected() {
        assert!(Args::try_parse_from(["stream-player", "play"]).is_err());
    }
}
