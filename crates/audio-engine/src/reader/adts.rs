//! Raw AAC in ADTS framing.

use audio_stream_types::CodecId;

use super::elementary::{FrameInfo, FrameSyntax, HEADER_WINDOW};

pub const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000, 7_350,
];

pub struct AdtsSyntax;

/// `config` layout: profile << 8 | sampling index << 4 | channel configuration.
fn unpack(config: u32) -> (u8, u8, u8) {
    ((config >> 8) as u8, (config >> 4 & 0xF) as u8, (config & 0xF) as u8)
}

/// Two-byte AudioSpecificConfig for an ADTS profile / rate index / channel configuration.
pub fn audio_specific_config(profile: u8, rate_index: u8, channel_config: u8) -> [u8; 2] {
    let object_type = profile + 1;
    [
        object_type << 3 | rate_index >> 1,
        (rate_index & 1) << 7 | channel_config << 3,
    ]
}

impl FrameSyntax for AdtsSyntax {
    const CODEC: CodecId = CodecId::Aac;

    fn parse(h: &[u8; HEADER_WINDOW]) -> Option<FrameInfo> {
        if h[0] != 0xFF || h[1] & 0xF6 != 0xF0 {
            return None;
        }
        let protection_absent = h[1] & 0x01 == 1;
        let profile = h[2] >> 6;
        let rate_index = h[2] >> 2 & 0xF;
        let channel_config = (h[2] & 0x01) << 2 | h[3] >> 6;
        let len = ((h[3] & 0x03) as usize) << 11 | (h[4] as usize) << 3 | (h[5] >> 5) as usize;
        let blocks = (h[6] & 0x03) as u32 + 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let sample_rate = *SAMPLE_RATES.get(rate_index as usize)?;
        if channel_config == 0 || profile == 3 || len <= header_len {
            return None;
        }
        Some(FrameInfo {
            len,
            strip: header_len,
            samples: 1024 * blocks,
            sample_rate,
            channels: if channel_config == 7 { 8 } else { channel_config as u16 },
            config: (profile as u32) << 8 | (rate_index as u32) << 4 | channel_config as u32,
        })
    }

    fn extra_data(first: &FrameInfo) -> Option<Vec<u8>> {
        let (profile, rate_index, channel_config) = unpack(first.config);
        Some(audio_specific_config(profile, rate_index, channel_config).to_vec())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    /// AAC-LC, 44.1 kHz stereo, no CRC.
    pub fn adts_frame(payload: &[u8]) -> Vec<u8> {
        let len = payload.len() + 7;
        let mut f = vec![
            0xFF,
            0xF1,
            (1 << 6) | (4 << 2),
            (2 << 6) | ((len >> 11) & 0x3) as u8,
            (len >> 3) as u8,
            ((len & 0x7) << 5) as u8 | 0x1F,
            0xFC,
        ];
        f.extend_from_slice(payload);
        f
    }
}
