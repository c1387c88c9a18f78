//! A52 (AC-3) elementary streams.

use audio_stream_types::CodecId;

use super::bits::BitReader;
use super::elementary::{FrameInfo, FrameSyntax, HEADER_WINDOW};

pub const SAMPLES_PER_FRAME: u32 = 1536;

/// Nominal bitrate in kbit/s, indexed by `frmsizecod / 2`.
const BITRATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];

const SAMPLE_RATES: [u32; 3] = [48_000, 44_100, 32_000];

/// Full-bandwidth channels by `acmod`.
const ACMOD_CHANNELS: [u16; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// Frame length in 16-bit words.
pub fn frame_words(fscod: u8, frmsizecod: u8) -> Option<u32> {
    let kbps = *BITRATES.get(frmsizecod as usize / 2)?;
    match fscod {
        0 => Some(kbps * 2),
        1 => Some(kbps * 320 / 147 + (frmsizecod & 1) as u32),
        2 => Some(kbps * 3),
        _ => None,
    }
}

pub struct A52Syntax;

impl FrameSyntax for A52Syntax {
    const CODEC: CodecId = CodecId::A52;

    fn parse(h: &[u8; HEADER_WINDOW]) -> Option<FrameInfo> {
        if h[0] != 0x0B || h[1] != 0x77 {
            return None;
        }
        let fscod = h[4] >> 6;
        let frmsizecod = h[4] & 0x3F;
        let bsid = h[5] >> 3;
        if bsid > 8 {
            return None;
        }
        let words = frame_words(fscod, frmsizecod)?;
        let mut bits = BitReader::new(&h[6..]);
        let acmod = bits.read(3)? as u8;
        if acmod & 0x1 != 0 && acmod != 0x1 {
            bits.skip(2)?;
        }
        if acmod & 0x4 != 0 {
            bits.skip(2)?;
        }
        if acmod == 0x2 {
            bits.skip(2)?;
        }
        let lfe = bits.read_bool()?;
        Some(FrameInfo {
            len: words as usize * 2,
            strip: 0,
            samples: SAMPLES_PER_FRAME,
            sample_rate: SAMPLE_RATES[fscod as usize],
            channels: ACMOD_CHANNELS[acmod as usize] + lfe as u16,
            config: (acmod as u32) << 1 | lfe as u32,
        })
    }
}
