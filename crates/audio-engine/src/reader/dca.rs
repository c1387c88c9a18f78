//! DCA (DTS) core elementary streams, 16-bit big-endian sync only.

use audio_stream_types::CodecId;

use super::bits::BitReader;
use super::elementary::{FrameInfo, FrameSyntax, HEADER_WINDOW};

pub const SYNC: [u8; 4] = [0x7F, 0xFE, 0x80, 0x01];

/// Core sample rates by SFREQ; zero marks an invalid code.
const SAMPLE_RATES: [u32; 16] = [
    0, 8_000, 16_000, 32_000, 0, 0, 11_025, 22_050, 44_100, 0, 0, 12_000, 24_000, 48_000, 0, 0,
];

/// Channels by AMODE (codes above 15 are user defined).
const AMODE_CHANNELS: [u16; 16] = [1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 6, 6, 6, 7, 8, 8];

pub struct DcaSyntax;

impl FrameSyntax for DcaSyntax {
    const CODEC: CodecId = CodecId::Dca;

    fn parse(h: &[u8; HEADER_WINDOW]) -> Option<FrameInfo> {
        if h[..4] != SYNC {
            return None;
        }
        let mut bits = BitReader::new(&h[4..]);
        bits.skip(7)?;
        let nblks = bits.read(7)?;
        let fsize = bits.read(14)?;
        let amode = bits.read(6)?;
        let sfreq = bits.read(4)?;
        bits.skip(15)?;
        let lff = bits.read(2)?;
        let sample_rate = SAMPLE_RATES[sfreq as usize];
        if nblks < 5 || fsize < 95 || sample_rate == 0 || lff == 3 {
            return None;
        }
        let channels = *AMODE_CHANNELS.get(amode as usize)?;
        Some(FrameInfo {
            len: fsize as usize + 1,
            strip: 0,
            samples: (nblks + 1) * 32,
            sample_rate,
            channels: channels + (lff != 0) as u16,
            config: amode << 2 | lff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pack `(value, width)` fields after the sync word.
    fn header(fields: &[(u32, u32)]) -> [u8; HEADER_WINDOW] {
        let mut out = [0u8; HEADER_WINDOW];
        out[..4].copy_from_slice(&SYNC);
        let mut bit = 32usize;
        for &(value, width) in fields {
            for i in (0..width).rev() {
                if value >> i & 1 == 1 {
                    out[bit / 8] |= 0x80 >> (bit % 8);
                }
                bit += 1;
            }
        }
        out
    }

    fn core(nblks: u32, fsize: u32, amode: u32, sfreq: u32, lff: u32) -> [u8; HEADER_WINDOW] {
        header(&[
            (1, 1),
            (31, 5),
            (0, 1),
            (nblks, 7),
            (fsize, 14),
            (amode, 6),
            (sfreq, 4),
            (15, 5),
            (0, 10),
            (lff, 2),
        ])
    }

    #[test]
    fn parses_five_one_core() {
        let info = DcaSyntax::parse(&core(15, 2012, 9, 13, 1)).unwrap();
        assert_eq!(info.len, 2013);
        assert_eq!(info.samples, 512);
        assert_eq!(info.sample_rate, 48_000);
        assert_eq!(info.channels, 6);
    }

    #[test]
    fn rejects_invalid_fields() {
        assert!(DcaSyntax::parse(&core(15, 2012, 9, 4, 0)).is_none());
        assert!(DcaSyntax::parse(&core(3, 2012, 9, 13, 0)).is_none());
        assert!(DcaSyntax::parse(&core(15, 50, 9, 13, 0)).is_none());
        assert!(DcaSyntax::parse(&core(15, 2012, 20, 13, 0)).is_none());
        assert!(DcaSyntax::parse(&core(15, 2012, 9, 13, 3)).is_none());
    }
}
