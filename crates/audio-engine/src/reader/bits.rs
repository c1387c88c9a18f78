//! MSB-first bit reader over a byte slice.

#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    /// Read `n <= 32` bits; `None` past the end of the slice.
    pub fn read(&mut self, n: u32) -> Option<u32> {
        debug_assert!(n <= 32);
        if self.bit + n as usize > self.data.len() * 8 {
            return None;
        }
        let mut out = 0u32;
        for _ in 0..n {
            let byte = self.data[self.bit / 8];
            let v = (byte >> (7 - (self.bit % 8))) & 1;
            out = (out << 1) | v as u32;
            self.bit += 1;
        }
        Some(out)
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read(1).map(|v| v == 1)
    }

    pub fn skip(&mut self, n: usize) -> Option<()> {
        if self.bit + n > self.data.len() * 8 {
            return None;
        }
        self.bit += n;
        Some(())
    }

    pub fn bit_position(&self) -> usize {
        self.bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_across_byte_boundaries() {
        let mut r = BitReader::new(&[0b1010_1100, 0b0101_0000]);
        assert_eq!(r.read(3), Some(0b101));
        assert_eq!(r.read(7), Some(0b0110_001));
        assert_eq!(r.read_bool(), Some(false));
        assert_eq!(r.bit_position(), 11);
        assert_eq!(r.read(8), None);
    }
}
