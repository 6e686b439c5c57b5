//! A writer for LSB-first packed bits.

use alloc::vec::Vec;

/// Maximum number of bits that can be written at once.
pub(crate) const MAX_WRITE_BITS: u32 = 32;

#[derive(Debug, Clone, Default)]
pub(crate) struct BitWriter {
    /// Pending bits, the oldest in the least significant position.
    bits: u32,
    /// Number of pending bits, always below 32 between calls.
    used: u32,
    buf: Vec<u8>,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append the low `n` bits of `bits`.
    #[inline]
    pub(crate) fn put_bits(&mut self, bits: u32, n: u32) {
        debug_assert!(n <= MAX_WRITE_BITS);

        if n == 0 {
            return;
        }

        let bits = if n < 32 { bits & ((1 << n) - 1) } else { bits };

        if self.used + n < 32 {
            self.bits |= bits << self.used;
            self.used += n;
        } else {
            self.put_bits_overflowing(bits, n);
        }
    }

    /// The accumulator can't hold all of `bits`: fill it up, flush it, and
    /// keep the rest.
    fn put_bits_overflowing(&mut self, bits: u32, n: u32) {
        let room = 32 - self.used;

        self.bits |= bits << self.used;
        self.buf.extend_from_slice(&self.bits.to_le_bytes());

        self.bits = bits.checked_shr(room).unwrap_or(0);
        self.used = n - room;
    }

    /// Total number of bits written so far.
    pub(crate) fn num_bits(&self) -> usize {
        self.buf.len() * 8 + self.used as usize
    }

    /// Pad the last byte with zeros and return the data.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        let tail = self.used.div_ceil(8) as usize;
        self.buf.extend_from_slice(&self.bits.to_le_bytes()[..tail]);

        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_step_writes() {
        let mut writer = BitWriter::new();
        writer.put_bits(0b1, 1);
        writer.put_bits(0b10, 2);
        writer.put_bits(0b1111, 4);
        writer.put_bits(0b1, 1);
        writer.put_bits(0xab, 8);

        assert_eq!(writer.num_bits(), 16);
        assert_eq!(writer.finish(), [0b1111_1101, 0xab]);
    }

    #[test]
    fn overflowing_write_flushes_in_two_steps() {
        let mut writer = BitWriter::new();
        writer.put_bits(0xabcde, 20);
        // 20 + 20 bits don't fit into the accumulator.
        writer.put_bits(0x12345, 20);

        assert_eq!(writer.num_bits(), 40);
        assert_eq!(writer.finish(), [0xde, 0xbc, 0x5a, 0x34, 0x12]);
    }

    #[test]
    fn full_width_write() {
        let mut writer = BitWriter::new();
        writer.put_bits(0xdead_beef, 32);
        writer.put_bits(0b101, 3);
        writer.put_bits(0xffff_ffff, 32);

        let data = writer.finish();
        assert_eq!(&data[..4], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(data[4], 0b1111_1101);
        assert_eq!(&data[5..8], &[0xff, 0xff, 0xff]);
        assert_eq!(data[8], 0b0000_0111);
        assert_eq!(data.len(), 9);
    }

    #[test]
    fn extra_bits_are_masked() {
        let mut writer = BitWriter::new();
        writer.put_bits(0xff, 3);
        writer.put_bits(0, 5);

        assert_eq!(writer.finish(), [0b0000_0111]);
    }
}
