//! A reader for LSB-first packed bits, as used by lossless images.

use crate::Refill;

/// Number of bits in the prefetch window.
const WINDOW_BITS: u32 = 64;
/// Number of bits that are guaranteed to be valid after a refill.
const REFILL_BITS: u32 = 32;
/// Maximum number of bits that can be read at once.
pub(crate) const MAX_READ_BITS: u32 = 24;

/// A position in a bit stream that survives reallocation of the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BitReaderState {
    /// Number of bits consumed from the start of the data.
    bit_offset: usize,
    eos: bool,
}

impl BitReaderState {
    pub(crate) fn byte_offset(&self) -> usize {
        self.bit_offset / 8
    }

    /// Move the state back by `bytes` whole bytes, used when the data before
    /// it was discarded.
    pub(crate) fn rebase(&mut self, bytes: usize) {
        self.bit_offset -= bytes * 8;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    /// The prefetch window; bit 0 is the bit at `start * 8`.
    value: u64,
    /// Byte offset of the first byte in the window.
    start: usize,
    /// Byte offset of the next byte to load into the window.
    pos: usize,
    /// Number of bits consumed from the window.
    bit_pos: u32,
    eos: bool,
    refill: Refill,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8], refill: Refill) -> Self {
        Self::at(data, 0, refill)
    }

    /// Continue reading from `state`, re-deriving the window from `data`.
    pub(crate) fn resume(data: &'a [u8], state: BitReaderState, refill: Refill) -> Self {
        let mut reader = Self::at(data, state.bit_offset, refill);
        reader.eos |= state.eos;

        reader
    }

    fn at(data: &'a [u8], bit_offset: usize, refill: Refill) -> Self {
        let start = (bit_offset / 8).min(data.len());
        let end = (start + 8).min(data.len());
        let mut value = 0;

        for (i, byte) in data[start..end].iter().enumerate() {
            value |= (*byte as u64) << (8 * i);
        }

        let mut reader = Self {
            data,
            value,
            start,
            pos: end,
            bit_pos: (bit_offset - start * 8) as u32,
            eos: false,
            refill,
        };

        if reader.is_end_of_stream() {
            reader.set_end_of_stream();
        }

        reader
    }

    pub(crate) fn state(&self) -> BitReaderState {
        BitReaderState {
            bit_offset: self.bit_offset(),
            eos: self.eos,
        }
    }

    #[inline(always)]
    pub(crate) fn bit_offset(&self) -> usize {
        self.start * 8 + self.bit_pos as usize
    }

    #[inline(always)]
    pub(crate) fn eos(&self) -> bool {
        self.eos
    }

    /// Whether more bits were consumed than the data holds.
    #[inline(always)]
    pub(crate) fn is_end_of_stream(&self) -> bool {
        self.eos || (self.pos == self.data.len() && self.bit_offset() > self.data.len() * 8)
    }

    /// Read the next `n` bits, least significant bit first.
    ///
    /// Returns 0 and flags the end of the stream if `n` exceeds
    /// [`MAX_READ_BITS`] or the stream has already ended.
    #[inline(always)]
    pub(crate) fn read_bits(&mut self, n: u32) -> u32 {
        if !self.eos && n <= MAX_READ_BITS {
            let val = self.prefetch_bits() & ((1_u32 << n) - 1);
            self.bit_pos += n;
            self.shift_bytes();

            val
        } else {
            self.set_end_of_stream();
            0
        }
    }

    #[inline(always)]
    pub(crate) fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    /// Return the bits in the window without consuming them.
    #[inline(always)]
    pub(crate) fn prefetch_bits(&self) -> u32 {
        (self.value >> (self.bit_pos & (WINDOW_BITS - 1))) as u32
    }

    /// Consume `n` bits that were already inspected via
    /// [`BitReader::prefetch_bits`].
    #[inline(always)]
    pub(crate) fn skip_bits(&mut self, n: u32) {
        self.bit_pos += n;
    }

    /// Make sure at least 32 bits are available in the window.
    #[inline(always)]
    pub(crate) fn fill_bit_window(&mut self) {
        if self.bit_pos >= REFILL_BITS {
            self.do_fill_bit_window();
        }
    }

    fn do_fill_bit_window(&mut self) {
        if self.refill == Refill::Wide && self.pos + 8 < self.data.len() {
            let mut buf = [0; 4];
            buf.copy_from_slice(&self.data[self.pos..self.pos + 4]);

            self.value >>= 32;
            self.value |= (u32::from_le_bytes(buf) as u64) << (WINDOW_BITS - 32);
            self.bit_pos -= 32;
            self.start += 4;
            self.pos += 4;
        } else {
            self.shift_bytes();
        }
    }

    #[inline(always)]
    fn shift_bytes(&mut self) {
        while self.bit_pos >= 8 && self.pos < self.data.len() {
            self.value >>= 8;
            self.value |= (self.data[self.pos] as u64) << (WINDOW_BITS - 8);
            self.pos += 1;
            self.start += 1;
            self.bit_pos -= 8;
        }

        if self.is_end_of_stream() {
            self.set_end_of_stream();
        }
    }

    pub(crate) fn set_end_of_stream(&mut self) {
        self.eos = true;
        // Keep the window shifts in range.
        self.bit_pos = 0;
    }
}
