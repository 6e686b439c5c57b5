//! The boolean entropy decoder used by lossy frames (RFC 6386, Section 7).
//!
//! Every call to [`RangeDecoder::read_bit`] decodes one binary decision whose
//! probability of being zero is given as an 8-bit value. The decoder never
//! fails: once the data is exhausted it keeps feeding zero bits and remembers
//! that it did so in a sticky `eof` flag, which the owning decode step checks
//! at its own checkpoints.

use crate::Refill;

/// Number of bits loaded at once in [`Refill::Wide`] mode.
const WIDE_BITS: i32 = 56;

/// The resumable part of a range decoder.
///
/// All positions are relative to the start of the partition the decoder was
/// created for, so a state can be carried over to a new (longer or moved)
/// view of the same partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeDecoderState {
    /// The current value, with `bits` unread bits below the active window.
    value: u64,
    /// The current range minus one, in `[127, 254]`.
    range: u32,
    /// Number of valid bits left in `value`.
    bits: i32,
    /// Position of the next byte to load.
    pos: usize,
    /// Whether we ran past the end of the data.
    eof: bool,
}

impl RangeDecoderState {
    pub(crate) fn new() -> Self {
        Self {
            value: 0,
            range: 255 - 1,
            bits: -8,
            pos: 0,
            eof: false,
        }
    }
}

/// A boolean decoder over a borrowed partition.
#[derive(Debug)]
pub(crate) struct RangeDecoder<'a> {
    data: &'a [u8],
    state: RangeDecoderState,
    refill: Refill,
}

impl<'a> RangeDecoder<'a> {
    /// Start decoding a new partition.
    pub(crate) fn new(data: &'a [u8], refill: Refill) -> Self {
        let mut decoder = Self {
            data,
            state: RangeDecoderState::new(),
            refill,
        };
        decoder.load_new_bytes();

        decoder
    }

    /// Continue decoding from a previously saved state.
    ///
    /// `data` must start at the same partition offset as the data the state
    /// was taken from and must not be shorter than it.
    pub(crate) fn resume(data: &'a [u8], state: RangeDecoderState, refill: Refill) -> Self {
        debug_assert!(state.pos <= data.len());

        Self {
            data,
            state,
            refill,
        }
    }

    pub(crate) fn state(&self) -> RangeDecoderState {
        self.state
    }

    pub(crate) fn eof(&self) -> bool {
        self.state.eof
    }

    /// Decode one decision whose likelihood of being zero is `prob / 256`.
    #[inline(always)]
    pub(crate) fn read_bit(&mut self, prob: u8) -> bool {
        if self.state.bits < 0 {
            self.load_new_bytes();
        }

        let s = &mut self.state;
        let pos = s.bits;
        let mut range = s.range;
        let split = (range * prob as u32) >> 8;
        let value = (s.value >> pos) as u32;
        let bit = value > split;

        if bit {
            range -= split;
            s.value -= ((split + 1) as u64) << pos;
        } else {
            range = split + 1;
        }

        let shift = 7 ^ range.ilog2();
        range <<= shift;
        s.bits -= shift as i32;
        s.range = range - 1;

        bit
    }

    /// Read an `n`-bit unsigned value, most significant bit first.
    #[inline]
    pub(crate) fn read_value(&mut self, n: u32) -> u32 {
        let mut v = 0;

        for i in (0..n).rev() {
            v |= (self.read_bit(0x80) as u32) << i;
        }

        v
    }

    /// Read a single flag at probability one half.
    #[inline]
    pub(crate) fn read_flag(&mut self) -> bool {
        self.read_bit(0x80)
    }

    /// Read an `n`-bit magnitude followed by a sign bit.
    pub(crate) fn read_signed_value(&mut self, n: u32) -> i32 {
        let value = self.read_value(n) as i32;

        if self.read_flag() { -value } else { value }
    }

    /// Read an optional signed value: a presence flag, then the value itself.
    pub(crate) fn read_optional_signed_value(&mut self, n: u32) -> i32 {
        if self.read_flag() {
            self.read_signed_value(n)
        } else {
            0
        }
    }

    /// Attach a sign to `magnitude` using one decision at probability one half.
    #[inline(always)]
    pub(crate) fn read_signed(&mut self, magnitude: i32) -> i32 {
        if self.read_bit(0x80) {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Walk a tree in the RFC 6386 layout: positive entries index the next
    /// node pair, non-positive entries are negated leaf values.
    pub(crate) fn read_tree(&mut self, tree: &[i8], probs: &[u8]) -> i8 {
        self.read_tree_from(tree, probs, 0)
    }

    /// Walk `tree` starting at the node pair at `start`.
    pub(crate) fn read_tree_from(&mut self, tree: &[i8], probs: &[u8], start: usize) -> i8 {
        let mut index = start;

        loop {
            let bit = self.read_bit(probs[index >> 1]) as usize;
            let next = tree[index + bit];

            if next <= 0 {
                return -next;
            }

            index = next as usize;
        }
    }

    #[inline(always)]
    fn load_new_bytes(&mut self) {
        let s = &mut self.state;

        if self.refill == Refill::Wide && self.data.len().saturating_sub(s.pos) >= 8 {
            let mut buf = [0; 8];
            buf.copy_from_slice(&self.data[s.pos..s.pos + 8]);
            let bits = u64::from_be_bytes(buf) >> (64 - WIDE_BITS);

            s.pos += (WIDE_BITS >> 3) as usize;
            s.value = bits | (s.value << WIDE_BITS);
            s.bits += WIDE_BITS;
        } else {
            self.load_final_bytes();
        }
    }

    /// Load a single byte, or pad with zeros once the data is exhausted.
    fn load_final_bytes(&mut self) {
        let s = &mut self.state;

        if let Some(&byte) = self.data.get(s.pos) {
            s.bits += 8;
            s.value = byte as u64 | (s.value << 8);
            s.pos += 1;
        } else if !s.eof {
            s.value <<= 8;
            s.bits += 8;
            s.eof = true;
        } else {
            // Keep shifts in range, every further bit reads as zero.
            s.bits = 0;
        }
    }
}
