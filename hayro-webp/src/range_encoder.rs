//! The boolean entropy encoder, the exact inverse of the
//! [range decoder](crate::range_decoder).

use alloc::vec::Vec;

/// A boolean encoder writing into an owned buffer.
///
/// Output bytes equal to `0xff` are not written right away. A later carry
/// may still ripple through them, so they are only counted in `run` until
/// the next byte that isn't `0xff` resolves whether they turn into `0x00`
/// (carry) or stay `0xff`.
#[derive(Debug, Clone)]
pub(crate) struct RangeEncoder {
    /// Range minus one, in `[127, 254]` between calls.
    range: u32,
    value: u32,
    /// Number of pending `0xff` bytes.
    run: usize,
    /// Number of pending bits in `value`, minus 8.
    nb_bits: i32,
    buf: Vec<u8>,
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeEncoder {
    pub(crate) fn new() -> Self {
        Self {
            range: 255 - 1,
            value: 0,
            run: 0,
            nb_bits: -8,
            buf: Vec::new(),
        }
    }

    /// Encode one decision whose likelihood of being zero is `prob / 256`.
    pub(crate) fn put_bit(&mut self, bit: bool, prob: u8) -> bool {
        let split = (self.range * prob as u32) >> 8;

        if bit {
            self.value += split + 1;
            self.range -= split + 1;
        } else {
            self.range = split;
        }

        if self.range < 127 {
            let shift = 7 ^ (self.range + 1).ilog2();
            self.range = ((self.range + 1) << shift) - 1;
            self.value <<= shift;
            self.nb_bits += shift as i32;

            if self.nb_bits > 0 {
                self.flush();
            }
        }

        bit
    }

    pub(crate) fn put_bit_uniform(&mut self, bit: bool) -> bool {
        self.put_bit(bit, 0x80)
    }

    /// Write `n` bits of `value`, most significant bit first.
    pub(crate) fn put_bits(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.put_bit_uniform((value >> i) & 1 != 0);
        }
    }

    /// Write a presence flag, then magnitude and sign if `value` is nonzero.
    pub(crate) fn put_signed_bits(&mut self, value: i32, n: u32) {
        if !self.put_bit_uniform(value != 0) {
            return;
        }

        let magnitude = value.unsigned_abs();
        self.put_bits((magnitude << 1) | (value < 0) as u32, n + 1);
    }

    /// Write the decisions that lead from the root of `tree` to `leaf`.
    pub(crate) fn put_tree(&mut self, tree: &[i8], probs: &[u8], leaf: i8) {
        self.put_tree_from(tree, probs, 0, leaf);
    }

    /// Like [`RangeEncoder::put_tree`], starting at the node pair at `start`.
    pub(crate) fn put_tree_from(&mut self, tree: &[i8], probs: &[u8], start: usize, leaf: i8) {
        let mut path = [(0_usize, false); 16];
        let len = find_path(tree, start, leaf, &mut path, 0);
        debug_assert!(len.is_some(), "leaf {leaf} is not reachable from node {start}");

        for &(index, bit) in &path[..len.unwrap_or(0)] {
            self.put_bit(bit, probs[index >> 1]);
        }
    }

    /// Number of `0xff` bytes waiting for carry resolution.
    #[cfg(test)]
    pub(crate) fn pending_ff_run(&self) -> usize {
        self.run
    }

    /// Number of bytes written so far, not counting pending ones.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    /// Pad the stream and return the encoded bytes.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.put_bits(0, (9 - self.nb_bits) as u32);
        self.nb_bits = 0;
        self.flush();

        // No carry can arrive anymore.
        self.buf.extend(core::iter::repeat_n(0xff, self.run));

        self.buf
    }

    fn flush(&mut self) {
        let s = 8 + self.nb_bits;
        let bits = self.value >> s;
        self.value -= bits << s;
        self.nb_bits -= 8;

        if bits & 0xff != 0xff {
            if bits & 0x100 != 0 {
                if let Some(last) = self.buf.last_mut() {
                    *last += 1;
                }
            }

            let fill = if bits & 0x100 != 0 { 0x00 } else { 0xff };
            self.buf.extend(core::iter::repeat_n(fill, self.run));
            self.run = 0;

            self.buf.push((bits & 0xff) as u8);
        } else {
            self.run += 1;
        }
    }
}

fn find_path(
    tree: &[i8],
    index: usize,
    leaf: i8,
    path: &mut [(usize, bool); 16],
    depth: usize,
) -> Option<usize> {
    if depth >= path.len() {
        return None;
    }

    for bit in [false, true] {
        let next = tree[index + bit as usize];
        path[depth] = (index, bit);

        if next <= 0 {
            if -next == leaf {
                return Some(depth + 1);
            }
        } else if let Some(len) = find_path(tree, next as usize, leaf, path, depth + 1) {
            return Some(len);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Refill;
    use crate::range_decoder::RangeDecoder;

    /// Keeps the low end of the coding interval as an exact bit string, so
    /// carries are resolved by plain addition instead of run counting.
    struct ReferenceEncoder {
        low: Vec<u8>,
        range: u32,
    }

    impl ReferenceEncoder {
        fn new() -> Self {
            Self {
                low: vec![0; 8],
                range: 254,
            }
        }

        fn put_bit(&mut self, bit: bool, prob: u8) {
            let split = (self.range * prob as u32) >> 8;

            if bit {
                self.add(split + 1);
                self.range -= split + 1;
            } else {
                self.range = split;
            }

            while self.range < 127 {
                self.range = (self.range << 1) | 1;
                self.low.push(0);
            }
        }

        fn add(&mut self, mut carry: u32) {
            for bit in self.low.iter_mut().rev() {
                if carry == 0 {
                    break;
                }

                let sum = *bit as u32 + (carry & 1);
                *bit = (sum & 1) as u8;
                carry = (carry >> 1) + (sum >> 1);
            }

            assert_eq!(carry, 0);
        }

        fn bytes(&self) -> Vec<u8> {
            self.low
                .chunks_exact(8)
                .map(|c| c.iter().fold(0, |acc, b| (acc << 1) | b))
                .collect()
        }
    }

    #[test]
    fn carry_propagates_through_ff_run() {
        let mut encoder = RangeEncoder::new();
        let mut reference = ReferenceEncoder::new();
        let mut decisions = vec![];

        // Moves the low end to 0x7f with the interval still reaching past
        // 0x80.
        decisions.push((true, 127));

        // Approach 0x80 from below without reaching it, which makes the low
        // end grow a tail of one bits.
        let mut distance = 1_u32;
        let mut range = 127_u32;

        for _ in 0..200 {
            let mut prob = 128_u8;

            if ((range * prob as u32) >> 8) + 1 == distance {
                prob = 64;
            }

            let split = (range * prob as u32) >> 8;
            let bit = distance > split + 1;

            if bit {
                distance -= split + 1;
                range -= split + 1;
            } else {
                range = split;
            }

            while range < 127 {
                range = (range << 1) | 1;
                distance <<= 1;
            }

            decisions.push((bit, prob));
        }

        for &(bit, prob) in &decisions {
            encoder.put_bit(bit, prob);
            reference.put_bit(bit, prob);
        }

        assert_eq!(encoder.len(), 1);
        assert!(encoder.pending_ff_run() >= 3);
        let run = encoder.pending_ff_run();

        // Now step over 0x80.
        decisions.push((true, 255));
        encoder.put_bit(true, 255);
        reference.put_bit(true, 255);

        for i in 0..32 {
            let bit = i % 3 == 0;
            decisions.push((bit, 90));
            encoder.put_bit(bit, 90);
            reference.put_bit(bit, 90);
        }

        let data = encoder.finish();
        let expected = reference.bytes();

        assert_eq!(data[0], 0x80);
        assert!(data[1..=run].iter().all(|b| *b == 0));

        let n = expected.len() - 2;
        assert_eq!(&data[..n], &expected[..n]);

        let mut decoder = RangeDecoder::new(&data, Refill::Wide);

        for &(bit, prob) in &decisions {
            assert_eq!(decoder.read_bit(prob), bit);
        }
    }

    #[test]
    fn matches_reference_on_fixed_input() {
        let mut encoder = RangeEncoder::new();
        let mut reference = ReferenceEncoder::new();

        for i in 0..3000_u32 {
            let prob = ((i * 73) % 254 + 1) as u8;
            let bit = i.wrapping_mul(2_654_435_761).wrapping_mul(i) >> 29 < 3;
            encoder.put_bit(bit, prob);
            reference.put_bit(bit, prob);
        }

        let data = encoder.finish();
        let expected = reference.bytes();
        let n = expected.len() - 2;

        assert_eq!(&data[..n], &expected[..n]);
    }

    #[test]
    fn fixed_decisions() {
        // The 0xff byte produced by the early decisions turns into 0x00
        // through a carry.
        let decisions = [
            (false, 240),
            (true, 240),
            (true, 240),
            (true, 200),
            (false, 200),
            (false, 1),
            (false, 200),
            (true, 240),
            (true, 16),
            (false, 16),
            (false, 200),
            (true, 64),
            (false, 16),
            (true, 200),
            (false, 200),
            (true, 200),
        ];

        let mut encoder = RangeEncoder::new();

        for &(bit, prob) in &decisions {
            encoder.put_bit(bit, prob);
        }

        let data = encoder.finish();
        assert_eq!(data, [0xee, 0xcb, 0x2f, 0x00, 0x14, 0x00, 0x00]);

        let mut decoder = RangeDecoder::new(&data, Refill::Bytewise);

        for &(bit, prob) in &decisions {
            assert_eq!(decoder.read_bit(prob), bit);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not reachable")]
    fn unknown_tree_leaf() {
        let mut encoder = RangeEncoder::new();
        encoder.put_tree(&[0, -1], &[128], 5);
    }

    #[test]
    fn empty_stream() {
        let data = RangeEncoder::new().finish();
        assert!(!data.is_empty());
        assert!(data.iter().all(|b| *b == 0));
    }
}
