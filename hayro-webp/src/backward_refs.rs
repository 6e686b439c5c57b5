//! LZ77 backward references of lossless images (RFC 9649, Section 5.2.2).
//!
//! Lengths and distances are sent as a prefix symbol plus extra bits.
//! Distances additionally go through a mapping that gives the 120 closest
//! pixels in the 2D neighborhood the smallest codes.

use crate::bit_reader::BitReader;
use crate::color_cache::ColorCache;
use crate::error::Result;
use alloc::vec;
use alloc::vec::Vec;

/// Number of distance codes reserved for the 2D neighborhood.
pub(crate) const NUM_PLANE_CODES: u32 = 120;
/// The longest copy the encoder emits.
pub(crate) const MAX_LENGTH: usize = 4095;
/// The farthest distance that can be expressed.
pub(crate) const WINDOW_SIZE: usize = (1 << 20) - NUM_PLANE_CODES as usize;

const MIN_LENGTH: usize = 3;
const HASH_BITS: u32 = 18;
const HASH_MUL_HI: u32 = 0xc6a4a793;
const HASH_MUL_LO: u32 = 0x5bd1e996;

/// `(dx, dy)` offsets of the plane codes, closest first.
#[rustfmt::skip]
const DISTANCE_MAP: [(i8, u8); NUM_PLANE_CODES as usize] = [
    (0, 1),  (1, 0),  (1, 1),  (-1, 1), (0, 2),  (2, 0),  (1, 2),
    (-1, 2), (2, 1),  (-2, 1), (2, 2),  (-2, 2), (0, 3),  (3, 0),
    (1, 3),  (-1, 3), (3, 1),  (-3, 1), (2, 3),  (-2, 3), (3, 2),
    (-3, 2), (0, 4),  (4, 0),  (1, 4),  (-1, 4), (4, 1),  (-4, 1),
    (3, 3),  (-3, 3), (2, 4),  (-2, 4), (4, 2),  (-4, 2), (0, 5),
    (3, 4),  (-3, 4), (4, 3),  (-4, 3), (5, 0),  (1, 5),  (-1, 5),
    (5, 1),  (-5, 1), (2, 5),  (-2, 5), (5, 2),  (-5, 2), (4, 4),
    (-4, 4), (3, 5),  (-3, 5), (5, 3),  (-5, 3), (0, 6),  (6, 0),
    (1, 6),  (-1, 6), (6, 1),  (-6, 1), (2, 6),  (-2, 6), (6, 2),
    (-6, 2), (4, 5),  (-4, 5), (5, 4),  (-5, 4), (3, 6),  (-3, 6),
    (6, 3),  (-6, 3), (0, 7),  (7, 0),  (1, 7),  (-1, 7), (5, 5),
    (-5, 5), (7, 1),  (-7, 1), (4, 6),  (-4, 6), (6, 4),  (-6, 4),
    (2, 7),  (-2, 7), (7, 2),  (-7, 2), (3, 7),  (-3, 7), (7, 3),
    (-7, 3), (5, 6),  (-5, 6), (6, 5),  (-6, 5), (8, 0),  (4, 7),
    (-4, 7), (7, 4),  (-7, 4), (8, 1),  (8, 2),  (6, 6),  (-6, 6),
    (8, 3),  (5, 7),  (-5, 7), (7, 5),  (-7, 5), (8, 4),  (6, 7),
    (-6, 7), (7, 6),  (-7, 6), (8, 5),  (7, 7),  (-7, 7), (8, 6),
    (8, 7),
];

/// Decode a length or distance from its prefix symbol and extra bits.
#[inline(always)]
pub(crate) fn get_copy_distance(symbol: u32, reader: &mut BitReader<'_>) -> u32 {
    if symbol < 4 {
        return symbol + 1;
    }

    let extra_bits = (symbol - 2) >> 1;
    let offset = (2 + (symbol & 1)) << extra_bits;

    offset + reader.read_bits(extra_bits) + 1
}

/// A length or distance split into prefix symbol and extra bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrefixEncoded {
    pub(crate) symbol: u32,
    pub(crate) extra_bits: u32,
    pub(crate) extra_value: u32,
}

pub(crate) fn prefix_encode(value: u32) -> PrefixEncoded {
    debug_assert!(value >= 1);

    if value <= 4 {
        return PrefixEncoded {
            symbol: value - 1,
            extra_bits: 0,
            extra_value: 0,
        };
    }

    let value = value - 1;
    let highest_bit = value.ilog2();
    let second_highest_bit = (value >> (highest_bit - 1)) & 1;
    let extra_bits = highest_bit - 1;

    PrefixEncoded {
        symbol: 2 * highest_bit + second_highest_bit,
        extra_bits,
        extra_value: value & ((1 << extra_bits) - 1),
    }
}

/// Map a distance code to a linear distance in an image of width `xsize`.
#[inline]
pub(crate) fn plane_code_to_distance(xsize: usize, code: u32) -> usize {
    if code > NUM_PLANE_CODES {
        return (code - NUM_PLANE_CODES) as usize;
    }

    let (dx, dy) = DISTANCE_MAP[code as usize - 1];
    let dist = dy as isize * xsize as isize + dx as isize;

    dist.max(1) as usize
}

/// The smallest distance code for a linear distance.
pub(crate) fn distance_to_plane_code(xsize: usize, dist: usize) -> u32 {
    if dist <= 7 * xsize + 8 {
        let found = DISTANCE_MAP
            .iter()
            .position(|&(dx, dy)| dy as isize * xsize as isize + dx as isize == dist as isize);

        if let Some(index) = found {
            return index as u32 + 1;
        }
    }

    dist as u32 + NUM_PLANE_CODES
}

/// Copy `len` pixels from `dist` pixels back to `pos`, going forward so that
/// overlapping copies repeat the pattern.
#[inline]
pub(crate) fn copy_block(data: &mut [u32], pos: usize, dist: usize, len: usize) {
    let src = pos - dist;

    match dist {
        _ if dist >= len => data.copy_within(src..src + len, pos),
        1 => {
            let argb = data[src];
            data[pos..pos + len].fill(argb);
        }
        2 | 4 => {
            let mut pattern = [0; 4];
            pattern[..dist].copy_from_slice(&data[src..pos]);

            for (i, argb) in data[pos..pos + len].iter_mut().enumerate() {
                *argb = pattern[i & (dist - 1)];
            }
        }
        _ => {
            for i in pos..pos + len {
                data[i] = data[i - dist];
            }
        }
    }
}

/// One entry of an LZ77-coded pixel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PixOrCopy {
    Literal(u32),
    CacheIndex(u32),
    /// A copy whose distance is already mapped to a distance code.
    Copy { length: u32, distance: u32 },
}

impl PixOrCopy {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Copy { length, .. } => *length as usize,
            _ => 1,
        }
    }
}

#[inline(always)]
fn pair_hash(argb: &[u32], pos: usize) -> usize {
    let key = argb[pos + 1].wrapping_mul(HASH_MUL_HI) ^ argb[pos].wrapping_mul(HASH_MUL_LO);

    (key >> (32 - HASH_BITS)) as usize
}

/// Chains of earlier positions with the same two-pixel hash.
struct HashChain {
    head: Vec<i32>,
    prev: Vec<i32>,
}

impl HashChain {
    fn new(len: usize) -> Result<Self> {
        let mut head = Vec::new();
        head.try_reserve_exact(1 << HASH_BITS)?;
        head.resize(1 << HASH_BITS, -1);

        let mut prev = Vec::new();
        prev.try_reserve_exact(len)?;
        prev.resize(len, -1);

        Ok(Self { head, prev })
    }

    fn insert(&mut self, argb: &[u32], pos: usize) {
        if pos + 1 < argb.len() {
            let hash = pair_hash(argb, pos);
            self.prev[pos] = self.head[hash];
            self.head[hash] = pos as i32;
        }
    }

    /// Find the longest earlier match for `pos`, as `(len, dist)`.
    fn find(&self, argb: &[u32], pos: usize, max_candidates: usize) -> (usize, usize) {
        if pos + 1 >= argb.len() {
            return (0, 0);
        }

        let max_len = (argb.len() - pos).min(MAX_LENGTH);
        let mut best = (0, 0);
        let mut candidate = self.head[pair_hash(argb, pos)];

        for _ in 0..max_candidates {
            if candidate < 0 {
                break;
            }

            let start = candidate as usize;
            let dist = pos - start;

            if dist > WINDOW_SIZE {
                break;
            }

            let len = argb[start..start + max_len]
                .iter()
                .zip(&argb[pos..pos + max_len])
                .take_while(|(a, b)| a == b)
                .count();

            if len > best.0 {
                best = (len, dist);

                if len == max_len {
                    break;
                }
            }

            candidate = self.prev[start];
        }

        best
    }
}

/// Greedily turn `argb` into literals, cache hits and copies.
///
/// The color cache is emulated exactly as a decoder maintains it: every
/// pixel, including copied ones, is inserted after it was produced.
pub(crate) fn backward_references(
    argb: &[u32],
    xsize: usize,
    cache_bits: u32,
    max_candidates: usize,
) -> Result<Vec<PixOrCopy>> {
    let mut refs = Vec::new();
    let mut chain = HashChain::new(argb.len())?;
    let mut cache = match cache_bits {
        0 => None,
        bits => Some(ColorCache::new(bits)?),
    };
    let mut pos = 0;

    while pos < argb.len() {
        let (len, dist) = if max_candidates > 0 {
            chain.find(argb, pos, max_candidates)
        } else {
            (0, 0)
        };

        if len >= MIN_LENGTH {
            refs.push(PixOrCopy::Copy {
                length: len as u32,
                distance: distance_to_plane_code(xsize, dist),
            });

            for p in pos..pos + len {
                chain.insert(argb, p);

                if let Some(cache) = &mut cache {
                    cache.insert(argb[p]);
                }
            }

            pos += len;
        } else {
            let pixel = argb[pos];

            match cache.as_mut() {
                Some(cache) => {
                    refs.push(match cache.contains(pixel) {
                        Some(key) => PixOrCopy::CacheIndex(key as u32),
                        None => PixOrCopy::Literal(pixel),
                    });
                    cache.insert(pixel);
                }
                None => refs.push(PixOrCopy::Literal(pixel)),
            }

            chain.insert(argb, pos);
            pos += 1;
        }
    }

    Ok(refs)
}

/// The number of pixels the references cover.
#[cfg(test)]
fn total_len(refs: &[PixOrCopy]) -> usize {
    refs.iter().map(PixOrCopy::len).sum()
}
