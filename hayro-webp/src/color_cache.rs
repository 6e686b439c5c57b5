//! The color cache of lossless images (RFC 9649, Section 5.2.3).
//!
//! A small table of recently used colors, addressed by a multiplicative hash
//! of the color itself. Colliding colors simply replace each other.

use crate::error::{BitstreamError, Result, bail};
use alloc::vec;
use alloc::vec::Vec;

pub(crate) const MAX_CACHE_BITS: u32 = 11;
const HASH_MUL: u32 = 0x1e35a7bd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColorCache {
    colors: Vec<u32>,
    hash_shift: u32,
    hash_bits: u32,
}

impl ColorCache {
    pub(crate) fn new(hash_bits: u32) -> Result<Self> {
        if !(1..=MAX_CACHE_BITS).contains(&hash_bits) {
            bail!(BitstreamError::InvalidColorCacheBits);
        }

        Ok(Self {
            colors: vec![0; 1 << hash_bits],
            hash_shift: 32 - hash_bits,
            hash_bits,
        })
    }

    pub(crate) fn hash_bits(&self) -> u32 {
        self.hash_bits
    }

    pub(crate) fn size(&self) -> usize {
        self.colors.len()
    }

    #[inline(always)]
    pub(crate) fn key(&self, argb: u32) -> usize {
        (argb.wrapping_mul(HASH_MUL) >> self.hash_shift) as usize
    }

    #[inline(always)]
    pub(crate) fn insert(&mut self, argb: u32) {
        let key = self.key(argb);
        self.colors[key] = argb;
    }

    #[inline(always)]
    pub(crate) fn lookup(&self, key: usize) -> u32 {
        self.colors[key]
    }

    /// Return the key of `argb` if it is currently cached.
    #[inline(always)]
    pub(crate) fn contains(&self, argb: u32) -> Option<usize> {
        let key = self.key(argb);
        (self.colors[key] == argb).then_some(key)
    }

    /// Overwrite the contents with those of `other`, keeping the allocation.
    pub(crate) fn copy_from(&mut self, other: &Self) {
        debug_assert_eq!(self.hash_bits, other.hash_bits);
        self.colors.copy_from_slice(&other.colors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_sizes() {
        assert!(ColorCache::new(0).is_err());
        assert!(ColorCache::new(12).is_err());
        assert_eq!(ColorCache::new(11).unwrap().size(), 2048);
        assert_eq!(ColorCache::new(1).unwrap().size(), 2);
    }

    #[test]
    fn most_recent_color_wins() {
        let mut cache = ColorCache::new(3).unwrap();
        let first = 0xff00_0000;
        let key = cache.key(first);

        // Collect other colors that land in the same slot.
        let colliding: Vec<u32> = (1..)
            .map(|i: u32| 0xff00_0000 | i)
            .filter(|c| cache.key(*c) == key)
            .take(4)
            .collect();

        cache.insert(first);

        for (i, color) in (0..64_u32).map(|i| 0x0012_3400 + i).enumerate() {
            if cache.key(color) != key {
                cache.insert(color);
            }

            if i == 10 {
                for c in &colliding {
                    cache.insert(*c);
                }
            }
        }

        assert_eq!(cache.lookup(key), colliding[3]);
        assert_eq!(cache.contains(colliding[3]), Some(key));
        assert_eq!(cache.contains(first), None);
        assert_eq!(cache.contains(colliding[0]), None);
    }

    #[test]
    fn key_uses_top_bits_of_product() {
        let cache = ColorCache::new(4).unwrap();
        let argb = 0x1234_5678_u32;
        assert_eq!(cache.key(argb), (argb.wrapping_mul(0x1e35a7bd) >> 28) as usize);
        assert!(cache.key(0xffff_ffff) < 16);
    }
}
