//! A straightforward lossless encoder.
//!
//! Transforms are applied with fixed parameters, backward references are
//! found greedily and every prefix code is built from the exact histogram of
//! the symbols it codes.

use super::transform::{
    Multipliers, bundle_color_map, cross_color_forward, palette_bits, predictor_forward,
    sub_pixels, subtract_green,
};
use super::{LOSSLESS_SIGNATURE, subsample_size};
use crate::backward_refs::{PixOrCopy, backward_references, prefix_encode};
use crate::bit_writer::BitWriter;
use crate::color_cache::MAX_CACHE_BITS;
use crate::error::{ParameterError, Result, bail};
use crate::huffman::encode::PrefixCode;
use crate::huffman::{
    ALPHA, ALPHABET_SIZE, BLUE, CODES_PER_GROUP, DIST, GREEN, MAX_CODE_LENGTH, NUM_LITERAL_CODES,
    RED,
};
use alloc::vec;
use alloc::vec::Vec;
use rustc_hash::FxHashMap;

const MAX_IMAGE_SIZE: u32 = 1 << 14;
const MAX_PALETTE_SIZE: usize = 256;
/// Cache sizes tried when none is configured.
const AUTO_CACHE_BITS: [u32; 2] = [0, 10];

/// The pixels to encode.
#[derive(Debug, Clone, Copy)]
pub struct EncodeInput<'a> {
    pub width: u32,
    pub height: u32,
    /// The pixels in row-major order, as `0xAARRGGBB`.
    pub pixels: &'a [u32],
}

/// A predictor transform that uses one mode for the whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorSettings {
    /// The prediction mode, between 0 and 13.
    pub mode: u8,
    /// Tile size as log2, between 2 and 9.
    pub bits: u32,
}

/// A cross-color transform that uses one set of multipliers for the whole
/// image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossColorSettings {
    pub multipliers: Multipliers,
    /// Tile size as log2, between 2 and 9.
    pub bits: u32,
}

/// Settings for [`encode_lossless`](crate::encode_lossless).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    /// Subtract green from red and blue.
    pub subtract_green: bool,
    pub predictor: Option<PredictorSettings>,
    pub cross_color: Option<CrossColorSettings>,
    /// Use a palette if the image has at most 256 colors. This replaces the
    /// other transforms.
    pub palette: bool,
    /// Color cache size as log2, 0 to disable it. `None` tries with and
    /// without a cache and keeps the smaller result.
    pub cache_bits: Option<u32>,
    /// Use separate prefix codes for tiles of this size, as log2 between 2
    /// and 9.
    pub huffman_bits: Option<u32>,
    /// Number of earlier matches examined per pixel. 0 disables backward
    /// references.
    pub max_candidates: usize,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            subtract_green: true,
            predictor: Some(PredictorSettings { mode: 11, bits: 4 }),
            cross_color: None,
            palette: true,
            cache_bits: None,
            huffman_bits: None,
            max_candidates: 32,
        }
    }
}

impl EncodeSettings {
    fn validate(&self) -> Result<()> {
        let tile_bits = 2..=9;
        let valid = self.predictor.is_none_or(|p| p.mode <= 13 && tile_bits.contains(&p.bits))
            && self.cross_color.is_none_or(|c| tile_bits.contains(&c.bits))
            && self.cache_bits.is_none_or(|bits| bits <= MAX_CACHE_BITS)
            && self.huffman_bits.is_none_or(|bits| tile_bits.contains(&bits));

        if !valid {
            bail!(ParameterError::InvalidSetting);
        }

        Ok(())
    }
}

pub(crate) fn encode(input: &EncodeInput<'_>, settings: &EncodeSettings) -> Result<Vec<u8>> {
    settings.validate()?;

    let size_range = 1..=MAX_IMAGE_SIZE;

    if !size_range.contains(&input.width) || !size_range.contains(&input.height) {
        bail!(ParameterError::InvalidDimensions);
    }

    let xsize = input.width as usize;
    let ysize = input.height as usize;

    if input.pixels.len() != xsize * ysize {
        bail!(ParameterError::PixelCountMismatch);
    }

    let has_alpha = input.pixels.iter().any(|p| p >> 24 != 0xff);

    let mut writer = BitWriter::new();
    writer.put_bits(LOSSLESS_SIGNATURE as u32, 8);
    writer.put_bits(input.width - 1, 14);
    writer.put_bits(input.height - 1, 14);
    writer.put_bits(has_alpha as u32, 1);
    writer.put_bits(0, 3);

    let mut argb = input.pixels.to_vec();
    let mut coded_xsize = xsize;

    match settings.palette.then(|| build_palette(&argb)).flatten() {
        Some((palette, indices)) => {
            let bits = palette_bits(palette.len());
            ldebug!("using a palette of {} colors", palette.len());

            writer.put_bits(1, 1);
            writer.put_bits(3, 2);
            writer.put_bits(palette.len() as u32 - 1, 8);

            let mut deltas = palette.clone();
            for i in (1..palette.len()).rev() {
                deltas[i] = sub_pixels(palette[i], palette[i - 1]);
            }

            write_sub_image(&mut writer, &deltas, palette.len(), 1, settings)?;

            argb = bundle_color_map(&indices, xsize, bits);
            coded_xsize = subsample_size(xsize, bits);
        }
        None => {
            if settings.subtract_green {
                writer.put_bits(1, 1);
                writer.put_bits(2, 2);
                subtract_green(&mut argb);
            }

            if let Some(predictor) = settings.predictor {
                writer.put_bits(1, 1);
                writer.put_bits(0, 2);
                writer.put_bits(predictor.bits - 2, 3);

                let modes =
                    predictor_forward(&mut argb, xsize, ysize, predictor.bits, predictor.mode);
                write_sub_image(
                    &mut writer,
                    &modes,
                    subsample_size(xsize, predictor.bits),
                    subsample_size(ysize, predictor.bits),
                    settings,
                )?;
            }

            if let Some(cross_color) = settings.cross_color {
                writer.put_bits(1, 1);
                writer.put_bits(1, 2);
                writer.put_bits(cross_color.bits - 2, 3);

                let codes = cross_color_forward(
                    &mut argb,
                    xsize,
                    ysize,
                    cross_color.bits,
                    cross_color.multipliers,
                );
                write_sub_image(
                    &mut writer,
                    &codes,
                    subsample_size(xsize, cross_color.bits),
                    subsample_size(ysize, cross_color.bits),
                    settings,
                )?;
            }
        }
    }

    writer.put_bits(0, 1);

    let image = ImageToEncode {
        argb: &argb,
        xsize: coded_xsize,
        ysize,
        huffman_bits: settings.huffman_bits,
        max_candidates: settings.max_candidates,
    };

    let writer = match settings.cache_bits {
        Some(cache_bits) => image.encode(writer, cache_bits)?,
        None => image.encode_smallest(writer)?,
    };

    Ok(writer.finish())
}

/// Collect the colors of `argb` in the order they first appear, and the
/// palette index of each pixel. Returns `None` for more than 256 colors.
fn build_palette(argb: &[u32]) -> Option<(Vec<u32>, Vec<u8>)> {
    let mut palette = Vec::new();
    let mut lookup = FxHashMap::default();
    let mut indices = Vec::with_capacity(argb.len());

    for pixel in argb {
        let index = match lookup.get(pixel) {
            Some(index) => *index,
            None => {
                if palette.len() == MAX_PALETTE_SIZE {
                    return None;
                }

                let index = palette.len() as u8;
                lookup.insert(*pixel, index);
                palette.push(*pixel);

                index
            }
        };

        indices.push(index);
    }

    Some((palette, indices))
}

fn write_sub_image(
    writer: &mut BitWriter,
    argb: &[u32],
    xsize: usize,
    ysize: usize,
    settings: &EncodeSettings,
) -> Result<()> {
    let image = ImageToEncode {
        argb,
        xsize,
        ysize,
        huffman_bits: None,
        max_candidates: settings.max_candidates,
    };

    image.write(writer, 0, false)
}

struct ImageToEncode<'a> {
    argb: &'a [u32],
    xsize: usize,
    ysize: usize,
    huffman_bits: Option<u32>,
    max_candidates: usize,
}

impl ImageToEncode<'_> {
    fn encode(&self, mut writer: BitWriter, cache_bits: u32) -> Result<BitWriter> {
        self.write(&mut writer, cache_bits, true)?;

        Ok(writer)
    }

    /// Encode once per cache size candidate and keep the shortest stream.
    #[cfg(feature = "std")]
    fn encode_smallest(&self, writer: BitWriter) -> Result<BitWriter> {
        let [with_cache, without_cache] = std::thread::scope(|scope| {
            let base = &writer;
            let handle = scope.spawn(move || self.encode(base.clone(), AUTO_CACHE_BITS[1]));
            let without_cache = self.encode(base.clone(), AUTO_CACHE_BITS[0]);
            let with_cache = handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));

            [with_cache, without_cache]
        });

        smaller(with_cache?, without_cache?)
    }

    #[cfg(not(feature = "std"))]
    fn encode_smallest(&self, writer: BitWriter) -> Result<BitWriter> {
        let without_cache = self.encode(writer.clone(), AUTO_CACHE_BITS[0])?;
        let with_cache = self.encode(writer, AUTO_CACHE_BITS[1])?;

        smaller(with_cache, without_cache)
    }

    /// Write the color cache size, the meta image if allowed, the prefix
    /// codes and the coded pixels.
    fn write(&self, writer: &mut BitWriter, cache_bits: u32, allow_meta: bool) -> Result<()> {
        let refs = backward_references(self.argb, self.xsize, cache_bits, self.max_candidates)?;

        if cache_bits > 0 {
            writer.put_bits(1, 1);
            writer.put_bits(cache_bits, 4);
        } else {
            writer.put_bits(0, 1);
        }

        let tiles = match self.huffman_bits.filter(|_| allow_meta) {
            Some(bits) => {
                writer.put_bits(1, 1);
                writer.put_bits(bits - 2, 3);

                let tiles_x = subsample_size(self.xsize, bits);
                let tiles_y = subsample_size(self.ysize, bits);

                // Group indices are 16 bits wide.
                if tiles_x * tiles_y > 1 << 16 {
                    bail!(ParameterError::InvalidSetting);
                }

                let meta: Vec<u32> = (0..(tiles_x * tiles_y) as u32).map(|g| g << 8).collect();
                let settings = EncodeSettings {
                    max_candidates: self.max_candidates,
                    ..EncodeSettings::default()
                };
                write_sub_image(writer, &meta, tiles_x, tiles_y, &settings)?;

                Some((bits, tiles_x))
            }
            None => {
                if allow_meta {
                    writer.put_bits(0, 1);
                }

                None
            }
        };

        let group_of = |pos: usize| match tiles {
            Some((bits, tiles_x)) => {
                let (x, y) = (pos % self.xsize, pos / self.xsize);
                (y >> bits) * tiles_x + (x >> bits)
            }
            None => 0,
        };

        let num_groups = tiles.map_or(1, |(bits, tiles_x)| {
            tiles_x * subsample_size(self.ysize, bits)
        });
        let cache_size = if cache_bits > 0 { 1 << cache_bits } else { 0 };

        let mut histograms: Vec<[Vec<u32>; CODES_PER_GROUP]> = (0..num_groups)
            .map(|_| {
                core::array::from_fn(|i| {
                    let extra = if i == GREEN { cache_size } else { 0 };
                    vec![0; ALPHABET_SIZE[i] + extra]
                })
            })
            .collect();

        let mut pos = 0;

        for r in &refs {
            let histogram = &mut histograms[group_of(pos)];

            match *r {
                PixOrCopy::Literal(argb) => {
                    histogram[GREEN][((argb >> 8) & 0xff) as usize] += 1;
                    histogram[RED][((argb >> 16) & 0xff) as usize] += 1;
                    histogram[BLUE][(argb & 0xff) as usize] += 1;
                    histogram[ALPHA][(argb >> 24) as usize] += 1;
                }
                PixOrCopy::CacheIndex(key) => {
                    histogram[GREEN][ALPHABET_SIZE[GREEN] + key as usize] += 1;
                }
                PixOrCopy::Copy { length, distance } => {
                    let length = prefix_encode(length);
                    let distance = prefix_encode(distance);
                    histogram[GREEN][NUM_LITERAL_CODES as usize + length.symbol as usize] += 1;
                    histogram[DIST][distance.symbol as usize] += 1;
                }
            }

            pos += r.len();
        }

        let mut codes: Vec<[PrefixCode; CODES_PER_GROUP]> = histograms
            .iter()
            .map(|group| {
                core::array::from_fn(|i| {
                    PrefixCode::from_histogram(&group[i], MAX_CODE_LENGTH as u8)
                })
            })
            .collect();

        for group in &mut codes {
            for code in group.iter_mut() {
                code.store(writer);
            }
        }

        let mut pos = 0;

        for r in &refs {
            let group = &codes[group_of(pos)];

            match *r {
                PixOrCopy::Literal(argb) => {
                    group[GREEN].write_symbol(writer, ((argb >> 8) & 0xff) as usize);
                    group[RED].write_symbol(writer, ((argb >> 16) & 0xff) as usize);
                    group[BLUE].write_symbol(writer, (argb & 0xff) as usize);
                    group[ALPHA].write_symbol(writer, (argb >> 24) as usize);
                }
                PixOrCopy::CacheIndex(key) => {
                    group[GREEN].write_symbol(writer, ALPHABET_SIZE[GREEN] + key as usize);
                }
                PixOrCopy::Copy { length, distance } => {
                    let length = prefix_encode(length);
                    let distance = prefix_encode(distance);

                    group[GREEN]
                        .write_symbol(writer, NUM_LITERAL_CODES as usize + length.symbol as usize);
                    writer.put_bits(length.extra_value, length.extra_bits);
                    group[DIST].write_symbol(writer, distance.symbol as usize);
                    writer.put_bits(distance.extra_value, distance.extra_bits);
                }
            }

            pos += r.len();
        }

        ltrace!(
            "coded {}x{} pixels as {} symbols, {} bits so far",
            self.xsize,
            self.ysize,
            refs.len(),
            writer.num_bits()
        );

        Ok(())
    }
}

fn smaller(a: BitWriter, b: BitWriter) -> Result<BitWriter> {
    ldebug!(
        "automatic cache size: {} bits with, {} bits without a cache",
        a.num_bits(),
        b.num_bits()
    );

    Ok(if a.num_bits() < b.num_bits() { a } else { b })
}
