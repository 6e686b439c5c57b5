//! Decoding of lossless images (RFC 9649).
//!
//! A lossless image is a header, a list of transforms, and an entropy-coded
//! image. The entropy-coded image is itself made of prefix codes, possibly
//! selected per tile by another entropy-coded image, and a stream of
//! literals, color cache hits and backward references.

mod codes;
pub(crate) mod encoder;
pub(crate) mod transform;

use crate::backward_refs::{copy_block, get_copy_distance, plane_code_to_distance};
use crate::bit_reader::{BitReader, BitReaderState};
use crate::color_cache::ColorCache;
use crate::error::{BitstreamError, DecodeError, Result, UnsupportedFeature, bail};
use crate::huffman::{
    ALPHA, BLUE, DIST, GREEN, NUM_LENGTH_CODES, NUM_LITERAL_CODES, Packed, RED, read_packed,
    read_symbol,
};
use crate::{BitstreamFormat, DecodeSettings, ImageInfo, Refill, RowBatch, RowSink};
use alloc::vec::Vec;
use codes::{HuffmanCodes, read_color_cache_bits, read_huffman_codes};
use smallvec::SmallVec;
use transform::{InverseTransforms, Transform};

pub(crate) const LOSSLESS_SIGNATURE: u8 = 0x2f;
const LOSSLESS_VERSION: u32 = 0;
const IMAGE_SIZE_BITS: u32 = 14;
const VERSION_BITS: u32 = 3;
/// Size of the header in bytes.
pub(crate) const HEADER_SIZE: usize = 5;
/// Rows handed to the inverse transforms and the sink at once.
const ROWS_PER_BATCH: usize = 16;

#[inline]
pub(crate) fn subsample_size(size: usize, bits: u32) -> usize {
    (size + (1 << bits) - 1) >> bits
}

/// Whether `data` starts like a lossless bitstream.
pub(crate) fn is_lossless(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE && data[0] == LOSSLESS_SIGNATURE && data[4] >> 5 == 0
}

/// The header of a lossless image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LosslessHeader {
    pub width: u32,
    pub height: u32,
    /// Whether the encoder claims the image uses alpha. Only a hint.
    pub has_alpha: bool,
}

impl LosslessHeader {
    pub(crate) fn read(reader: &mut BitReader<'_>) -> Result<Self> {
        let signature = reader.read_bits(8);

        if reader.eos() {
            bail!(BitstreamError::UnexpectedEof);
        }

        if signature != LOSSLESS_SIGNATURE as u32 {
            bail!(BitstreamError::InvalidSignature);
        }

        let width = reader.read_bits(IMAGE_SIZE_BITS) + 1;
        let height = reader.read_bits(IMAGE_SIZE_BITS) + 1;
        let has_alpha = reader.read_bit();
        let version = reader.read_bits(VERSION_BITS);

        if reader.eos() {
            bail!(BitstreamError::UnexpectedEof);
        }

        if version != LOSSLESS_VERSION {
            bail!(BitstreamError::InvalidVersion);
        }

        Ok(Self {
            width,
            height,
            has_alpha,
        })
    }

    pub(crate) fn check_limit(&self, settings: &DecodeSettings) -> Result<()> {
        let pixels = self.width as u64 * self.height as u64;

        if settings.max_pixels.is_some_and(|max| pixels > max) {
            bail!(UnsupportedFeature::ImageTooLarge);
        }

        Ok(())
    }

    pub(crate) fn info(&self) -> ImageInfo {
        ImageInfo {
            width: self.width,
            height: self.height,
            has_alpha: self.has_alpha,
            format: BitstreamFormat::Lossless,
        }
    }
}

/// A fully decoded lossless image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LosslessImage {
    pub width: u32,
    pub height: u32,
    pub has_alpha: bool,
    /// The pixels in row-major order, as `0xAARRGGBB`.
    pub pixels: Vec<u32>,
}

/// Decode the prefix-coded image that stores a transform or the group
/// assignment of tiles.
pub(crate) fn decode_sub_image(
    reader: &mut BitReader<'_>,
    xsize: usize,
    ysize: usize,
) -> Result<Vec<u32>> {
    let cache_bits = read_color_cache_bits(reader)?;
    let codes = read_huffman_codes(reader, xsize, ysize, cache_bits, false)?;
    let mut image = EntropyImage::new(xsize, ysize, cache_bits, codes)?;
    image.decode(reader, ysize, false)?;

    Ok(image.pixels)
}

/// Where to continue decoding after running out of data.
#[derive(Debug, Clone)]
struct Checkpoint {
    reader: BitReaderState,
    pos: usize,
    last_cached: usize,
    cache: Option<ColorCache>,
}

/// An image coded with prefix codes, backward references and a color cache.
#[derive(Debug, Clone)]
struct EntropyImage {
    xsize: usize,
    pixels: Vec<u32>,
    /// Index of the next pixel to decode.
    pos: usize,
    /// Pixels before this index were inserted into the color cache.
    last_cached: usize,
    cache: Option<ColorCache>,
    codes: HuffmanCodes,
    checkpoint: Checkpoint,
}

impl EntropyImage {
    fn new(xsize: usize, ysize: usize, cache_bits: u32, codes: HuffmanCodes) -> Result<Self> {
        let num_pixels = xsize
            .checked_mul(ysize)
            .ok_or(DecodeError::OutOfMemory)?;

        let mut pixels = Vec::new();
        pixels.try_reserve_exact(num_pixels)?;
        pixels.resize(num_pixels, 0);

        let cache = match cache_bits {
            0 => None,
            bits => Some(ColorCache::new(bits)?),
        };

        Ok(Self {
            xsize,
            pixels,
            pos: 0,
            last_cached: 0,
            checkpoint: Checkpoint {
                reader: BitReaderState::default(),
                pos: 0,
                last_cached: 0,
                cache: cache.clone(),
            },
            cache,
            codes,
        })
    }

    fn complete_rows(&self) -> usize {
        self.pos / self.xsize
    }

    fn is_complete(&self) -> bool {
        self.pos == self.pixels.len()
    }

    /// Decode pixels until at least the first `last_row` rows are complete.
    ///
    /// Running out of data is an [`BitstreamError::UnexpectedEof`]. With
    /// `checkpoints`, the state is then rolled back to the start of the row
    /// that was being decoded, so that decoding can be resumed from
    /// [`EntropyImage::resume_state`] once more data is available.
    fn decode(
        &mut self,
        reader: &mut BitReader<'_>,
        last_row: usize,
        checkpoints: bool,
    ) -> Result<()> {
        let Self {
            xsize,
            pixels,
            pos: image_pos,
            last_cached: image_last_cached,
            cache,
            codes,
            checkpoint,
        } = self;

        let width = *xsize;
        let end = pixels.len();
        let last = last_row.saturating_mul(width).min(end);
        let len_code_limit = NUM_LITERAL_CODES + NUM_LENGTH_CODES;
        let tables = &codes.tables;

        let mut pos = *image_pos;
        let mut last_cached = *image_last_cached;
        let mut col = pos % width;
        let mut row = pos / width;
        let mut next_sync_row = if checkpoints { row } else { usize::MAX };
        let mut group = &codes.groups[0];

        if pos < last {
            group = codes.group(col, row);
        }

        'decode: while pos < last {
            if row >= next_sync_row {
                checkpoint.reader = reader.state();
                checkpoint.pos = pos;
                checkpoint.last_cached = last_cached;

                if let (Some(saved), Some(cache)) = (&mut checkpoint.cache, &*cache) {
                    saved.copy_from(cache);
                }

                next_sync_row = row + 1;
            }

            if col & codes.mask == 0 {
                group = codes.group(col, row);
            }

            let argb = 'pixel: {
                if group.is_trivial_code {
                    break 'pixel group.literal_arb;
                }

                reader.fill_bit_window();

                let code = match group.packed.as_deref() {
                    Some(packed) => match read_packed(packed, reader) {
                        Packed::Pixel(argb) => {
                            if reader.is_end_of_stream() {
                                break 'decode;
                            }

                            break 'pixel argb;
                        }
                        Packed::Symbol(code) => code,
                    },
                    None => read_symbol(group.tree(tables, GREEN), reader),
                };

                if reader.is_end_of_stream() {
                    break 'decode;
                }

                if code < NUM_LITERAL_CODES {
                    if group.is_trivial_literal {
                        break 'pixel group.literal_arb | ((code as u32) << 8);
                    }

                    let red = read_symbol(group.tree(tables, RED), reader) as u32;
                    reader.fill_bit_window();
                    let blue = read_symbol(group.tree(tables, BLUE), reader) as u32;
                    let alpha = read_symbol(group.tree(tables, ALPHA), reader) as u32;

                    if reader.is_end_of_stream() {
                        break 'decode;
                    }

                    break 'pixel (alpha << 24) | (red << 16) | ((code as u32) << 8) | blue;
                }

                if code < len_code_limit {
                    let length = get_copy_distance((code - NUM_LITERAL_CODES) as u32, reader);
                    let dist_symbol = read_symbol(group.tree(tables, DIST), reader);
                    reader.fill_bit_window();
                    let dist_code = get_copy_distance(dist_symbol as u32, reader);
                    let dist = plane_code_to_distance(width, dist_code);
                    let length = length as usize;

                    if reader.is_end_of_stream() {
                        break 'decode;
                    }

                    if pos < dist || end - pos < length {
                        bail!(BitstreamError::InvalidBackwardReference);
                    }

                    copy_block(pixels, pos, dist, length);
                    pos += length;
                    col += length;

                    while col >= width {
                        col -= width;
                        row += 1;
                    }

                    if pos < end && col & codes.mask != 0 {
                        group = codes.group(col, row);
                    }

                    flush_cache(cache, pixels, &mut last_cached, pos);

                    continue 'decode;
                }

                let key = (code - len_code_limit) as usize;
                flush_cache(cache, pixels, &mut last_cached, pos);

                match cache.as_ref() {
                    Some(cache) if key < cache.size() => cache.lookup(key),
                    _ => bail!(BitstreamError::InvalidColorCacheIndex),
                }
            };

            pixels[pos] = argb;
            pos += 1;
            col += 1;

            if col >= width {
                col = 0;
                row += 1;
                flush_cache(cache, pixels, &mut last_cached, pos);
            }
        }

        if reader.is_end_of_stream() {
            reader.set_end_of_stream();
        }

        if pos < last {
            if checkpoints {
                *image_pos = checkpoint.pos;
                *image_last_cached = checkpoint.last_cached;

                if let (Some(cache), Some(saved)) = (cache.as_mut(), checkpoint.cache.as_ref()) {
                    cache.copy_from(saved);
                }

                ltrace!("ran out of data, resuming at pixel {}", checkpoint.pos);
            } else {
                *image_pos = pos;
                *image_last_cached = last_cached;
            }

            bail!(BitstreamError::UnexpectedEof);
        }

        *image_pos = pos;
        *image_last_cached = last_cached;

        Ok(())
    }

    fn resume_state(&self) -> BitReaderState {
        self.checkpoint.reader
    }
}

/// Insert the pixels before `pos` that aren't cached yet.
#[inline(always)]
fn flush_cache(
    cache: &mut Option<ColorCache>,
    pixels: &[u32],
    last_cached: &mut usize,
    pos: usize,
) {
    if let Some(cache) = cache {
        for argb in &pixels[*last_cached..pos] {
            cache.insert(*argb);
        }

        *last_cached = pos;
    }
}

/// Decodes the pixel rows of a lossless image, possibly across several calls
/// with growing data.
#[derive(Debug, Clone)]
pub(crate) struct LosslessDecoder {
    header: LosslessHeader,
    image: EntropyImage,
    transforms: InverseTransforms,
    /// Where the pixel data continues.
    resume: BitReaderState,
    /// Whether running out of data may be followed by more data.
    incremental: bool,
    rows_emitted: usize,
    /// The final pixels of the emitted rows.
    output: Vec<u32>,
}

impl LosslessDecoder {
    /// Parse everything up to the pixel data.
    pub(crate) fn new(data: &[u8], settings: &DecodeSettings, incremental: bool) -> Result<Self> {
        let mut reader = BitReader::new(data, settings.refill);
        let header = LosslessHeader::read(&mut reader)?;
        header.check_limit(settings)?;

        let ysize = header.height as usize;
        let mut xsize = header.width as usize;
        let mut transforms = SmallVec::new();
        let mut seen = 0;

        while reader.read_bit() {
            transforms.push(Transform::read(&mut reader, &mut xsize, ysize, &mut seen)?);
        }

        if reader.eos() {
            bail!(BitstreamError::UnexpectedEof);
        }

        let cache_bits = read_color_cache_bits(&mut reader)?;
        let codes = read_huffman_codes(&mut reader, xsize, ysize, cache_bits, true)?;
        let image = EntropyImage::new(xsize, ysize, cache_bits, codes)?;

        let num_pixels = header.width as usize * ysize;
        let mut output = Vec::new();
        output.try_reserve_exact(num_pixels)?;
        output.resize(num_pixels, 0);

        ldebug!(
            "lossless image {}x{}, {} transforms, {} cache bits, pixel data at byte {}",
            header.width,
            header.height,
            transforms.len(),
            cache_bits,
            reader.state().byte_offset()
        );

        Ok(Self {
            header,
            image,
            transforms: InverseTransforms::new(transforms),
            resume: reader.state(),
            incremental,
            rows_emitted: 0,
            output,
        })
    }

    pub(crate) fn header(&self) -> &LosslessHeader {
        &self.header
    }

    pub(crate) fn rows_emitted(&self) -> usize {
        self.rows_emitted
    }

    /// The final pixels of the rows emitted so far.
    pub(crate) fn pixels(&self) -> &[u32] {
        &self.output[..self.rows_emitted * self.header.width as usize]
    }

    /// Byte offset of the earliest data still needed.
    pub(crate) fn resume_offset(&self) -> usize {
        self.resume.byte_offset()
    }

    /// Drop the first `bytes` bytes from all offsets after the data before
    /// them was discarded.
    pub(crate) fn rebase(&mut self, bytes: usize) {
        self.resume.rebase(bytes);
    }

    /// Decode and emit rows until `last_row` rows are emitted. Returns
    /// whether the image is complete.
    pub(crate) fn decode<S: RowSink + ?Sized>(
        &mut self,
        data: &[u8],
        refill: Refill,
        last_row: usize,
        sink: &mut S,
    ) -> Result<bool> {
        let height = self.header.height as usize;
        let last_row = last_row.min(height);

        let mut reader = BitReader::resume(data, self.resume, refill);
        let result = self.image.decode(&mut reader, last_row, self.incremental);

        self.resume = match result {
            Ok(()) => reader.state(),
            Err(DecodeError::Bitstream(BitstreamError::UnexpectedEof)) if self.incremental => {
                self.image.resume_state()
            }
            Err(e) => return Err(e),
        };

        self.emit_rows(self.image.complete_rows().min(last_row), sink)?;
        result?;

        Ok(self.rows_emitted == height)
    }

    fn emit_rows<S: RowSink + ?Sized>(&mut self, end_row: usize, sink: &mut S) -> Result<()> {
        let width = self.header.width as usize;
        let coded_width = self.image.xsize;

        while self.rows_emitted < end_row {
            let start = self.rows_emitted;
            let num_rows = (end_row - start).min(ROWS_PER_BATCH);
            let rows = &self.image.pixels[start * coded_width..(start + num_rows) * coded_width];
            let output = &mut self.output[start * width..(start + num_rows) * width];

            self.transforms.apply(start, num_rows, rows, output);
            self.rows_emitted += num_rows;

            ltrace!("emitting rows {}..{}", start, start + num_rows);

            let batch = RowBatch::Argb {
                start_row: start as u32,
                width: width as u32,
                pixels: output,
            };

            if !sink.rows(&batch) {
                bail!(DecodeError::UserAbort);
            }
        }

        Ok(())
    }

    pub(crate) fn into_image(self) -> LosslessImage {
        LosslessImage {
            width: self.header.width,
            height: self.header.height,
            has_alpha: self.header.has_alpha,
            pixels: self.output,
        }
    }
}

/// Decode a complete lossless bitstream.
pub(crate) fn decode(data: &[u8], settings: &DecodeSettings) -> Result<LosslessImage> {
    let mut decoder = LosslessDecoder::new(data, settings, false)?;
    decoder.decode(data, settings.refill, usize::MAX, &mut |_: &RowBatch<'_>| true)?;
    debug_assert!(decoder.image.is_complete());

    Ok(decoder.into_image())
}
