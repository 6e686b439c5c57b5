/*!
A memory-safe, pure-Rust codec core for the WebP bitstreams.

`hayro-webp` handles the bit-level part of WebP: the lossless bitstream
(RFC 9649) and key frames of the lossy bitstream (RFC 6386). It contains
the boolean range coder, the packed bit reader and writer, canonical Huffman
decoding, LZ77 backward references with the color cache, and an incremental
decoder that accepts its input in pieces.

Lossless images are decoded all the way to ARGB pixels. For lossy frames,
the decoder stops at the symbol level and hands each macroblock row to a
[`RowSink`] as segment ids, prediction modes and dequantized coefficients.
Prediction, inverse transforms, loop filtering and color conversion are left
to the caller, as is parsing of the RIFF container.

# Example
```rust,no_run
use hayro_webp::{EncodeInput, EncodeSettings, decode_lossless, encode_lossless};

let pixels = vec![0xff20_4080; 64 * 64];
let input = EncodeInput { width: 64, height: 64, pixels: &pixels };
let data = encode_lossless(&input, &EncodeSettings::default()).unwrap();

let image = decode_lossless(&data).unwrap();
assert_eq!(image.pixels, pixels);
```

Data that arrives in pieces can be fed to an [`IncrementalDecoder`]:
```rust,no_run
use hayro_webp::{DecodeSettings, IncrementalDecoder, RowBatch};

let data = std::fs::read("image.vp8l").unwrap();
let mut rows = 0;
let mut decoder = IncrementalDecoder::new(
    |batch: &RowBatch<'_>| {
        rows += batch.num_rows();
        true
    },
    DecodeSettings::default(),
);

for chunk in data.chunks(1024) {
    match decoder.append(chunk) {
        Ok(()) | Err(hayro_webp::DecodeError::Suspended) => {}
        Err(e) => panic!("{e}"),
    }
}
```

# Safety
This crate forbids unsafe code via a crate-level attribute.

# Cargo features
- `std`: Enables the standard library. Also needed to run the two
  encoding attempts of [`EncodeSettings::cache_bits`] in parallel.
- `image`: Implements [`image::ImageDecoder`] for lossless images.
- `logging`: Emits log messages via the `log` crate.
*/

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
#![allow(missing_docs)]

extern crate alloc;

#[macro_use]
mod log;

mod backward_refs;
mod bit_reader;
mod bit_writer;
mod color_cache;
mod error;
mod huffman;
mod incremental;
#[cfg(feature = "image")]
mod integration;
mod lossless;
mod range_decoder;
mod range_encoder;
pub mod vp8;

use alloc::vec::Vec;

pub use error::{BitstreamError, DecodeError, ParameterError, Result, UnsupportedFeature};
pub use incremental::{DecodeState, IncrementalDecoder};
#[cfg(feature = "image")]
pub use integration::{Vp8lDecoder, register_decoding_hook};
pub use lossless::encoder::{CrossColorSettings, EncodeInput, EncodeSettings, PredictorSettings};
pub use lossless::transform::Multipliers;
pub use lossless::{LosslessHeader, LosslessImage};
pub use vp8::{FrameWriter, LossyHeader, Macroblock};

/// How the bit readers load data into their window.
///
/// Both strategies decode the exact same symbols; they only differ in how
/// many bytes are loaded at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Refill {
    /// Load as many bytes as fit into the window.
    #[default]
    Wide,
    /// Load a single byte at a time.
    Bytewise,
}

/// The two kinds of WebP bitstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamFormat {
    /// A VP8 key frame.
    Lossy,
    /// A VP8L image.
    Lossless,
}

/// Settings that should be applied during decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeSettings {
    /// How the bit readers load data.
    pub refill: Refill,
    /// The format of the bitstream. If `None`, it's detected from the first
    /// bytes.
    pub format: Option<BitstreamFormat>,
    /// Reject images with more pixels than this.
    pub max_pixels: Option<u64>,
}

/// Basic information about an image, available once its header is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Whether the image claims to use alpha. Lossy frames never have alpha.
    pub has_alpha: bool,
    pub format: BitstreamFormat,
}

/// A group of decoded rows handed to a [`RowSink`].
#[derive(Debug, Clone, Copy)]
pub enum RowBatch<'a> {
    /// Pixel rows of a lossless image, as `0xAARRGGBB`.
    Argb {
        start_row: u32,
        width: u32,
        pixels: &'a [u32],
    },
    /// One macroblock row of a lossy frame.
    Macroblocks {
        mb_y: u32,
        macroblocks: &'a [Macroblock],
    },
}

impl RowBatch<'_> {
    /// Number of pixel rows covered by the batch. A macroblock row counts
    /// as 16 rows, even at the bottom edge of the frame.
    pub fn num_rows(&self) -> usize {
        match self {
            Self::Argb { width, pixels, .. } => pixels.len() / (*width as usize).max(1),
            Self::Macroblocks { .. } => 16,
        }
    }
}

/// Receives decoded rows.
pub trait RowSink {
    /// Handle a batch of rows. Returning `false` aborts decoding with
    /// [`DecodeError::UserAbort`].
    fn rows(&mut self, batch: &RowBatch<'_>) -> bool;
}

impl<F: FnMut(&RowBatch<'_>) -> bool> RowSink for F {
    fn rows(&mut self, batch: &RowBatch<'_>) -> bool {
        self(batch)
    }
}

/// Read the basic information of a bitstream from its first bytes.
pub fn read_info(data: &[u8]) -> Result<ImageInfo> {
    if lossless::is_lossless(data) {
        let mut reader = bit_reader::BitReader::new(data, Refill::Wide);
        let header = LosslessHeader::read(&mut reader)?;

        return Ok(header.info());
    }

    Ok(vp8::FrameHeader::read(data)?.info())
}

/// Decode a complete lossless bitstream into ARGB pixels.
pub fn decode_lossless(data: &[u8]) -> Result<LosslessImage> {
    lossless::decode(data, &DecodeSettings::default())
}

/// Decode a complete lossless bitstream with custom settings.
pub fn decode_lossless_with(data: &[u8], settings: &DecodeSettings) -> Result<LosslessImage> {
    lossless::decode(data, settings)
}

/// Decode a complete lossy key frame, handing each macroblock row to `sink`.
pub fn decode_lossy(data: &[u8], sink: &mut impl RowSink) -> Result<LossyHeader> {
    vp8::decode(data, &DecodeSettings::default(), sink)
}

/// Encode ARGB pixels as a lossless bitstream.
pub fn encode_lossless(input: &EncodeInput<'_>, settings: &EncodeSettings) -> Result<Vec<u8>> {
    lossless::encoder::encode(input, settings)
}
