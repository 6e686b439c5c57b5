//! Parsing of lossy key frames (RFC 6386).
//!
//! A key frame starts with an uncompressed 10-byte header, followed by the
//! first partition, which holds the frame header proper and the prediction
//! modes of all macroblocks, and one or more token partitions with the
//! residual coefficients. Macroblock row `y` takes its tokens from partition
//! `y & (n - 1)`.
//!
//! Reconstruction isn't done here. Each decoded macroblock row is handed to
//! the sink as a list of [`Macroblock`]s holding the segment, the prediction
//! modes and the dequantized coefficients.

mod tables;
pub(crate) mod writer;

use crate::error::{BitstreamError, DecodeError, Result, UnsupportedFeature, bail};
use crate::range_decoder::{RangeDecoder, RangeDecoderState};
use crate::{BitstreamFormat, DecodeSettings, ImageInfo, Refill, RowBatch, RowSink};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Range;
use smallvec::SmallVec;
use tables::*;

pub use writer::{FrameWriter, MacroblockLevels};

/// Size of the frame tag.
pub(crate) const FRAME_TAG_SIZE: usize = 3;
/// Size of the uncompressed header of a key frame.
pub(crate) const KEY_FRAME_HEADER_SIZE: usize = 10;
const START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];
const MAX_PARTITIONS: usize = 8;
/// Number of token contexts kept per macroblock edge: one for the Y2 block,
/// four for luma and two for each chroma plane.
const NUM_CONTEXTS: usize = 9;
const MAX_DIMENSION: u16 = 0x3fff;

/// Bit of [`Macroblock::non_zero`] that is set when the Y2 block has tokens.
pub const NON_ZERO_Y2: u32 = 1 << 24;

/// Prediction mode of the whole luma block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LumaMode {
    /// Predict from the average of the row above and the column to the left.
    #[default]
    Dc,
    /// Copy the row above.
    V,
    /// Copy the column to the left.
    H,
    /// TrueMotion.
    Tm,
    /// Each 4x4 subblock has its own mode.
    B,
}

/// Prediction mode of both chroma blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChromaMode {
    #[default]
    Dc,
    V,
    H,
    Tm,
}

/// Prediction mode of a 4x4 luma subblock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntraMode {
    #[default]
    Dc,
    Tm,
    Ve,
    He,
    Ld,
    Rd,
    Vr,
    Vl,
    Hd,
    Hu,
}

// Indexed by tree leaf.
const LUMA_MODES: [LumaMode; 5] = [
    LumaMode::Dc,
    LumaMode::V,
    LumaMode::H,
    LumaMode::Tm,
    LumaMode::B,
];
const CHROMA_MODES: [ChromaMode; 4] = [
    ChromaMode::Dc,
    ChromaMode::V,
    ChromaMode::H,
    ChromaMode::Tm,
];
const INTRA_MODES: [IntraMode; NUM_BPRED_MODES] = [
    IntraMode::Dc,
    IntraMode::Tm,
    IntraMode::Ve,
    IntraMode::He,
    IntraMode::Ld,
    IntraMode::Rd,
    IntraMode::Vr,
    IntraMode::Vl,
    IntraMode::Hd,
    IntraMode::Hu,
];

impl LumaMode {
    pub(crate) fn leaf(self) -> i8 {
        match self {
            Self::Dc => DC_PRED,
            Self::V => V_PRED,
            Self::H => H_PRED,
            Self::Tm => TM_PRED,
            Self::B => B_PRED,
        }
    }

    /// The subblock mode that neighbors see for a macroblock predicted as a
    /// whole.
    pub(crate) fn implied_subblock_mode(self) -> IntraMode {
        match self {
            Self::Dc | Self::B => IntraMode::Dc,
            Self::V => IntraMode::Ve,
            Self::H => IntraMode::He,
            Self::Tm => IntraMode::Tm,
        }
    }
}

impl ChromaMode {
    pub(crate) fn leaf(self) -> i8 {
        match self {
            Self::Dc => DC_PRED,
            Self::V => V_PRED,
            Self::H => H_PRED,
            Self::Tm => TM_PRED,
        }
    }
}

impl IntraMode {
    pub(crate) fn leaf(self) -> i8 {
        self as i8
    }
}

/// The uncompressed part of a key frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub profile: u8,
    /// Size of the first partition in bytes.
    pub partition0_size: u32,
    pub width: u16,
    /// Upscaling hint for the width, not applied by the decoder.
    pub horizontal_scale: u8,
    pub height: u16,
    /// Upscaling hint for the height, not applied by the decoder.
    pub vertical_scale: u8,
}

impl FrameHeader {
    /// Parse the first [`KEY_FRAME_HEADER_SIZE`] bytes of a frame.
    pub(crate) fn read(data: &[u8]) -> Result<Self> {
        let Some(tag) = data.get(..FRAME_TAG_SIZE) else {
            bail!(BitstreamError::UnexpectedEof);
        };

        let bits = u32::from(tag[0]) | (u32::from(tag[1]) << 8) | (u32::from(tag[2]) << 16);
        let key_frame = bits & 1 == 0;
        let profile = ((bits >> 1) & 7) as u8;
        let show = (bits >> 4) & 1 == 1;
        let partition0_size = bits >> 5;

        if !key_frame {
            bail!(UnsupportedFeature::NonKeyFrame);
        }

        if profile > 3 {
            bail!(BitstreamError::InvalidProfile);
        }

        if !show {
            bail!(UnsupportedFeature::HiddenFrame);
        }

        let Some(rest) = data.get(FRAME_TAG_SIZE..KEY_FRAME_HEADER_SIZE) else {
            bail!(BitstreamError::UnexpectedEof);
        };

        if rest[..3] != START_CODE {
            bail!(BitstreamError::InvalidStartCode);
        }

        let width = u16::from_le_bytes([rest[3], rest[4]]);
        let height = u16::from_le_bytes([rest[5], rest[6]]);

        let header = Self {
            profile,
            partition0_size,
            width: width & MAX_DIMENSION,
            horizontal_scale: (width >> 14) as u8,
            height: height & MAX_DIMENSION,
            vertical_scale: (height >> 14) as u8,
        };

        if header.width == 0 || header.height == 0 {
            bail!(BitstreamError::EmptyFrame);
        }

        Ok(header)
    }

    /// Number of macroblock columns.
    pub fn mb_width(&self) -> u32 {
        (self.width as u32).div_ceil(16)
    }

    /// Number of macroblock rows.
    pub fn mb_height(&self) -> u32 {
        (self.height as u32).div_ceil(16)
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
            width: self.width as u32,
            height: self.height as u32,
            has_alpha: false,
            format: BitstreamFormat::Lossy,
        }
    }
}

/// Segment-based adjustments (Section 9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub enabled: bool,
    /// Whether each macroblock codes its segment id.
    pub update_map: bool,
    /// Whether the values below replace the frame values instead of being
    /// added to them.
    pub absolute_values: bool,
    pub quantizer: [i8; MAX_SEGMENTS],
    pub filter_strength: [i8; MAX_SEGMENTS],
    /// Probabilities of the segment id tree.
    pub tree_probs: [u8; 3],
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self {
            enabled: false,
            update_map: false,
            absolute_values: true,
            quantizer: [0; MAX_SEGMENTS],
            filter_strength: [0; MAX_SEGMENTS],
            tree_probs: [255; 3],
        }
    }
}

/// Loop filter parameters (Section 9.6). The filter itself is applied
/// during reconstruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterHeader {
    pub simple: bool,
    pub level: u8,
    pub sharpness: u8,
    pub use_deltas: bool,
    pub ref_deltas: [i8; 4],
    pub mode_deltas: [i8; 4],
}

/// Quantizer indices (Section 9.6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantIndices {
    pub base: u8,
    pub y1_dc: i8,
    pub y2_dc: i8,
    pub y2_ac: i8,
    pub uv_dc: i8,
    pub uv_ac: i8,
}

/// Everything known about a lossy frame before its macroblocks are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossyHeader {
    pub frame: FrameHeader,
    pub color_space: u8,
    pub clamping_type: u8,
    pub segments: SegmentHeader,
    pub filter: FilterHeader,
    /// Number of token partitions, one of 1, 2, 4 or 8.
    pub num_partitions: u8,
    pub quant: QuantIndices,
    /// Probability of the skip flag, if macroblocks code one.
    pub skip_prob: Option<u8>,
}

impl LossyHeader {
    /// A header for a `width` by `height` frame with one token partition,
    /// no segments, no loop filter and quantizer index 0.
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            frame: FrameHeader {
                profile: 0,
                partition0_size: 0,
                width,
                horizontal_scale: 0,
                height,
                vertical_scale: 0,
            },
            color_space: 0,
            clamping_type: 0,
            segments: SegmentHeader::default(),
            filter: FilterHeader::default(),
            num_partitions: 1,
            quant: QuantIndices::default(),
            skip_prob: None,
        }
    }
}

/// The symbols of one macroblock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Macroblock {
    pub segment: u8,
    /// The coded skip flag. Skipped macroblocks have no coefficients.
    pub skip: bool,
    pub luma: LumaMode,
    /// Modes of the 16 luma subblocks in raster order. For macroblocks that
    /// aren't [`LumaMode::B`], all of them hold the implied mode.
    pub subblock_modes: [IntraMode; 16],
    pub chroma: ChromaMode,
    /// Dequantized coefficients of the Y2 block in raster order, whose
    /// inverse Walsh-Hadamard transform yields the DC of each luma block.
    /// Only coded when `luma` isn't [`LumaMode::B`].
    pub y2: [i32; 16],
    /// Dequantized coefficients of the 16 luma, 4 U and 4 V blocks in raster
    /// order. The DC of luma blocks is zero when a Y2 block is coded.
    pub coeffs: [[i32; 16]; 24],
    /// Bit `i` is set when block `i` of `coeffs` had tokens, see also
    /// [`NON_ZERO_Y2`].
    pub non_zero: u32,
}

/// Dequantization factors of one segment, as `[dc, ac]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Dequant {
    y1: [i32; 2],
    y2: [i32; 2],
    uv: [i32; 2],
}

fn dequant_factors(segments: &SegmentHeader, quant: &QuantIndices) -> [Dequant; MAX_SEGMENTS] {
    let mut factors = [Dequant::default(); MAX_SEGMENTS];

    for (i, dq) in factors.iter_mut().enumerate() {
        let q = if !segments.enabled {
            quant.base as i32
        } else if segments.absolute_values {
            segments.quantizer[i] as i32
        } else {
            segments.quantizer[i] as i32 + quant.base as i32
        };

        let dc = |delta: i8, max: i32| DC_QUANT[(q + delta as i32).clamp(0, max) as usize] as i32;
        let ac = |delta: i8| AC_QUANT[(q + delta as i32).clamp(0, 127) as usize] as i32;

        *dq = Dequant {
            y1: [dc(quant.y1_dc, 127), ac(0)],
            // x * 155 / 100, exactly.
            y2: [dc(quant.y2_dc, 127) * 2, ((ac(quant.y2_ac) * 101581) >> 16).max(8)],
            uv: [dc(quant.uv_dc, 117), ac(quant.uv_ac)],
        };
    }

    factors
}

fn read_segment_header(reader: &mut RangeDecoder<'_>) -> SegmentHeader {
    let mut header = SegmentHeader {
        enabled: reader.read_flag(),
        ..SegmentHeader::default()
    };

    if !header.enabled {
        return header;
    }

    header.update_map = reader.read_flag();

    if reader.read_flag() {
        header.absolute_values = reader.read_flag();

        for q in &mut header.quantizer {
            *q = reader.read_optional_signed_value(7) as i8;
        }

        for f in &mut header.filter_strength {
            *f = reader.read_optional_signed_value(6) as i8;
        }
    }

    if header.update_map {
        for prob in &mut header.tree_probs {
            *prob = if reader.read_flag() {
                reader.read_value(8) as u8
            } else {
                255
            };
        }
    }

    header
}

fn read_filter_header(reader: &mut RangeDecoder<'_>) -> FilterHeader {
    let mut header = FilterHeader {
        simple: reader.read_flag(),
        level: reader.read_value(6) as u8,
        sharpness: reader.read_value(3) as u8,
        use_deltas: reader.read_flag(),
        ..FilterHeader::default()
    };

    if header.use_deltas && reader.read_flag() {
        for delta in header
            .ref_deltas
            .iter_mut()
            .chain(header.mode_deltas.iter_mut())
        {
            *delta = reader.read_optional_signed_value(6) as i8;
        }
    }

    header
}

fn read_quant_indices(reader: &mut RangeDecoder<'_>) -> QuantIndices {
    QuantIndices {
        base: reader.read_value(7) as u8,
        y1_dc: reader.read_optional_signed_value(4) as i8,
        y2_dc: reader.read_optional_signed_value(4) as i8,
        y2_ac: reader.read_optional_signed_value(4) as i8,
        uv_dc: reader.read_optional_signed_value(4) as i8,
        uv_ac: reader.read_optional_signed_value(4) as i8,
    }
}

fn read_token_probs(reader: &mut RangeDecoder<'_>, probs: &mut TokenProbs) {
    for (plane, updates) in probs.iter_mut().zip(COEFF_UPDATE_PROBS.iter()) {
        for (band, updates) in plane.iter_mut().zip(updates.iter()) {
            for (context, updates) in band.iter_mut().zip(updates.iter()) {
                for (prob, update) in context.iter_mut().zip(updates.iter()) {
                    if reader.read_bit(*update) {
                        *prob = reader.read_value(8) as u8;
                    }
                }
            }
        }
    }
}

fn read_intra_modes(
    reader: &mut RangeDecoder<'_>,
    header: &LossyHeader,
    mb: &mut Macroblock,
    top: &mut [IntraMode; 4],
    left: &mut [IntraMode; 4],
) {
    mb.segment = if header.segments.update_map {
        reader.read_tree(&SEGMENT_ID_TREE, &header.segments.tree_probs) as u8
    } else {
        0
    };

    mb.skip = header.skip_prob.is_some_and(|prob| reader.read_bit(prob));
    mb.luma = LUMA_MODES[reader.read_tree(&KEYFRAME_YMODE_TREE, &KEYFRAME_YMODE_PROBS) as usize];

    if mb.luma == LumaMode::B {
        for y in 0..4 {
            for x in 0..4 {
                let probs = &KEYFRAME_BPRED_MODE_PROBS[top[x] as usize][left[y] as usize];
                let mode = INTRA_MODES[reader.read_tree(&KEYFRAME_BPRED_MODE_TREE, probs) as usize];

                mb.subblock_modes[x + 4 * y] = mode;
                top[x] = mode;
                left[y] = mode;
            }
        }
    } else {
        let mode = mb.luma.implied_subblock_mode();
        mb.subblock_modes = [mode; 16];
        *top = [mode; 4];
        *left = [mode; 4];
    }

    mb.chroma =
        CHROMA_MODES[reader.read_tree(&KEYFRAME_UV_MODE_TREE, &KEYFRAME_UV_MODE_PROBS) as usize];
}

/// Read the tokens of one block into `out`, dequantized and in raster order.
/// Returns whether the block had any token besides an immediate end of
/// block.
fn read_coefficients(
    reader: &mut RangeDecoder<'_>,
    probs: &[[[u8; NUM_DCT_TOKENS - 1]; 3]; 8],
    context: u8,
    first: usize,
    dq: [i32; 2],
    out: &mut [i32; 16],
) -> bool {
    let mut context = context as usize;
    let mut has_tokens = false;
    let mut after_zero = false;

    for i in first..16 {
        let table = &probs[COEFF_BANDS[i] as usize][context];
        // An end of block can't follow a zero.
        let start = if after_zero { 2 } else { 0 };

        let magnitude = match reader.read_tree_from(&DCT_TOKEN_TREE, table, start) {
            DCT_EOB => break,
            DCT_0 => {
                has_tokens = true;
                after_zero = true;
                context = 0;
                continue;
            }
            literal @ DCT_1..=DCT_4 => literal as i32,
            category => {
                let category = (category - DCT_CAT1) as usize;
                let mut extra = 0;

                for prob in PROB_DCT_CAT[category].iter().take_while(|p| **p > 0) {
                    extra = (extra << 1) | reader.read_bit(*prob) as i32;
                }

                DCT_CAT_BASE[category] as i32 + extra
            }
        };

        has_tokens = true;
        after_zero = false;
        context = if magnitude == 1 { 1 } else { 2 };

        let value = reader.read_signed(magnitude);
        out[ZIGZAG[i] as usize] = value * dq[(i > 0) as usize];
    }

    has_tokens
}

/// Read the coefficients of all blocks of `mb`, updating the token
/// contexts along its top and left edge.
fn read_residuals(
    reader: &mut RangeDecoder<'_>,
    probs: &TokenProbs,
    dq: &Dequant,
    mb: &mut Macroblock,
    top: &mut [u8; NUM_CONTEXTS],
    left: &mut [u8; NUM_CONTEXTS],
) {
    mb.y2 = [0; 16];
    mb.coeffs = [[0; 16]; 24];
    mb.non_zero = 0;

    if mb.skip {
        if mb.luma != LumaMode::B {
            top[0] = 0;
            left[0] = 0;
        }

        top[1..].fill(0);
        left[1..].fill(0);

        return;
    }

    let (plane, first) = if mb.luma != LumaMode::B {
        let context = top[0] + left[0];
        let nz = read_coefficients(reader, &probs[1], context, 0, dq.y2, &mut mb.y2);

        top[0] = nz as u8;
        left[0] = nz as u8;

        if nz {
            mb.non_zero |= NON_ZERO_Y2;
        }

        (0, 1)
    } else {
        (3, 0)
    };

    for y in 0..4 {
        for x in 0..4 {
            let block = x + 4 * y;
            let context = top[1 + x] + left[1 + y];
            let nz = read_coefficients(
                reader,
                &probs[plane],
                context,
                first,
                dq.y1,
                &mut mb.coeffs[block],
            );

            top[1 + x] = nz as u8;
            left[1 + y] = nz as u8;
            mb.non_zero |= (nz as u32) << block;
        }
    }

    for (offset, ctx) in [(16, 5), (20, 7)] {
        for y in 0..2 {
            for x in 0..2 {
                let block = offset + x + 2 * y;
                let context = top[ctx + x] + left[ctx + y];
                let nz = read_coefficients(
                    reader,
                    &probs[2],
                    context,
                    0,
                    dq.uv,
                    &mut mb.coeffs[block],
                );

                top[ctx + x] = nz as u8;
                left[ctx + y] = nz as u8;
                mb.non_zero |= (nz as u32) << block;
            }
        }
    }
}

/// A token partition.
#[derive(Debug, Clone, Copy)]
struct Partition {
    start: usize,
    /// The declared size, `None` for the last partition, which extends to
    /// the end of the data.
    len: Option<usize>,
    state: RangeDecoderState,
}

/// Decodes the macroblock rows of a lossy frame, possibly across several
/// calls with growing data.
#[derive(Debug, Clone)]
pub(crate) struct Vp8Decoder {
    header: LossyHeader,
    dequant: [Dequant; MAX_SEGMENTS],
    token_probs: Box<TokenProbs>,
    partition0: Range<usize>,
    /// Where the modes of the next row start in the first partition.
    modes: RangeDecoderState,
    partitions: SmallVec<[Partition; MAX_PARTITIONS]>,
    /// Subblock modes along the bottom edge of the row above.
    top_modes: Vec<[IntraMode; 4]>,
    /// Token contexts along the bottom edge of the row above.
    top_contexts: Vec<[u8; NUM_CONTEXTS]>,
    /// `top_contexts` at the start of the current row.
    saved_contexts: Vec<[u8; NUM_CONTEXTS]>,
    row: Vec<Macroblock>,
    mb_y: usize,
    /// Whether `row` already holds the modes of row `mb_y`.
    modes_parsed: bool,
    /// Whether running out of data may be followed by more data.
    incremental: bool,
}

impl Vp8Decoder {
    /// Parse the first partition header and the partition table.
    ///
    /// Needs the whole first partition, the partition table and at least one
    /// byte of the last partition.
    pub(crate) fn new(
        data: &[u8],
        frame: FrameHeader,
        settings: &DecodeSettings,
        incremental: bool,
    ) -> Result<Self> {
        frame.check_limit(settings)?;

        let partition0 = KEY_FRAME_HEADER_SIZE..KEY_FRAME_HEADER_SIZE + frame.partition0_size as usize;

        let Some(part0) = data.get(partition0.clone()) else {
            bail!(BitstreamError::UnexpectedEof);
        };

        let mut reader = RangeDecoder::new(part0, settings.refill);
        let color_space = reader.read_value(1) as u8;
        let clamping_type = reader.read_value(1) as u8;
        let segments = read_segment_header(&mut reader);
        let filter = read_filter_header(&mut reader);
        let num_partitions = 1_usize << reader.read_value(2);
        let quant = read_quant_indices(&mut reader);
        // Probabilities never carry over to another frame, so whether they
        // would be kept doesn't matter.
        reader.read_flag();

        let mut token_probs = Box::new(COEFF_PROBS);
        read_token_probs(&mut reader, &mut token_probs);
        let skip_prob = reader.read_flag().then(|| reader.read_value(8) as u8);

        if reader.eof() {
            bail!(BitstreamError::TruncatedPartition);
        }

        let tokens_start = partition0.end + 3 * (num_partitions - 1);

        let Some(sizes) = data.get(partition0.end..tokens_start) else {
            bail!(BitstreamError::UnexpectedEof);
        };

        let mut partitions = SmallVec::new();
        let mut start = tokens_start;

        for size in sizes.chunks_exact(3) {
            let len = u32::from_le_bytes([size[0], size[1], size[2], 0]) as usize;

            partitions.push(Partition {
                start,
                len: Some(len),
                state: RangeDecoderState::new(),
            });

            start += len;
        }

        partitions.push(Partition {
            start,
            len: None,
            state: RangeDecoderState::new(),
        });

        if start >= data.len() {
            if incremental {
                bail!(BitstreamError::UnexpectedEof);
            }

            bail!(BitstreamError::InvalidPartitions);
        }

        let header = LossyHeader {
            frame,
            color_space,
            clamping_type,
            segments,
            filter,
            num_partitions: num_partitions as u8,
            quant,
            skip_prob,
        };

        ldebug!(
            "lossy frame {}x{}, {} token partitions, base quantizer {}, segments {}",
            frame.width,
            frame.height,
            num_partitions,
            quant.base,
            segments.enabled
        );

        let mb_width = frame.mb_width() as usize;

        Ok(Self {
            header,
            dequant: dequant_factors(&segments, &quant),
            token_probs,
            modes: reader.state(),
            partition0,
            partitions,
            top_modes: filled(mb_width, [IntraMode::Dc; 4])?,
            top_contexts: filled(mb_width, [0; NUM_CONTEXTS])?,
            saved_contexts: filled(mb_width, [0; NUM_CONTEXTS])?,
            row: filled(mb_width, Macroblock::default())?,
            mb_y: 0,
            modes_parsed: false,
            incremental,
        })
    }

    pub(crate) fn header(&self) -> &LossyHeader {
        &self.header
    }

    /// Number of macroblock rows emitted so far.
    pub(crate) fn rows_emitted(&self) -> usize {
        self.mb_y
    }

    /// Byte offset of the earliest data still needed.
    pub(crate) fn resume_offset(&self) -> usize {
        self.partition0.start
    }

    /// Drop the first `bytes` bytes from all offsets after the data before
    /// them was discarded.
    pub(crate) fn rebase(&mut self, bytes: usize) {
        self.partition0 = self.partition0.start - bytes..self.partition0.end - bytes;

        for partition in &mut self.partitions {
            partition.start -= bytes;
        }
    }

    /// Decode and emit macroblock rows until the first `last_row` pixel
    /// rows are covered. Returns whether the frame is complete.
    pub(crate) fn decode<S: RowSink + ?Sized>(
        &mut self,
        data: &[u8],
        refill: Refill,
        last_row: usize,
        sink: &mut S,
    ) -> Result<bool> {
        let mb_height = self.header.frame.mb_height() as usize;
        let last_mb_row = last_row.div_ceil(16).min(mb_height);

        while self.mb_y < last_mb_row {
            if !self.modes_parsed {
                self.read_modes(data, refill)?;
                self.modes_parsed = true;
            }

            self.read_tokens(data, refill)?;

            ltrace!("macroblock row {} complete", self.mb_y);

            let batch = RowBatch::Macroblocks {
                mb_y: self.mb_y as u32,
                macroblocks: &self.row,
            };

            self.mb_y += 1;
            self.modes_parsed = false;

            if !sink.rows(&batch) {
                bail!(DecodeError::UserAbort);
            }
        }

        Ok(self.mb_y == mb_height)
    }

    fn read_modes(&mut self, data: &[u8], refill: Refill) -> Result<()> {
        let mut reader = RangeDecoder::resume(&data[self.partition0.clone()], self.modes, refill);
        let mut left = [IntraMode::Dc; 4];

        for (mb, top) in self.row.iter_mut().zip(self.top_modes.iter_mut()) {
            read_intra_modes(&mut reader, &self.header, mb, top, &mut left);
        }

        // The first partition is complete, so this isn't a matter of
        // waiting for more data.
        if reader.eof() {
            bail!(BitstreamError::TruncatedPartition);
        }

        self.modes = reader.state();

        Ok(())
    }

    fn read_tokens(&mut self, data: &[u8], refill: Refill) -> Result<()> {
        let index = self.mb_y & (self.partitions.len() - 1);
        let partition = self.partitions[index];
        let declared_end = partition.len.map(|len| partition.start + len);
        let end = declared_end.unwrap_or(data.len()).min(data.len());
        let bytes = data.get(partition.start..end).unwrap_or_default();

        let mut reader = RangeDecoder::resume(bytes, partition.state, refill);
        let mut left = [0; NUM_CONTEXTS];
        self.saved_contexts.copy_from_slice(&self.top_contexts);

        for (mb, top) in self.row.iter_mut().zip(self.top_contexts.iter_mut()) {
            let dq = &self.dequant[mb.segment as usize];
            read_residuals(&mut reader, &self.token_probs, dq, mb, top, &mut left);

            if reader.eof() {
                break;
            }
        }

        if reader.eof() {
            if declared_end.is_some_and(|end| end <= data.len()) {
                lwarn!("token partition {} ends before its last macroblock", index);
                bail!(BitstreamError::TruncatedPartition);
            }

            if self.incremental {
                self.top_contexts.copy_from_slice(&self.saved_contexts);
                ltrace!("token partition {} ran out of data in row {}", index, self.mb_y);
            }

            bail!(BitstreamError::UnexpectedEof);
        }

        self.partitions[index].state = reader.state();

        Ok(())
    }
}

fn filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);

    Ok(v)
}

/// Decode a complete lossy frame, handing each macroblock row to `sink`.
pub(crate) fn decode<S: RowSink + ?Sized>(
    data: &[u8],
    settings: &DecodeSettings,
    sink: &mut S,
) -> Result<LossyHeader> {
    let frame = FrameHeader::read(data)?;
    let mut decoder = Vp8Decoder::new(data, frame, settings, false)?;
    decoder.decode(data, settings.refill, usize::MAX, sink)?;

    Ok(decoder.header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanorand::RNG;

    fn random_levels(rng: &mut nanorand::WyRand, zeros: bool) -> MacroblockLevels {
        let mut mb = MacroblockLevels::default();
        let level = |rng: &mut nanorand::WyRand| -> i16 {
            match rng.generate_range::<u32>(0, 10) {
                0..=4 => 0,
                5..=7 => rng.generate_range::<u32>(0, 5) as i16 - 2,
                8 => rng.generate_range::<u32>(0, 80) as i16 - 40,
                _ => rng.generate_range::<u32>(0, 4000) as i16 - 2000,
            }
        };

        mb.luma = LUMA_MODES[rng.generate_range::<u32>(0, 5) as usize];
        mb.chroma = CHROMA_MODES[rng.generate_range::<u32>(0, 4) as usize];

        for mode in &mut mb.subblock_modes {
            *mode = INTRA_MODES[rng.generate_range::<u32>(0, 10) as usize];
        }

        if zeros {
            return mb;
        }

        for block in mb.coeffs.iter_mut() {
            for c in block.iter_mut() {
                *c = level(rng);
            }
        }

        for c in &mut mb.y2 {
            *c = level(rng);
        }

        if mb.luma != LumaMode::B {
            for block in &mut mb.coeffs[..16] {
                block[0] = 0;
            }
        }

        mb
    }

    fn expected(levels: &MacroblockLevels, dq: &Dequant) -> Macroblock {
        let mut mb = Macroblock {
            segment: levels.segment,
            luma: levels.luma,
            chroma: levels.chroma,
            subblock_modes: if levels.luma == LumaMode::B {
                levels.subblock_modes
            } else {
                [levels.luma.implied_subblock_mode(); 16]
            },
            ..Macroblock::default()
        };

        let scale = |block: &[i16; 16], f: [i32; 2]| -> [i32; 16] {
            core::array::from_fn(|i| block[i] as i32 * f[(i > 0) as usize])
        };

        if levels.luma != LumaMode::B {
            mb.y2 = scale(&levels.y2, dq.y2);
        }

        for (i, block) in levels.coeffs.iter().enumerate() {
            mb.coeffs[i] = scale(block, if i < 16 { dq.y1 } else { dq.uv });
        }

        mb
    }

    fn collect(data: &[u8], settings: &DecodeSettings) -> Result<(LossyHeader, Vec<Macroblock>)> {
        let mut mbs = Vec::new();
        let header = decode(data, settings, &mut |batch: &RowBatch<'_>| {
            if let RowBatch::Macroblocks { macroblocks, .. } = batch {
                mbs.extend_from_slice(macroblocks);
            }

            true
        })?;

        Ok((header, mbs))
    }

    fn strip_flags(mbs: &mut [Macroblock]) {
        for mb in mbs {
            mb.non_zero = 0;
            mb.skip = false;
        }
    }

    #[test]
    fn frame_header_fields() {
        let mut data = [0_u8; 10];
        // Key frame, profile 2, shown, partition size 300.
        let tag = (300 << 5) | (1 << 4) | (2 << 1);
        data[..3].copy_from_slice(&u32::to_le_bytes(tag)[..3]);
        data[3..6].copy_from_slice(&START_CODE);
        data[6..8].copy_from_slice(&(100_u16 | (1 << 14)).to_le_bytes());
        data[8..10].copy_from_slice(&(3_u16 | (3 << 14)).to_le_bytes());

        let header = FrameHeader::read(&data).unwrap();
        assert_eq!(header.profile, 2);
        assert_eq!(header.partition0_size, 300);
        assert_eq!((header.width, header.horizontal_scale), (100, 1));
        assert_eq!((header.height, header.vertical_scale), (3, 3));
        assert_eq!((header.mb_width(), header.mb_height()), (7, 1));

        assert_eq!(
            FrameHeader::read(&data[..9]),
            Err(BitstreamError::UnexpectedEof.into())
        );

        let mut bad = data;
        bad[0] |= 1;
        assert_eq!(
            FrameHeader::read(&bad[..3]),
            Err(UnsupportedFeature::NonKeyFrame.into())
        );

        let mut bad = data;
        bad[0] |= 4 << 1;
        assert_eq!(
            FrameHeader::read(&bad),
            Err(BitstreamError::InvalidProfile.into())
        );

        let mut bad = data;
        bad[0] &= !(1 << 4);
        assert_eq!(
            FrameHeader::read(&bad),
            Err(UnsupportedFeature::HiddenFrame.into())
        );

        let mut bad = data;
        bad[4] = 0x02;
        assert_eq!(
            FrameHeader::read(&bad),
            Err(BitstreamError::InvalidStartCode.into())
        );

        let mut bad = data;
        bad[6] = 0;
        bad[7] = 1 << 6;
        assert_eq!(
            FrameHeader::read(&bad),
            Err(BitstreamError::EmptyFrame.into())
        );
    }

    #[test]
    fn dequantization_limits() {
        let segments = SegmentHeader::default();
        let low = dequant_factors(&segments, &QuantIndices::default())[0];
        assert_eq!(low.y1, [4, 4]);
        assert_eq!(low.y2, [8, 8]);
        assert_eq!(low.uv, [4, 4]);

        let quant = QuantIndices {
            base: 127,
            ..QuantIndices::default()
        };
        let high = dequant_factors(&segments, &quant)[0];
        assert_eq!(high.y1, [157, 284]);
        assert_eq!(high.y2, [314, 440]);
        assert_eq!(high.uv, [132, 284]);

        let segments = SegmentHeader {
            enabled: true,
            absolute_values: false,
            quantizer: [-10, 0, 10, 127],
            ..SegmentHeader::default()
        };
        let quant = QuantIndices {
            base: 20,
            y1_dc: -15,
            ..QuantIndices::default()
        };
        let factors = dequant_factors(&segments, &quant);
        assert_eq!(factors[0].y1, [DC_QUANT[0] as i32, AC_QUANT[10] as i32]);
        assert_eq!(factors[1].y1, [DC_QUANT[5] as i32, AC_QUANT[20] as i32]);
        assert_eq!(factors[3].y1[1], AC_QUANT[127] as i32);
    }

    #[test]
    fn macroblocks_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(23);

        for (width, height, partitions) in [(16, 16, 1), (40, 24, 2), (70, 75, 4), (33, 130, 8)] {
            let mut header = LossyHeader::new(width, height);
            header.num_partitions = partitions;
            header.quant.base = 40;
            header.quant.uv_ac = -3;
            header.skip_prob = (partitions > 1).then_some(200);

            let mut writer = FrameWriter::new(&header).unwrap();
            let dq = dequant_factors(&header.segments, &header.quant)[0];
            let mut expected_mbs = Vec::new();
            let num_mbs = header.frame.mb_width() * header.frame.mb_height();

            for i in 0..num_mbs {
                let levels = random_levels(&mut rng, i % 5 == 3);
                expected_mbs.push(expected(&levels, &dq));
                writer.write_macroblock(&levels).unwrap();
            }

            let data = writer.finish().unwrap();

            for refill in [Refill::Wide, Refill::Bytewise] {
                let settings = DecodeSettings {
                    refill,
                    ..Default::default()
                };
                let (decoded, mut mbs) = collect(&data, &settings).unwrap();

                assert_eq!(decoded.frame.width, width);
                assert_eq!(decoded.num_partitions, partitions);
                assert_eq!(decoded.skip_prob, header.skip_prob);

                strip_flags(&mut mbs);
                assert_eq!(mbs, expected_mbs, "{width}x{height}");
            }
        }
    }

    #[test]
    fn segments_and_filter_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(5);
        let mut header = LossyHeader::new(48, 32);
        header.clamping_type = 1;
        header.segments = SegmentHeader {
            enabled: true,
            update_map: true,
            absolute_values: false,
            quantizer: [-5, 3, 17, 60],
            filter_strength: [0, -8, 12, 63],
            tree_probs: [30, 255, 200],
        };
        header.filter = FilterHeader {
            simple: true,
            level: 40,
            sharpness: 5,
            use_deltas: true,
            ref_deltas: [2, 0, -2, -2],
            mode_deltas: [4, -2, 2, 4],
        };
        header.quant = QuantIndices {
            base: 50,
            y1_dc: 3,
            y2_dc: -4,
            y2_ac: 15,
            uv_dc: -15,
            uv_ac: 7,
        };

        let dq = dequant_factors(&header.segments, &header.quant);
        let mut writer = FrameWriter::new(&header).unwrap();
        let mut expected_mbs = Vec::new();

        for i in 0..6 {
            let mut levels = random_levels(&mut rng, false);
            levels.segment = (i % 4) as u8;
            expected_mbs.push(expected(&levels, &dq[levels.segment as usize]));
            writer.write_macroblock(&levels).unwrap();
        }

        let data = writer.finish().unwrap();
        let (decoded, mut mbs) = collect(&data, &DecodeSettings::default()).unwrap();

        assert_eq!(decoded.segments, header.segments);
        assert_eq!(decoded.filter, header.filter);
        assert_eq!(decoded.quant, header.quant);
        assert_eq!(decoded.clamping_type, 1);

        strip_flags(&mut mbs);
        assert_eq!(mbs, expected_mbs);
    }

    #[test]
    fn custom_token_probabilities() {
        let mut rng = nanorand::WyRand::new_seed(77);
        let header = LossyHeader::new(32, 16);
        let mut probs = COEFF_PROBS;
        probs[0][1][0] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        probs[3][0][2][0] = 250;

        let mut writer = FrameWriter::with_token_probs(&header, &probs).unwrap();
        let mut levels = Vec::new();

        for _ in 0..2 {
            let mb = random_levels(&mut rng, false);
            writer.write_macroblock(&mb).unwrap();
            levels.push(mb);
        }

        let data = writer.finish().unwrap();
        let frame = FrameHeader::read(&data).unwrap();
        let decoder = Vp8Decoder::new(&data, frame, &DecodeSettings::default(), false).unwrap();
        assert_eq!(*decoder.token_probs, probs);

        let dq = decoder.dequant[0];
        let (_, mut mbs) = collect(&data, &DecodeSettings::default()).unwrap();
        strip_flags(&mut mbs);
        assert_eq!(mbs[1], expected(&levels[1], &dq));
    }

    #[test]
    fn skipped_macroblocks_have_no_coefficients() {
        let mut header = LossyHeader::new(32, 16);
        header.skip_prob = Some(128);

        let mut writer = FrameWriter::new(&header).unwrap();
        let mut levels = MacroblockLevels::default();
        writer.write_macroblock(&levels).unwrap();
        levels.coeffs[17][3] = 5;
        writer.write_macroblock(&levels).unwrap();

        let (_, mbs) = collect(&writer.finish().unwrap(), &DecodeSettings::default()).unwrap();
        assert!(mbs[0].skip);
        assert_eq!(mbs[0].non_zero, 0);
        assert!(!mbs[1].skip);
        assert_eq!(mbs[1].non_zero, 1 << 17);
        assert_ne!(mbs[1].coeffs[17][3], 0);
    }

    #[test]
    fn truncated_frames() {
        let mut rng = nanorand::WyRand::new_seed(1);
        let mut header = LossyHeader::new(64, 64);
        header.num_partitions = 2;

        let mut writer = FrameWriter::new(&header).unwrap();

        for _ in 0..16 {
            writer
                .write_macroblock(&random_levels(&mut rng, false))
                .unwrap();
        }

        let data = writer.finish().unwrap();
        assert!(collect(&data, &DecodeSettings::default()).is_ok());

        let frame = FrameHeader::read(&data).unwrap();
        let tokens_start = KEY_FRAME_HEADER_SIZE + frame.partition0_size as usize + 3;

        for len in [0, 5, KEY_FRAME_HEADER_SIZE + 1, tokens_start - 1] {
            assert_eq!(
                collect(&data[..len], &DecodeSettings::default()).unwrap_err(),
                BitstreamError::UnexpectedEof.into(),
                "length {len}"
            );
        }

        assert_eq!(
            collect(&data[..data.len() - 20], &DecodeSettings::default()).unwrap_err(),
            BitstreamError::UnexpectedEof.into()
        );

        // Claim that the first token partition is only 2 bytes long.
        let mut short = data.clone();
        short[tokens_start - 3..tokens_start].copy_from_slice(&[2, 0, 0]);
        assert_eq!(
            collect(&short, &DecodeSettings::default()).unwrap_err(),
            BitstreamError::TruncatedPartition.into()
        );

        // Let the first token partition swallow everything.
        let mut long = data;
        long[tokens_start - 3..tokens_start].copy_from_slice(&[0xff, 0xff, 0xff]);
        assert_eq!(
            collect(&long, &DecodeSettings::default()).unwrap_err(),
            BitstreamError::InvalidPartitions.into()
        );
    }

    #[test]
    fn row_limit_and_abort() {
        let mut rng = nanorand::WyRand::new_seed(3);
        let header = LossyHeader::new(16, 48);
        let mut writer = FrameWriter::new(&header).unwrap();

        for _ in 0..3 {
            writer
                .write_macroblock(&random_levels(&mut rng, false))
                .unwrap();
        }

        let data = writer.finish().unwrap();
        let settings = DecodeSettings::default();
        let frame = FrameHeader::read(&data).unwrap();
        let mut decoder = Vp8Decoder::new(&data, frame, &settings, false).unwrap();

        let mut rows = Vec::new();
        let mut sink = |batch: &RowBatch<'_>| {
            if let RowBatch::Macroblocks { mb_y, .. } = batch {
                rows.push(*mb_y);
            }

            true
        };

        assert_eq!(decoder.decode(&data, Refill::Wide, 17, &mut sink), Ok(false));
        assert_eq!(decoder.rows_emitted(), 2);
        assert_eq!(decoder.decode(&data, Refill::Wide, usize::MAX, &mut sink), Ok(true));
        assert_eq!(rows, [0, 1, 2]);

        let mut decoder = Vp8Decoder::new(&data, frame, &settings, false).unwrap();
        assert_eq!(
            decoder.decode(&data, Refill::Wide, usize::MAX, &mut |_: &RowBatch<'_>| false),
            Err(DecodeError::UserAbort)
        );
        assert_eq!(decoder.rows_emitted(), 1);
    }
}
