//! Writing of lossy key frames from quantized coefficients.
//!
//! No mode decision or quantization happens here. The caller supplies the
//! prediction modes and quantized levels of each macroblock, and the writer
//! produces the bitstream that [`decode_lossy`](crate::decode_lossy) turns
//! back into the same symbols.

use super::tables::*;
use super::{
    ChromaMode, FRAME_TAG_SIZE, IntraMode, KEY_FRAME_HEADER_SIZE, LossyHeader, LumaMode,
    MAX_DIMENSION, NUM_CONTEXTS, START_CODE,
};
use crate::error::{ParameterError, Result, bail};
use crate::range_encoder::RangeEncoder;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

/// Largest magnitude a token can code.
const MAX_LEVEL: u16 = 2048 + 67 - 1;
const MAX_PARTITION0_SIZE: usize = (1 << 19) - 1;
const MAX_PARTITION_SIZE: usize = (1 << 24) - 1;

/// The symbols of one macroblock, before dequantization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroblockLevels {
    pub segment: u8,
    pub luma: LumaMode,
    /// Only used for [`LumaMode::B`].
    pub subblock_modes: [IntraMode; 16],
    pub chroma: ChromaMode,
    /// Levels of the Y2 block in raster order. Ignored for [`LumaMode::B`].
    pub y2: [i16; 16],
    /// Levels of the 16 luma, 4 U and 4 V blocks in raster order. The DC
    /// level of luma blocks is ignored unless the mode is [`LumaMode::B`].
    pub coeffs: [[i16; 16]; 24],
}

impl MacroblockLevels {
    fn is_empty(&self) -> bool {
        let y2 = self.luma != LumaMode::B && self.y2.iter().any(|c| *c != 0);
        let first = if self.luma == LumaMode::B { 0 } else { 1 };
        let luma = self.coeffs[..16].iter().any(|b| b[first..].iter().any(|c| *c != 0));
        let chroma = self.coeffs[16..].iter().flatten().any(|c| *c != 0);

        !(y2 || luma || chroma)
    }
}

/// Writes the macroblocks of a key frame in raster order.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    header: LossyHeader,
    token_probs: Box<TokenProbs>,
    /// The first partition, with the frame header and all modes.
    modes: RangeEncoder,
    partitions: Vec<RangeEncoder>,
    mb_width: usize,
    mb_height: usize,
    mb_x: usize,
    mb_y: usize,
    top_modes: Vec<[IntraMode; 4]>,
    left_modes: [IntraMode; 4],
    top_contexts: Vec<[u8; NUM_CONTEXTS]>,
    left_contexts: [u8; NUM_CONTEXTS],
}

impl FrameWriter {
    /// Start a frame with the default token probabilities.
    ///
    /// `header.frame.partition0_size` is ignored.
    pub fn new(header: &LossyHeader) -> Result<Self> {
        Self::with_token_probs(header, &COEFF_PROBS)
    }

    /// Start a frame whose header replaces the default token probabilities
    /// with `probs`, indexed by plane, band, context and tree node.
    pub fn with_token_probs(
        header: &LossyHeader,
        probs: &[[[[u8; NUM_DCT_TOKENS - 1]; 3]; 8]; 4],
    ) -> Result<Self> {
        validate(header)?;

        let mut modes = RangeEncoder::new();
        write_header(&mut modes, header, probs);

        let mb_width = header.frame.mb_width() as usize;
        let mb_height = header.frame.mb_height() as usize;

        ldebug!(
            "writing lossy frame {}x{} with {} partitions",
            header.frame.width,
            header.frame.height,
            header.num_partitions
        );

        Ok(Self {
            header: *header,
            token_probs: Box::new(*probs),
            modes,
            partitions: vec![RangeEncoder::new(); header.num_partitions as usize],
            mb_width,
            mb_height,
            mb_x: 0,
            mb_y: 0,
            top_modes: vec![[IntraMode::Dc; 4]; mb_width],
            left_modes: [IntraMode::Dc; 4],
            top_contexts: vec![[0; NUM_CONTEXTS]; mb_width],
            left_contexts: [0; NUM_CONTEXTS],
        })
    }

    /// Write the next macroblock.
    pub fn write_macroblock(&mut self, mb: &MacroblockLevels) -> Result<()> {
        if self.mb_y >= self.mb_height {
            bail!(ParameterError::PixelCountMismatch);
        }

        let mut levels = mb.y2.iter().chain(mb.coeffs.iter().flatten());

        if mb.segment as usize >= MAX_SEGMENTS || levels.any(|c| c.unsigned_abs() > MAX_LEVEL) {
            bail!(ParameterError::InvalidSetting);
        }

        let skip = self.header.skip_prob.is_some() && mb.is_empty();
        self.write_modes(mb, skip);

        let index = self.mb_y & (self.partitions.len() - 1);
        let top = &mut self.top_contexts[self.mb_x];
        let left = &mut self.left_contexts;

        if skip {
            if mb.luma != LumaMode::B {
                top[0] = 0;
                left[0] = 0;
            }

            top[1..].fill(0);
            left[1..].fill(0);
        } else {
            write_residuals(
                &mut self.partitions[index],
                &self.token_probs,
                mb,
                top,
                left,
            );
        }

        self.mb_x += 1;

        if self.mb_x == self.mb_width {
            self.mb_x = 0;
            self.mb_y += 1;
            self.left_modes = [IntraMode::Dc; 4];
            self.left_contexts = [0; NUM_CONTEXTS];
        }

        Ok(())
    }

    fn write_modes(&mut self, mb: &MacroblockLevels, skip: bool) {
        let enc = &mut self.modes;
        let top = &mut self.top_modes[self.mb_x];
        let left = &mut self.left_modes;

        if self.header.segments.update_map {
            enc.put_tree(
                &SEGMENT_ID_TREE,
                &self.header.segments.tree_probs,
                mb.segment as i8,
            );
        }

        if let Some(prob) = self.header.skip_prob {
            enc.put_bit(skip, prob);
        }

        enc.put_tree(&KEYFRAME_YMODE_TREE, &KEYFRAME_YMODE_PROBS, mb.luma.leaf());

        if mb.luma == LumaMode::B {
            for y in 0..4 {
                for x in 0..4 {
                    let mode = mb.subblock_modes[x + 4 * y];
                    let probs = &KEYFRAME_BPRED_MODE_PROBS[top[x] as usize][left[y] as usize];
                    enc.put_tree(&KEYFRAME_BPRED_MODE_TREE, probs, mode.leaf());

                    top[x] = mode;
                    left[y] = mode;
                }
            }
        } else {
            let mode = mb.luma.implied_subblock_mode();
            *top = [mode; 4];
            *left = [mode; 4];
        }

        enc.put_tree(&KEYFRAME_UV_MODE_TREE, &KEYFRAME_UV_MODE_PROBS, mb.chroma.leaf());
    }

    /// Assemble the frame. Fails if not all macroblocks were written.
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.mb_y != self.mb_height {
            bail!(ParameterError::PixelCountMismatch);
        }

        let partition0 = self.modes.finish();
        let partitions: Vec<_> = self.partitions.into_iter().map(|p| p.finish()).collect();
        let Some((last, rest)) = partitions.split_last() else {
            bail!(ParameterError::InvalidSetting);
        };

        if partition0.len() > MAX_PARTITION0_SIZE
            || rest.iter().any(|p| p.len() > MAX_PARTITION_SIZE)
        {
            bail!(ParameterError::InvalidSetting);
        }

        let frame = &self.header.frame;
        let tag = ((partition0.len() as u32) << 5) | (1 << 4) | ((frame.profile as u32) << 1);
        let width = frame.width | ((frame.horizontal_scale as u16) << 14);
        let height = frame.height | ((frame.vertical_scale as u16) << 14);

        let size = KEY_FRAME_HEADER_SIZE
            + partition0.len()
            + 3 * rest.len()
            + partitions.iter().map(Vec::len).sum::<usize>();
        let mut out = Vec::new();
        out.try_reserve_exact(size)?;

        out.extend_from_slice(&tag.to_le_bytes()[..FRAME_TAG_SIZE]);
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&partition0);

        for partition in rest {
            out.extend_from_slice(&(partition.len() as u32).to_le_bytes()[..3]);
        }

        for partition in rest {
            out.extend_from_slice(partition);
        }

        out.extend_from_slice(last);

        Ok(out)
    }
}

fn validate(header: &LossyHeader) -> Result<()> {
    let frame = &header.frame;
    let segments = &header.segments;
    let filter = &header.filter;
    let quant = &header.quant;
    let deltas = [
        quant.y1_dc,
        quant.y2_dc,
        quant.y2_ac,
        quant.uv_dc,
        quant.uv_ac,
    ];

    if frame.width == 0
        || frame.height == 0
        || frame.width > MAX_DIMENSION
        || frame.height > MAX_DIMENSION
    {
        bail!(ParameterError::InvalidDimensions);
    }

    let valid = frame.profile <= 3
        && frame.horizontal_scale <= 3
        && frame.vertical_scale <= 3
        && header.color_space <= 1
        && header.clamping_type <= 1
        && matches!(header.num_partitions, 1 | 2 | 4 | 8)
        && quant.base <= 127
        && deltas.iter().all(|d| (-15..=15).contains(d))
        && filter.level <= 63
        && filter.sharpness <= 7
        && segments.quantizer.iter().all(|q| *q >= -127)
        && filter
            .ref_deltas
            .iter()
            .chain(&filter.mode_deltas)
            .chain(&segments.filter_strength)
            .all(|d| (-63..=63).contains(d));

    if !valid {
        bail!(ParameterError::InvalidSetting);
    }

    Ok(())
}

fn write_header(enc: &mut RangeEncoder, header: &LossyHeader, probs: &TokenProbs) {
    enc.put_bits(header.color_space as u32, 1);
    enc.put_bits(header.clamping_type as u32, 1);

    let segments = &header.segments;

    if enc.put_bit_uniform(segments.enabled) {
        enc.put_bit_uniform(segments.update_map);
        // Always send the segment values.
        enc.put_bit_uniform(true);
        enc.put_bit_uniform(segments.absolute_values);

        for q in segments.quantizer {
            enc.put_signed_bits(q as i32, 7);
        }

        for f in segments.filter_strength {
            enc.put_signed_bits(f as i32, 6);
        }

        if segments.update_map {
            for prob in segments.tree_probs {
                if enc.put_bit_uniform(prob != 255) {
                    enc.put_bits(prob as u32, 8);
                }
            }
        }
    }

    let filter = &header.filter;
    enc.put_bit_uniform(filter.simple);
    enc.put_bits(filter.level as u32, 6);
    enc.put_bits(filter.sharpness as u32, 3);

    if enc.put_bit_uniform(filter.use_deltas) {
        enc.put_bit_uniform(true);

        for delta in filter.ref_deltas.iter().chain(&filter.mode_deltas) {
            enc.put_signed_bits(*delta as i32, 6);
        }
    }

    enc.put_bits(header.num_partitions.trailing_zeros(), 2);

    let quant = &header.quant;
    enc.put_bits(quant.base as u32, 7);

    for delta in [
        quant.y1_dc,
        quant.y2_dc,
        quant.y2_ac,
        quant.uv_dc,
        quant.uv_ac,
    ] {
        enc.put_signed_bits(delta as i32, 4);
    }

    // Don't keep the probabilities for later frames.
    enc.put_bit_uniform(false);

    let planes = probs.iter().zip(&COEFF_PROBS).zip(&COEFF_UPDATE_PROBS);

    for ((plane, defaults), updates) in planes {
        for ((band, defaults), updates) in plane.iter().zip(defaults).zip(updates) {
            for ((context, defaults), updates) in band.iter().zip(defaults).zip(updates) {
                for ((prob, default), update) in context.iter().zip(defaults).zip(updates) {
                    if enc.put_bit(prob != default, *update) {
                        enc.put_bits(*prob as u32, 8);
                    }
                }
            }
        }
    }

    if let Some(prob) = header.skip_prob {
        enc.put_bit_uniform(true);
        enc.put_bits(prob as u32, 8);
    } else {
        enc.put_bit_uniform(false);
    }
}

fn write_residuals(
    enc: &mut RangeEncoder,
    probs: &TokenProbs,
    mb: &MacroblockLevels,
    top: &mut [u8; NUM_CONTEXTS],
    left: &mut [u8; NUM_CONTEXTS],
) {
    let (plane, first) = if mb.luma != LumaMode::B {
        let nz = write_coefficients(enc, &probs[1], top[0] + left[0], 0, &mb.y2);
        top[0] = nz as u8;
        left[0] = nz as u8;

        (0, 1)
    } else {
        (3, 0)
    };

    for y in 0..4 {
        for x in 0..4 {
            let context = top[1 + x] + left[1 + y];
            let block = &mb.coeffs[x + 4 * y];
            let nz = write_coefficients(enc, &probs[plane], context, first, block);

            top[1 + x] = nz as u8;
            left[1 + y] = nz as u8;
        }
    }

    for (offset, ctx) in [(16, 5), (20, 7)] {
        for y in 0..2 {
            for x in 0..2 {
                let context = top[ctx + x] + left[ctx + y];
                let block = &mb.coeffs[offset + x + 2 * y];
                let nz = write_coefficients(enc, &probs[2], context, 0, block);

                top[ctx + x] = nz as u8;
                left[ctx + y] = nz as u8;
            }
        }
    }
}

fn token(magnitude: u16) -> i8 {
    match magnitude {
        0..=4 => magnitude as i8,
        _ => {
            let category = DCT_CAT_BASE
                .iter()
                .rposition(|base| magnitude >= *base as u16)
                .unwrap_or(0);

            DCT_CAT1 + category as i8
        }
    }
}

/// Write the tokens of one block. Returns whether anything besides an
/// immediate end of block was written.
fn write_coefficients(
    enc: &mut RangeEncoder,
    probs: &[[[u8; NUM_DCT_TOKENS - 1]; 3]; 8],
    context: u8,
    first: usize,
    levels: &[i16; 16],
) -> bool {
    let level = |i: usize| levels[ZIGZAG[i] as usize];
    let mut context = context as usize;

    let Some(last) = (first..16).rev().find(|i| level(*i) != 0) else {
        enc.put_tree(&DCT_TOKEN_TREE, &probs[COEFF_BANDS[first] as usize][context], DCT_EOB);
        return false;
    };

    let mut after_zero = false;

    for i in first..=last {
        let table = &probs[COEFF_BANDS[i] as usize][context];
        let start = if after_zero { 2 } else { 0 };
        let value = level(i);
        let magnitude = value.unsigned_abs();
        let token = token(magnitude);

        enc.put_tree_from(&DCT_TOKEN_TREE, table, start, token);

        if magnitude == 0 {
            after_zero = true;
            context = 0;
            continue;
        }

        if token >= DCT_CAT1 {
            let category = (token - DCT_CAT1) as usize;
            let extra = magnitude - DCT_CAT_BASE[category] as u16;
            let probs = &PROB_DCT_CAT[category];
            let n = probs.iter().take_while(|p| **p > 0).count();

            for (j, prob) in probs[..n].iter().enumerate() {
                enc.put_bit((extra >> (n - 1 - j)) & 1 != 0, *prob);
            }
        }

        enc.put_bit_uniform(value < 0);

        after_zero = false;
        context = if magnitude == 1 { 1 } else { 2 };
    }

    if last < 15 {
        let table = &probs[COEFF_BANDS[last + 1] as usize][context];
        enc.put_tree(&DCT_TOKEN_TREE, table, DCT_EOB);
    }

    true
}
