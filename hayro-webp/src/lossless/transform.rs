//! The image transforms of lossless images (RFC 9649, Section 4).
//!
//! An encoder applies up to four distinct transforms in sequence, each
//! replacing the pixels with something cheaper to entropy code. The decoder
//! undoes them in reverse order, one batch of rows at a time.

use super::{decode_sub_image, subsample_size};
use crate::bit_reader::BitReader;
use crate::error::{BitstreamError, Result, bail};
use alloc::vec;
use alloc::vec::Vec;
use smallvec::SmallVec;

pub(crate) const ARGB_BLACK: u32 = 0xff00_0000;
/// Smallest tile size, as log2, of the predictor and cross-color images.
const MIN_TRANSFORM_BITS: u32 = 2;
const NUM_TRANSFORM_BITS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransformType {
    Predictor = 0,
    CrossColor = 1,
    SubtractGreen = 2,
    ColorIndexing = 3,
}

#[derive(Debug, Clone)]
pub(crate) enum Transform {
    /// Per-tile prediction modes, stored in the green channel.
    Predictor {
        bits: u32,
        xsize: usize,
        modes: Vec<u32>,
    },
    /// Per-tile color transform multipliers.
    CrossColor {
        bits: u32,
        xsize: usize,
        multipliers: Vec<u32>,
    },
    SubtractGreen,
    /// A palette, expanded to the number of entries the index width allows.
    ColorIndexing {
        bits: u32,
        xsize: usize,
        palette: Vec<u32>,
    },
}

impl Transform {
    /// Read a transform of an image that is `xsize` pixels wide at this
    /// point. A color indexing transform narrows `xsize` for everything that
    /// follows it.
    pub(crate) fn read(
        reader: &mut BitReader<'_>,
        xsize: &mut usize,
        ysize: usize,
        seen: &mut u8,
    ) -> Result<Self> {
        let kind = reader.read_bits(2);

        if reader.eos() {
            bail!(BitstreamError::UnexpectedEof);
        }

        if *seen & (1 << kind) != 0 {
            bail!(BitstreamError::RepeatedTransform);
        }

        *seen |= 1 << kind;

        let transform = match kind {
            0 | 1 => {
                let bits = MIN_TRANSFORM_BITS + reader.read_bits(NUM_TRANSFORM_BITS);
                let data = decode_sub_image(
                    reader,
                    subsample_size(*xsize, bits),
                    subsample_size(ysize, bits),
                )?;

                if kind == 0 {
                    Self::Predictor {
                        bits,
                        xsize: *xsize,
                        modes: data,
                    }
                } else {
                    Self::CrossColor {
                        bits,
                        xsize: *xsize,
                        multipliers: data,
                    }
                }
            }
            2 => Self::SubtractGreen,
            _ => {
                let num_colors = reader.read_bits(8) as usize + 1;
                let bits = palette_bits(num_colors);
                let data = decode_sub_image(reader, num_colors, 1)?;
                let transform = Self::ColorIndexing {
                    bits,
                    xsize: *xsize,
                    palette: expand_color_map(&data, bits),
                };

                *xsize = subsample_size(*xsize, bits);

                transform
            }
        };

        ldebug!("read transform {:?}", transform.kind());

        Ok(transform)
    }

    pub(crate) fn kind(&self) -> TransformType {
        match self {
            Self::Predictor { .. } => TransformType::Predictor,
            Self::CrossColor { .. } => TransformType::CrossColor,
            Self::SubtractGreen => TransformType::SubtractGreen,
            Self::ColorIndexing { .. } => TransformType::ColorIndexing,
        }
    }

    /// The width of the pixels this transform produces, if it changes it.
    fn output_width(&self) -> Option<usize> {
        match self {
            Self::Predictor { xsize, .. }
            | Self::CrossColor { xsize, .. }
            | Self::ColorIndexing { xsize, .. } => Some(*xsize),
            Self::SubtractGreen => None,
        }
    }

    /// Undo the transform for the rows starting at `start_row`.
    ///
    /// `upper` holds the last row this transform produced for the previous
    /// batch and is updated for the next one.
    fn inverse(&self, start_row: usize, input: &[u32], output: &mut [u32], upper: &mut Vec<u32>) {
        match self {
            Self::Predictor { bits, xsize, modes } => {
                predictor_inverse(*bits, *xsize, modes, start_row, input, output, upper)
            }
            Self::CrossColor {
                bits,
                xsize,
                multipliers,
            } => {
                let bits = *bits;
                let tiles_per_row = subsample_size(*xsize, bits);

                for (r, (in_row, out_row)) in input
                    .chunks_exact(*xsize)
                    .zip(output.chunks_exact_mut(*xsize))
                    .enumerate()
                {
                    let y = start_row + r;
                    let row_codes = &multipliers[(y >> bits) * tiles_per_row..];

                    for (x, (src, dst)) in in_row.iter().zip(out_row.iter_mut()).enumerate() {
                        let m = Multipliers::from_code(row_codes[x >> bits]);
                        *dst = m.inverse(*src);
                    }
                }
            }
            Self::SubtractGreen => {
                for (src, dst) in input.iter().zip(output.iter_mut()) {
                    *dst = add_green_to_blue_and_red(*src);
                }
            }
            Self::ColorIndexing {
                bits,
                xsize,
                palette,
            } => {
                let bits = *bits;
                let in_width = subsample_size(*xsize, bits);
                let bits_per_pixel: u32 = 8 >> bits;
                let count_mask: usize = (1 << bits) - 1;
                let bit_mask: u32 = (1 << bits_per_pixel) - 1;

                for (in_row, out_row) in input
                    .chunks_exact(in_width)
                    .zip(output.chunks_exact_mut(*xsize))
                {
                    if bits == 0 {
                        for (src, dst) in in_row.iter().zip(out_row.iter_mut()) {
                            *dst = palette[((src >> 8) & 0xff) as usize];
                        }
                    } else {
                        let mut packed = 0;

                        for (x, dst) in out_row.iter_mut().enumerate() {
                            if x & count_mask == 0 {
                                packed = (in_row[x >> bits] >> 8) & 0xff;
                            }

                            *dst = palette[(packed & bit_mask) as usize];
                            packed >>= bits_per_pixel;
                        }
                    }
                }
            }
        }
    }
}

fn expand_color_map(data: &[u32], bits: u32) -> Vec<u32> {
    let final_num_colors = 1 << (8 >> bits);
    let mut palette = vec![0; final_num_colors];
    let mut prev = 0;

    for (color, delta) in palette.iter_mut().zip(data) {
        *color = add_pixels(*delta, prev);
        prev = *color;
    }

    palette
}

/// Undoes a list of transforms batch by batch.
#[derive(Debug, Clone, Default)]
pub(crate) struct InverseTransforms {
    transforms: SmallVec<[Transform; 4]>,
    upper_rows: SmallVec<[Vec<u32>; 4]>,
    scratch: [Vec<u32>; 2],
}

impl InverseTransforms {
    pub(crate) fn new(transforms: SmallVec<[Transform; 4]>) -> Self {
        let upper_rows = transforms.iter().map(|_| Vec::new()).collect();

        Self {
            transforms,
            upper_rows,
            scratch: Default::default(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Turn `num_rows` coded rows starting at `start_row` into final pixels
    /// in `output`.
    pub(crate) fn apply(
        &mut self,
        start_row: usize,
        num_rows: usize,
        rows: &[u32],
        output: &mut [u32],
    ) {
        if self.transforms.is_empty() || num_rows == 0 {
            output.copy_from_slice(rows);
            return;
        }

        let [front, back] = &mut self.scratch;
        front.clear();
        front.extend_from_slice(rows);

        let mut width = rows.len() / num_rows;

        for (transform, upper) in self
            .transforms
            .iter()
            .zip(self.upper_rows.iter_mut())
            .rev()
        {
            width = transform.output_width().unwrap_or(width);
            back.clear();
            back.resize(width * num_rows, 0);

            transform.inverse(start_row, front, back, upper);
            core::mem::swap(front, back);
        }

        output.copy_from_slice(front);
    }
}

#[inline(always)]
pub(crate) fn add_pixels(a: u32, b: u32) -> u32 {
    let alpha_and_green = (a & 0xff00_ff00).wrapping_add(b & 0xff00_ff00);
    let red_and_blue = (a & 0x00ff_00ff).wrapping_add(b & 0x00ff_00ff);

    (alpha_and_green & 0xff00_ff00) | (red_and_blue & 0x00ff_00ff)
}

#[inline(always)]
pub(crate) fn sub_pixels(a: u32, b: u32) -> u32 {
    let alpha_and_green = 0x00ff_00ff_u32
        .wrapping_add(a & 0xff00_ff00)
        .wrapping_sub(b & 0xff00_ff00);
    let red_and_blue = 0xff00_ff00_u32
        .wrapping_add(a & 0x00ff_00ff)
        .wrapping_sub(b & 0x00ff_00ff);

    (alpha_and_green & 0xff00_ff00) | (red_and_blue & 0x00ff_00ff)
}

#[inline(always)]
fn average2(a: u32, b: u32) -> u32 {
    (((a ^ b) & 0xfefe_fefe) >> 1) + (a & b)
}

#[inline(always)]
fn channel(argb: u32, shift: u32) -> i32 {
    ((argb >> shift) & 0xff) as i32
}

#[inline(always)]
fn clip255(v: i32) -> u32 {
    v.clamp(0, 255) as u32
}

fn select(top: u32, left: u32, top_left: u32) -> u32 {
    let pa_minus_pb: i32 = [24, 16, 8, 0]
        .iter()
        .map(|&s| {
            let pb = (channel(left, s) - channel(top_left, s)).abs();
            let pa = (channel(top, s) - channel(top_left, s)).abs();
            pb - pa
        })
        .sum();

    if pa_minus_pb <= 0 { top } else { left }
}

fn clamped_add_subtract_full(c0: u32, c1: u32, c2: u32) -> u32 {
    [24, 16, 8, 0].iter().fold(0, |acc, &s| {
        acc | (clip255(channel(c0, s) + channel(c1, s) - channel(c2, s)) << s)
    })
}

fn clamped_add_subtract_half(c0: u32, c1: u32, c2: u32) -> u32 {
    let ave = average2(c0, c1);

    [24, 16, 8, 0].iter().fold(0, |acc, &s| {
        let a = channel(ave, s);
        let b = channel(c2, s);
        acc | (clip255(a + (a - b) / 2) << s)
    })
}

/// Predict the pixel at `x > 0` of a row below the first one. `top` is the
/// row above; the top-right neighbor of the last pixel is `row_start`, the
/// first pixel of the current row.
#[inline(always)]
fn predict(mode: u32, left: u32, top: &[u32], x: usize, row_start: u32) -> u32 {
    let t = top[x];
    let tl = top[x - 1];
    let tr = top.get(x + 1).copied().unwrap_or(row_start);

    match mode {
        1 => left,
        2 => t,
        3 => tr,
        4 => tl,
        5 => average2(average2(left, tr), t),
        6 => average2(left, tl),
        7 => average2(left, t),
        8 => average2(tl, t),
        9 => average2(t, tr),
        10 => average2(average2(left, tl), average2(t, tr)),
        11 => select(t, left, tl),
        12 => clamped_add_subtract_full(left, t, tl),
        13 => clamped_add_subtract_half(left, t, tl),
        _ => ARGB_BLACK,
    }
}

fn predictor_inverse(
    bits: u32,
    xsize: usize,
    modes: &[u32],
    start_row: usize,
    input: &[u32],
    output: &mut [u32],
    upper: &mut Vec<u32>,
) {
    let tiles_per_row = subsample_size(xsize, bits);
    let num_rows = input.len() / xsize;

    for r in 0..num_rows {
        let y = start_row + r;
        let (done, rest) = output.split_at_mut(r * xsize);
        let out = &mut rest[..xsize];
        let inp = &input[r * xsize..(r + 1) * xsize];

        if y == 0 {
            out[0] = add_pixels(inp[0], ARGB_BLACK);

            for x in 1..xsize {
                out[x] = add_pixels(inp[x], out[x - 1]);
            }

            continue;
        }

        let top: &[u32] = if r == 0 {
            &upper[..]
        } else {
            &done[(r - 1) * xsize..]
        };

        out[0] = add_pixels(inp[0], top[0]);
        let row_modes = &modes[(y >> bits) * tiles_per_row..];

        for x in 1..xsize {
            let mode = (row_modes[x >> bits] >> 8) & 0xf;
            let pred = predict(mode, out[x - 1], top, x, out[0]);
            out[x] = add_pixels(inp[x], pred);
        }
    }

    if num_rows > 0 {
        upper.clear();
        upper.extend_from_slice(&output[(num_rows - 1) * xsize..num_rows * xsize]);
    }
}

#[inline(always)]
fn add_green_to_blue_and_red(argb: u32) -> u32 {
    let green = (argb >> 8) & 0xff;
    let red_blue = ((argb & 0x00ff_00ff) + ((green << 16) | green)) & 0x00ff_00ff;

    (argb & 0xff00_ff00) | red_blue
}

#[inline(always)]
fn color_transform_delta(pred: i8, color: i8) -> i32 {
    (pred as i32 * color as i32) >> 5
}

/// The coefficients of the cross-color transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Multipliers {
    pub green_to_red: u8,
    pub green_to_blue: u8,
    pub red_to_blue: u8,
}

impl Multipliers {
    fn from_code(code: u32) -> Self {
        Self {
            green_to_red: code as u8,
            green_to_blue: (code >> 8) as u8,
            red_to_blue: (code >> 16) as u8,
        }
    }

    pub(crate) fn to_code(self) -> u32 {
        ARGB_BLACK
            | ((self.red_to_blue as u32) << 16)
            | ((self.green_to_blue as u32) << 8)
            | self.green_to_red as u32
    }

    fn inverse(self, argb: u32) -> u32 {
        let green = (argb >> 8) as i8;
        let red = (argb >> 16) as i32 & 0xff;
        let mut new_red = red;
        let mut new_blue = argb as i32 & 0xff;

        new_red += color_transform_delta(self.green_to_red as i8, green);
        new_red &= 0xff;
        new_blue += color_transform_delta(self.green_to_blue as i8, green);
        new_blue += color_transform_delta(self.red_to_blue as i8, new_red as i8);
        new_blue &= 0xff;

        (argb & 0xff00_ff00) | ((new_red as u32) << 16) | new_blue as u32
    }

    fn forward(self, argb: u32) -> u32 {
        let green = (argb >> 8) as i8;
        let red = (argb >> 16) as i8;
        let mut new_red = (argb >> 16) as i32 & 0xff;
        let mut new_blue = argb as i32 & 0xff;

        new_red -= color_transform_delta(self.green_to_red as i8, green);
        new_red &= 0xff;
        new_blue -= color_transform_delta(self.green_to_blue as i8, green);
        new_blue -= color_transform_delta(self.red_to_blue as i8, red);
        new_blue &= 0xff;

        (argb & 0xff00_ff00) | ((new_red as u32) << 16) | new_blue as u32
    }
}

pub(crate) fn subtract_green(argb: &mut [u32]) {
    for pixel in argb {
        let green = (*pixel >> 8) & 0xff;
        let red_blue =
            ((*pixel & 0x00ff_00ff) | 0xff00_ff00).wrapping_sub((green << 16) | green);
        *pixel = (*pixel & 0xff00_ff00) | (red_blue & 0x00ff_00ff);
    }
}

/// Replace every pixel by its residual against a prediction with a single
/// `mode` everywhere. Returns the mode image.
pub(crate) fn predictor_forward(
    argb: &mut [u32],
    xsize: usize,
    ysize: usize,
    bits: u32,
    mode: u8,
) -> Vec<u32> {
    let tiles = subsample_size(xsize, bits) * subsample_size(ysize, bits);
    let original = argb.to_vec();

    for (y, row) in argb.chunks_exact_mut(xsize).enumerate() {
        let current = &original[y * xsize..(y + 1) * xsize];

        for x in 0..xsize {
            let pred = match (x, y) {
                (0, 0) => ARGB_BLACK,
                (_, 0) => current[x - 1],
                (0, _) => original[(y - 1) * xsize],
                _ => predict(
                    mode as u32,
                    current[x - 1],
                    &original[(y - 1) * xsize..y * xsize],
                    x,
                    current[0],
                ),
            };

            row[x] = sub_pixels(current[x], pred);
        }
    }

    vec![ARGB_BLACK | ((mode as u32) << 8); tiles]
}

/// Apply the cross-color transform with the same multipliers everywhere.
/// Returns the multiplier image.
pub(crate) fn cross_color_forward(
    argb: &mut [u32],
    xsize: usize,
    ysize: usize,
    bits: u32,
    multipliers: Multipliers,
) -> Vec<u32> {
    for pixel in argb.iter_mut() {
        *pixel = multipliers.forward(*pixel);
    }

    let tiles = subsample_size(xsize, bits) * subsample_size(ysize, bits);

    vec![multipliers.to_code(); tiles]
}

/// Pack palette indices, several per pixel for small palettes.
pub(crate) fn bundle_color_map(indices: &[u8], xsize: usize, bits: u32) -> Vec<u32> {
    let packed_width = subsample_size(xsize, bits);
    let bit_depth = 8 >> bits;
    let mask = (1 << bits) - 1;
    let mut out = Vec::with_capacity(packed_width * (indices.len() / xsize.max(1)));

    for row in indices.chunks_exact(xsize) {
        let mut code = ARGB_BLACK;

        for (x, index) in row.iter().enumerate() {
            let sub = x & mask;

            if sub == 0 {
                if x > 0 {
                    out.push(code);
                }

                code = ARGB_BLACK;
            }

            code |= (*index as u32) << (8 + bit_depth * sub);
        }

        out.push(code);
    }

    out
}

/// Palette index width, as log2 of the indices per pixel, for a palette of
/// `num_colors` entries.
pub(crate) fn palette_bits(num_colors: usize) -> u32 {
    match num_colors {
        17.. => 0,
        5.. => 1,
        3.. => 2,
        _ => 3,
    }
}
