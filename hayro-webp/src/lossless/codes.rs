//! Reading the prefix codes of an entropy-coded image (RFC 9649,
//! Section 3.7.2).

use super::{decode_sub_image, subsample_size};
use crate::bit_reader::BitReader;
use crate::error::{BitstreamError, DecodeError, Result, bail};
use crate::huffman::{
    ALPHA, ALPHABET_SIZE, CODE_LENGTH_CODE_ORDER, CODES_PER_GROUP, GREEN, HUFFMAN_TABLE_BITS,
    HuffmanCode, HuffmanTables, HuffmanTreeGroup, NUM_CODE_LENGTH_CODES, TableRef, build_table,
};
use alloc::vec;
use alloc::vec::Vec;

const MIN_HUFFMAN_BITS: u32 = 2;
const NUM_HUFFMAN_BITS: u32 = 3;

/// Root size of the table of the code-length code.
const LENGTHS_TABLE_BITS: u32 = 7;
const LENGTHS_TABLE_MASK: u32 = (1 << LENGTHS_TABLE_BITS) - 1;
const NUM_LENGTH_LITERALS: u8 = 16;
const REPEAT_PREVIOUS_CODE: u8 = 16;
const DEFAULT_CODE_LENGTH: u8 = 8;
const REPEAT_EXTRA_BITS: [u32; 3] = [2, 3, 7];
const REPEAT_OFFSETS: [usize; 3] = [3, 3, 11];

/// Groups above this count are renumbered so only used groups are stored.
const MAX_UNMAPPED_GROUPS: u32 = 1000;

/// Table entries needed by the four 256 symbol alphabets and the distance
/// alphabet of one group.
const FIXED_TABLE_SIZE: usize = 630 * 3 + 410;
/// Table entries needed by one group, indexed by the color cache bits.
const TABLE_SIZE: [usize; 12] = [
    FIXED_TABLE_SIZE + 654,
    FIXED_TABLE_SIZE + 656,
    FIXED_TABLE_SIZE + 658,
    FIXED_TABLE_SIZE + 662,
    FIXED_TABLE_SIZE + 670,
    FIXED_TABLE_SIZE + 686,
    FIXED_TABLE_SIZE + 718,
    FIXED_TABLE_SIZE + 782,
    FIXED_TABLE_SIZE + 910,
    FIXED_TABLE_SIZE + 1166,
    FIXED_TABLE_SIZE + 1678,
    FIXED_TABLE_SIZE + 2702,
];

/// The codes of an image together with the meta image that assigns a group to
/// each tile.
#[derive(Debug, Clone)]
pub(crate) struct HuffmanCodes {
    bits: u32,
    xsize: usize,
    /// Group index of each tile. Empty if there is only one group.
    image: Vec<u32>,
    pub(crate) mask: usize,
    pub(crate) groups: Vec<HuffmanTreeGroup>,
    pub(crate) tables: HuffmanTables,
}

impl HuffmanCodes {
    /// The group that codes the pixel at `(x, y)`.
    #[inline(always)]
    pub(crate) fn group(&self, x: usize, y: usize) -> &HuffmanTreeGroup {
        let index = if self.bits == 0 {
            0
        } else {
            self.image[(y >> self.bits) * self.xsize + (x >> self.bits)] as usize
        };

        &self.groups[index]
    }
}

pub(crate) fn read_color_cache_bits(reader: &mut BitReader<'_>) -> Result<u32> {
    if !reader.read_bit() {
        return Ok(0);
    }

    let bits = reader.read_bits(4);

    if reader.eos() {
        bail!(BitstreamError::UnexpectedEof);
    }

    if !(1..=crate::color_cache::MAX_CACHE_BITS).contains(&bits) {
        bail!(BitstreamError::InvalidColorCacheBits);
    }

    Ok(bits)
}

/// Read the meta image, if allowed and present, and the codes of every
/// group.
pub(crate) fn read_huffman_codes(
    reader: &mut BitReader<'_>,
    xsize: usize,
    ysize: usize,
    cache_bits: u32,
    allow_recursion: bool,
) -> Result<HuffmanCodes> {
    let mut bits = 0;
    let mut huffman_xsize = 0;
    let mut image = Vec::new();
    let mut num_groups_max = 1;

    if allow_recursion && reader.read_bit() {
        bits = MIN_HUFFMAN_BITS + reader.read_bits(NUM_HUFFMAN_BITS);
        huffman_xsize = subsample_size(xsize, bits);
        let huffman_ysize = subsample_size(ysize, bits);

        image = decode_sub_image(reader, huffman_xsize, huffman_ysize)?;

        for pixel in &mut image {
            let group = (*pixel >> 8) & 0xffff;
            *pixel = group;
            num_groups_max = num_groups_max.max(group + 1);
        }
    }

    if reader.eos() {
        bail!(BitstreamError::UnexpectedEof);
    }

    // Most indices are unused if there are many more groups than tiles, so
    // only store the codes of the used ones, numbered by first appearance.
    let mapping = if num_groups_max > MAX_UNMAPPED_GROUPS || num_groups_max as usize > xsize * ysize
    {
        let mut mapping = Vec::new();
        mapping.try_reserve_exact(num_groups_max as usize)?;
        mapping.resize(num_groups_max as usize, u32::MAX);
        let mut count = 0;

        for pixel in &mut image {
            let mapped = &mut mapping[*pixel as usize];

            if *mapped == u32::MAX {
                *mapped = count;
                count += 1;
            }

            *pixel = *mapped;
        }

        ldebug!(
            "{} of {} prefix code groups are used",
            count,
            num_groups_max
        );

        Some((mapping, count))
    } else {
        None
    };

    let num_groups = mapping.as_ref().map_or(num_groups_max, |(_, count)| *count) as usize;
    let cache_size = if cache_bits > 0 { 1 << cache_bits } else { 0 };
    let budget = num_groups
        .checked_mul(TABLE_SIZE[cache_bits as usize])
        .ok_or(DecodeError::OutOfMemory)?;

    let mut tables = HuffmanTables::new(budget)?;
    let mut groups = Vec::new();
    groups.try_reserve_exact(num_groups)?;
    groups.resize_with(num_groups, || None);

    let mut code_lengths = vec![0_u8; ALPHABET_SIZE[GREEN] + cache_size];

    for index in 0..num_groups_max as usize {
        let target = match &mapping {
            Some((mapping, _)) => (mapping[index] != u32::MAX).then_some(mapping[index] as usize),
            None => Some(index),
        };

        let mut trees = [TableRef::default(); CODES_PER_GROUP];
        let mut literal_max_bits = 0;

        for (j, tree) in trees.iter_mut().enumerate() {
            let alphabet_size = ALPHABET_SIZE[j] + if j == GREEN { cache_size } else { 0 };
            let lengths = &mut code_lengths[..alphabet_size];

            read_code_lengths(reader, lengths)?;

            if target.is_none() {
                // Codes of unused groups must still be valid.
                if build_table(None, HUFFMAN_TABLE_BITS, lengths) == 0 {
                    bail!(BitstreamError::InvalidHuffmanCode);
                }

                continue;
            }

            *tree = tables.build(HUFFMAN_TABLE_BITS, lengths)?;

            if j <= ALPHA {
                literal_max_bits += lengths.iter().copied().max().unwrap_or(0) as u32;
            }
        }

        if let Some(target) = target {
            groups[target] = Some(HuffmanTreeGroup::new(trees, &tables, literal_max_bits));
        }
    }

    let groups = groups
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(BitstreamError::InvalidHuffmanCode)?;

    ltrace!(
        "read {} prefix code groups in {} table segments",
        groups.len(),
        tables.num_segments()
    );

    Ok(HuffmanCodes {
        bits,
        xsize: huffman_xsize,
        image,
        mask: if bits == 0 {
            usize::MAX
        } else {
            (1 << bits) - 1
        },
        groups,
        tables,
    })
}

/// Read the code lengths of one prefix code into `code_lengths`, which spans
/// exactly the alphabet.
fn read_code_lengths(reader: &mut BitReader<'_>, code_lengths: &mut [u8]) -> Result<()> {
    code_lengths.fill(0);

    let simple_code = reader.read_bit();

    if simple_code {
        let num_symbols = reader.read_bits(1) + 1;
        let first_symbol_bits = if reader.read_bit() { 8 } else { 1 };
        let first = reader.read_bits(first_symbol_bits) as usize;
        set_simple_symbol(code_lengths, first);

        if num_symbols == 2 {
            let second = reader.read_bits(8) as usize;
            set_simple_symbol(code_lengths, second);
        }
    } else {
        let mut code_length_code_lengths = [0_u8; NUM_CODE_LENGTH_CODES];
        let num_codes = reader.read_bits(4) as usize + 4;

        for &symbol in &CODE_LENGTH_CODE_ORDER[..num_codes] {
            code_length_code_lengths[symbol] = reader.read_bits(3) as u8;
        }

        read_coded_lengths(reader, &code_length_code_lengths, code_lengths)?;
    }

    if reader.eos() {
        bail!(BitstreamError::UnexpectedEof);
    }

    Ok(())
}

fn set_simple_symbol(code_lengths: &mut [u8], symbol: usize) {
    match code_lengths.get_mut(symbol) {
        Some(length) => *length = 1,
        None => lwarn!("ignoring simple code symbol {} out of range", symbol),
    }
}

fn read_coded_lengths(
    reader: &mut BitReader<'_>,
    code_length_code_lengths: &[u8; NUM_CODE_LENGTH_CODES],
    code_lengths: &mut [u8],
) -> Result<()> {
    let mut table = [HuffmanCode::default(); 1 << LENGTHS_TABLE_BITS];

    if build_table(
        Some(&mut table[..]),
        LENGTHS_TABLE_BITS,
        code_length_code_lengths,
    ) == 0
    {
        if reader.eos() {
            bail!(BitstreamError::UnexpectedEof);
        }

        bail!(BitstreamError::InvalidHuffmanCode);
    }

    let num_symbols = code_lengths.len();
    let mut max_symbol = if reader.read_bit() {
        let length_bits = 2 + 2 * reader.read_bits(3);
        let max_symbol = 2 + reader.read_bits(length_bits) as usize;

        if max_symbol > num_symbols {
            if reader.eos() {
                bail!(BitstreamError::UnexpectedEof);
            }

            bail!(BitstreamError::InvalidHuffmanCode);
        }

        max_symbol
    } else {
        num_symbols
    };

    let mut prev_code_length = DEFAULT_CODE_LENGTH;
    let mut symbol = 0;

    while symbol < num_symbols {
        if max_symbol == 0 {
            break;
        }

        max_symbol -= 1;

        reader.fill_bit_window();
        let entry = table[(reader.prefetch_bits() & LENGTHS_TABLE_MASK) as usize];
        reader.skip_bits(entry.bits as u32);
        let code_length = entry.value as u8;

        if code_length < NUM_LENGTH_LITERALS {
            code_lengths[symbol] = code_length;
            symbol += 1;

            if code_length != 0 {
                prev_code_length = code_length;
            }
        } else {
            let slot = (code_length - NUM_LENGTH_LITERALS) as usize;
            let repeat = reader.read_bits(REPEAT_EXTRA_BITS[slot]) as usize + REPEAT_OFFSETS[slot];

            if symbol + repeat > num_symbols {
                if reader.is_end_of_stream() {
                    bail!(BitstreamError::UnexpectedEof);
                }

                bail!(BitstreamError::CodeLengthOverflow);
            }

            let length = if code_length == REPEAT_PREVIOUS_CODE {
                prev_code_length
            } else {
                0
            };

            code_lengths[symbol..symbol + repeat].fill(length);
            symbol += repeat;
        }

        if reader.is_end_of_stream() {
            bail!(BitstreamError::UnexpectedEof);
        }
    }

    Ok(())
}
