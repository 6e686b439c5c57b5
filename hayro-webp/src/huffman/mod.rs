//! Canonical prefix codes of lossless images (RFC 9649, Section 3.7.2).
//!
//! Codes are decoded through two-level lookup tables: a root table indexed
//! by the next [`HUFFMAN_TABLE_BITS`] bits of the stream, whose entries either
//! hold a symbol directly or point to a second-level table for longer codes.
//! Codes are assigned canonically, so a code is fully described by the code
//! length of each symbol.

pub(crate) mod encode;

use crate::bit_reader::BitReader;
use crate::error::{BitstreamError, Result, bail};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use smallvec::{SmallVec, smallvec};

/// Number of bits used to index root tables.
pub(crate) const HUFFMAN_TABLE_BITS: u32 = 8;
const HUFFMAN_TABLE_MASK: u32 = (1 << HUFFMAN_TABLE_BITS) - 1;
/// The longest code length allowed in a lossless image.
pub(crate) const MAX_CODE_LENGTH: usize = 15;

/// Size of the alphabet used to encode code lengths: 16 literal lengths and
/// three repeat codes.
pub(crate) const NUM_CODE_LENGTH_CODES: usize = 19;
/// The order in which the code lengths of that alphabet are stored.
pub(crate) const CODE_LENGTH_CODE_ORDER: [usize; NUM_CODE_LENGTH_CODES] = [
    17, 18, 0, 1, 2, 3, 4, 5, 16, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
];

/// Packed tables are used if all literal codes together fit into this many
/// bits.
const HUFFMAN_PACKED_BITS: u32 = 6;
const HUFFMAN_PACKED_TABLE_SIZE: usize = 1 << HUFFMAN_PACKED_BITS;
/// Marks packed entries whose green symbol is not a literal.
const BITS_SPECIAL_MARKER: u32 = 0x100;

pub(crate) const NUM_LITERAL_CODES: u16 = 256;
pub(crate) const NUM_LENGTH_CODES: u16 = 24;
pub(crate) const NUM_DISTANCE_CODES: u16 = 40;

pub(crate) const GREEN: usize = 0;
pub(crate) const RED: usize = 1;
pub(crate) const BLUE: usize = 2;
pub(crate) const ALPHA: usize = 3;
pub(crate) const DIST: usize = 4;
pub(crate) const CODES_PER_GROUP: usize = 5;

/// Alphabet sizes of the five codes in a group, not counting the color cache
/// symbols of the green alphabet.
pub(crate) const ALPHABET_SIZE: [usize; CODES_PER_GROUP] = [
    (NUM_LITERAL_CODES + NUM_LENGTH_CODES) as usize,
    NUM_LITERAL_CODES as usize,
    NUM_LITERAL_CODES as usize,
    NUM_LITERAL_CODES as usize,
    NUM_DISTANCE_CODES as usize,
];

/// One lookup table entry.
///
/// In a root table, `bits` above [`HUFFMAN_TABLE_BITS`] marks a link: the
/// second-level table starts `value` entries after the linking entry and is
/// indexed by `bits - HUFFMAN_TABLE_BITS` further bits. Otherwise `bits` is
/// the code length and `value` the symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HuffmanCode {
    pub(crate) bits: u8,
    pub(crate) value: u16,
}

/// Return the key following `key`, where keys are bit-reversed codes of
/// length `len`.
#[inline]
fn next_key(key: u32, len: usize) -> u32 {
    let mut step = 1 << (len - 1);

    while key & step != 0 {
        step >>= 1;
    }

    if step != 0 {
        (key & (step - 1)) + step
    } else {
        key
    }
}

/// Store `code` in `table[0]`, `table[step]`, ... up to `end`.
#[inline]
fn replicate(table: &mut [HuffmanCode], step: usize, end: usize, code: HuffmanCode) {
    for entry in table[..end].iter_mut().step_by(step) {
        *entry = code;
    }
}

/// Width of the next second-level table, given the remaining number of codes
/// of each length.
fn next_table_bits(count: &[u32; MAX_CODE_LENGTH + 1], mut len: usize, root_bits: u32) -> u32 {
    let mut left = 1_i32 << (len - root_bits as usize);

    while len < MAX_CODE_LENGTH {
        left -= count[len] as i32;

        if left <= 0 {
            break;
        }

        len += 1;
        left <<= 1;
    }

    (len - root_bits as usize) as u32
}

/// Build the lookup table of the code described by `code_lengths`.
///
/// Returns the total number of entries needed, or 0 if the code lengths
/// don't describe a complete prefix code. Without a table, only the size is
/// computed. A code with a single symbol is valid and takes zero bits.
pub(crate) fn build_table(
    mut table: Option<&mut [HuffmanCode]>,
    root_bits: u32,
    code_lengths: &[u8],
) -> usize {
    let mut count = [0_u32; MAX_CODE_LENGTH + 1];
    let mut offset = [0_usize; MAX_CODE_LENGTH + 1];

    for &len in code_lengths {
        if len as usize > MAX_CODE_LENGTH {
            return 0;
        }

        count[len as usize] += 1;
    }

    let num_coded = code_lengths.len() - count[0] as usize;

    if num_coded == 0 {
        return 0;
    }

    for len in 1..MAX_CODE_LENGTH {
        if count[len] > 1 << len {
            return 0;
        }

        offset[len + 1] = offset[len] + count[len] as usize;
    }

    // Symbols sorted by code length, then by value.
    let mut sorted: SmallVec<[u16; 512]> = smallvec![0; num_coded];

    for (symbol, &len) in code_lengths.iter().enumerate() {
        if len > 0 {
            sorted[offset[len as usize]] = symbol as u16;
            offset[len as usize] += 1;
        }
    }

    let mut total_size = 1_usize << root_bits;

    if num_coded == 1 {
        if let Some(table) = table {
            let code = HuffmanCode {
                bits: 0,
                value: sorted[0],
            };
            replicate(table, 1, total_size, code);
        }

        return total_size;
    }

    let mask = total_size - 1;
    let mut low = usize::MAX;
    let mut key = 0_u32;
    let mut num_nodes = 1_i32;
    let mut num_open = 1_i32;
    let mut table_size = total_size;
    let mut table_start = 0;
    let mut symbol = 0;

    // The root table.
    let mut step = 2;

    for len in 1..=root_bits as usize {
        num_open <<= 1;
        num_nodes += num_open;
        num_open -= count[len] as i32;

        if num_open < 0 {
            return 0;
        }

        for _ in 0..count[len] {
            if let Some(table) = table.as_deref_mut() {
                let code = HuffmanCode {
                    bits: len as u8,
                    value: sorted[symbol],
                };
                replicate(&mut table[key as usize..], step, table_size, code);
            }

            symbol += 1;
            key = next_key(key, len);
        }

        step <<= 1;
    }

    // Second-level tables, linked from the root table.
    let mut step = 2;

    for len in root_bits as usize + 1..=MAX_CODE_LENGTH {
        num_open <<= 1;
        num_nodes += num_open;
        num_open -= count[len] as i32;

        if num_open < 0 {
            return 0;
        }

        while count[len] > 0 {
            if key as usize & mask != low {
                table_start += table_size;
                let table_bits = next_table_bits(&count, len, root_bits);
                table_size = 1 << table_bits;
                total_size += table_size;
                low = key as usize & mask;

                if let Some(table) = table.as_deref_mut() {
                    table[low] = HuffmanCode {
                        bits: (table_bits + root_bits) as u8,
                        value: (table_start - low) as u16,
                    };
                }
            }

            if let Some(table) = table.as_deref_mut() {
                let code = HuffmanCode {
                    bits: (len - root_bits as usize) as u8,
                    value: sorted[symbol],
                };
                let start = table_start + (key >> root_bits) as usize;
                replicate(&mut table[start..], step, table_size, code);
            }

            symbol += 1;
            key = next_key(key, len);
            count[len] -= 1;
        }

        step <<= 1;
    }

    if num_nodes != 2 * num_coded as i32 - 1 {
        return 0;
    }

    total_size
}

/// A reference to a table stored in [`HuffmanTables`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TableRef {
    segment: u32,
    offset: u32,
}

/// Append-only storage for lookup tables.
///
/// Storage is organized in segments that are allocated once and never grow,
/// so building a table never moves previously built ones. A new segment is
/// started whenever the current one can't hold the next table.
#[derive(Debug, Clone)]
pub(crate) struct HuffmanTables {
    segments: Vec<Vec<HuffmanCode>>,
    segment_size: usize,
}

impl HuffmanTables {
    pub(crate) fn new(segment_size: usize) -> Result<Self> {
        let mut first = Vec::new();
        first.try_reserve_exact(segment_size)?;

        Ok(Self {
            segments: vec![first],
            segment_size,
        })
    }

    /// Build the table for `code_lengths` and store it.
    pub(crate) fn build(&mut self, root_bits: u32, code_lengths: &[u8]) -> Result<TableRef> {
        let size = build_table(None, root_bits, code_lengths);

        if size == 0 {
            bail!(BitstreamError::InvalidHuffmanCode);
        }

        let needs_segment = self
            .segments
            .last()
            .is_none_or(|segment| segment.len() + size > segment.capacity());

        if needs_segment {
            let mut segment = Vec::new();
            segment.try_reserve_exact(size.max(self.segment_size))?;
            self.segments.push(segment);
        }

        let index = self.segments.len() - 1;
        let segment = &mut self.segments[index];
        let offset = segment.len();
        segment.resize(offset + size, HuffmanCode::default());
        build_table(Some(&mut segment[offset..]), root_bits, code_lengths);

        Ok(TableRef {
            segment: index as u32,
            offset: offset as u32,
        })
    }

    #[inline(always)]
    pub(crate) fn get(&self, table: TableRef) -> &[HuffmanCode] {
        &self.segments[table.segment as usize][table.offset as usize..]
    }

    pub(crate) fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

/// Decode the next symbol using a table built with a root size of
/// [`HUFFMAN_TABLE_BITS`].
///
/// The bit window must have been refilled since at most 32 bits were
/// consumed.
#[inline(always)]
pub(crate) fn read_symbol(table: &[HuffmanCode], reader: &mut BitReader<'_>) -> u16 {
    let val = reader.prefetch_bits();
    let mut index = (val & HUFFMAN_TABLE_MASK) as usize;
    let n_bits = table[index].bits as i32 - HUFFMAN_TABLE_BITS as i32;

    if n_bits > 0 {
        reader.skip_bits(HUFFMAN_TABLE_BITS);
        let val = reader.prefetch_bits();
        index += table[index].value as usize;
        index += (val & ((1 << n_bits) - 1)) as usize;
    }

    reader.skip_bits(table[index].bits as u32);

    table[index].value
}

/// An entry of the packed literal table: either a full pixel with the total
/// length of its four codes, or a non-literal green symbol.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PackedCode {
    bits: u32,
    value: u32,
}

/// The result of a lookup in the packed literal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Packed {
    Pixel(u32),
    Symbol(u16),
}

/// The five codes used for one region of the image.
#[derive(Debug, Clone)]
pub(crate) struct HuffmanTreeGroup {
    pub(crate) trees: [TableRef; CODES_PER_GROUP],
    /// Whether red, blue and alpha each only have a single symbol.
    pub(crate) is_trivial_literal: bool,
    /// The constant part of literals if `is_trivial_literal` holds, with
    /// green included if `is_trivial_code` holds.
    pub(crate) literal_arb: u32,
    /// Whether every pixel is the same literal and reading takes no bits.
    pub(crate) is_trivial_code: bool,
    pub(crate) packed: Option<Box<[PackedCode; HUFFMAN_PACKED_TABLE_SIZE]>>,
}

impl HuffmanTreeGroup {
    /// Assemble a group. `literal_max_bits` is the sum of the longest code
    /// lengths of the green, red, blue and alpha codes.
    pub(crate) fn new(
        trees: [TableRef; CODES_PER_GROUP],
        tables: &HuffmanTables,
        literal_max_bits: u32,
    ) -> Self {
        let root = |i: usize| tables.get(trees[i])[0];

        let is_trivial_literal = [RED, BLUE, ALPHA].iter().all(|i| root(*i).bits == 0);
        let mut is_trivial_code = false;
        let mut literal_arb = 0;

        if is_trivial_literal {
            literal_arb = ((root(ALPHA).value as u32) << 24)
                | ((root(RED).value as u32) << 16)
                | root(BLUE).value as u32;

            let total_bits: u32 = (0..CODES_PER_GROUP).map(|i| root(i).bits as u32).sum();

            if total_bits == 0 && root(GREEN).value < NUM_LITERAL_CODES {
                is_trivial_code = true;
                literal_arb |= (root(GREEN).value as u32) << 8;
            }
        }

        let packed = (!is_trivial_code && literal_max_bits < HUFFMAN_PACKED_BITS)
            .then(|| Box::new(build_packed_table(&trees, tables)));

        Self {
            trees,
            is_trivial_literal,
            literal_arb,
            is_trivial_code,
            packed,
        }
    }

    #[inline(always)]
    pub(crate) fn tree<'a>(&self, tables: &'a HuffmanTables, index: usize) -> &'a [HuffmanCode] {
        tables.get(self.trees[index])
    }
}

fn build_packed_table(
    trees: &[TableRef; CODES_PER_GROUP],
    tables: &HuffmanTables,
) -> [PackedCode; HUFFMAN_PACKED_TABLE_SIZE] {
    let mut packed = [PackedCode::default(); HUFFMAN_PACKED_TABLE_SIZE];

    for (code, entry) in packed.iter_mut().enumerate() {
        let mut bits = code;
        let green = tables.get(trees[GREEN])[bits];

        if green.value >= NUM_LITERAL_CODES {
            entry.bits = green.bits as u32 + BITS_SPECIAL_MARKER;
            entry.value = green.value as u32;
        } else {
            bits >>= accumulate(green, 8, entry);
            bits >>= accumulate(tables.get(trees[RED])[bits], 16, entry);
            bits >>= accumulate(tables.get(trees[BLUE])[bits], 0, entry);
            accumulate(tables.get(trees[ALPHA])[bits], 24, entry);
        }
    }

    packed
}

fn accumulate(code: HuffmanCode, shift: u32, entry: &mut PackedCode) -> usize {
    entry.bits += code.bits as u32;
    entry.value |= (code.value as u32) << shift;

    code.bits as usize
}

/// Decode a whole literal at once, or the green symbol if it is not a
/// literal.
#[inline(always)]
pub(crate) fn read_packed(
    packed: &[PackedCode; HUFFMAN_PACKED_TABLE_SIZE],
    reader: &mut BitReader<'_>,
) -> Packed {
    let val = reader.prefetch_bits() as usize & (HUFFMAN_PACKED_TABLE_SIZE - 1);
    let code = packed[val];

    if code.bits < BITS_SPECIAL_MARKER {
        reader.skip_bits(code.bits);
        Packed::Pixel(code.value)
    } else {
        reader.skip_bits(code.bits - BITS_SPECIAL_MARKER);
        Packed::Symbol(code.value as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::encode::PrefixCode;
    use super::*;
    use crate::Refill;
    use crate::bit_writer::BitWriter;

    fn table(lengths: &[u8]) -> Vec<HuffmanCode> {
        let size = build_table(None, HUFFMAN_TABLE_BITS, lengths);
        assert_ne!(size, 0);
        let mut table = vec![HuffmanCode::default(); size];
        assert_eq!(build_table(Some(&mut table), HUFFMAN_TABLE_BITS, lengths), size);

        table
    }

    #[test]
    fn canonical_assignment() {
        // Codes 10, 0, 110 and 111, read starting from the first bit.
        let table = table(&[2, 1, 3, 3]);

        assert_eq!(table[0b0], HuffmanCode { bits: 1, value: 1 });
        assert_eq!(table[0b01], HuffmanCode { bits: 2, value: 0 });
        assert_eq!(table[0b011], HuffmanCode { bits: 3, value: 2 });
        assert_eq!(table[0b111], HuffmanCode { bits: 3, value: 3 });
        // Unused high bits don't matter.
        assert_eq!(table[0b1111_0110], table[0b110]);
    }

    #[test]
    fn rejects_incomplete_codes() {
        // Over-subscribed.
        assert_eq!(build_table(None, 8, &[1, 1, 1]), 0);
        assert_eq!(build_table(None, 8, &[2, 2, 2, 2, 2]), 0);
        // Under-subscribed.
        assert_eq!(build_table(None, 8, &[1, 2, 0]), 0);
        assert_eq!(build_table(None, 8, &[3, 3, 3]), 0);
        // Empty and too long.
        assert_eq!(build_table(None, 8, &[0, 0, 0]), 0);
        assert_eq!(build_table(None, 8, &[1, 16]), 0);
    }

    #[test]
    fn single_symbol_takes_no_bits() {
        let table = table(&[0, 0, 0, 0, 0, 7, 0]);

        assert_eq!(table.len(), 256);
        assert!(table.iter().all(|e| *e == HuffmanCode { bits: 0, value: 5 }));

        let data = [0xff; 4];
        let mut reader = BitReader::new(&data, Refill::Wide);
        assert_eq!(read_symbol(&table, &mut reader), 5);
        assert_eq!(reader.bit_offset(), 0);
    }

    #[test]
    fn second_level_tables() {
        // Skewed counts give codes longer than the root table.
        let histogram: Vec<u32> = (0..40_u32).map(|i| 1 << (i / 2).min(20)).collect();
        let code = PrefixCode::from_histogram(&histogram, MAX_CODE_LENGTH as u8);
        assert!(code.lengths.iter().any(|l| *l as u32 > HUFFMAN_TABLE_BITS));

        let table = table(&code.lengths);
        assert!(table.len() > 256);

        let symbols: Vec<usize> = (0..2000).map(|i| (i * 7 + i / 3) % 40).collect();
        let mut writer = BitWriter::new();

        for &symbol in &symbols {
            code.write_symbol(&mut writer, symbol);
        }

        let data = writer.finish();
        let mut reader = BitReader::new(&data, Refill::Wide);

        for &symbol in &symbols {
            reader.fill_bit_window();
            assert_eq!(read_symbol(&table, &mut reader) as usize, symbol);
        }

        assert!(!reader.is_end_of_stream());
    }

    #[test]
    fn dry_run_matches_build() {
        let lengths = [1, 0, 2, 3, 0, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 15];
        let size = build_table(None, 8, &lengths);
        assert!(size > 256);
        let mut table = vec![HuffmanCode::default(); size];

        assert_eq!(build_table(Some(&mut table), 8, &lengths), size);
    }

    #[test]
    fn independent_builds_agree() {
        let histogram: Vec<u32> = (0..300_u32).map(|i| (i * 37 % 101 + 1) << (i % 13)).collect();
        let code = PrefixCode::from_histogram(&histogram, MAX_CODE_LENGTH as u8);
        assert!(code.lengths.iter().any(|l| *l as u32 > HUFFMAN_TABLE_BITS));

        let direct = table(&code.lengths);
        assert!(direct.len() > 256);

        // Another table in front so the second one starts at an offset.
        let mut tables = HuffmanTables::new(1 << 16).unwrap();
        let first = tables.build(HUFFMAN_TABLE_BITS, &code.lengths).unwrap();
        let second = tables.build(HUFFMAN_TABLE_BITS, &code.lengths).unwrap();

        assert_eq!(tables.num_segments(), 1);
        assert_eq!(&tables.get(first)[..direct.len()], &direct[..]);
        assert_eq!(&tables.get(second)[..direct.len()], &direct[..]);
    }

    #[test]
    fn tables_span_segments() {
        let mut tables = HuffmanTables::new(300).unwrap();
        let first = tables.build(8, &[1, 1]).unwrap();
        let second = tables.build(8, &[2, 2, 2, 2]).unwrap();

        assert_eq!(tables.num_segments(), 2);
        assert_eq!(tables.get(first)[1], HuffmanCode { bits: 1, value: 1 });
        assert_eq!(tables.get(second)[0b10], HuffmanCode { bits: 2, value: 1 });
        assert!(tables.build(8, &[1, 1, 1]).is_err());
    }

    #[test]
    fn packed_table_decodes_whole_pixels() {
        let mut tables = HuffmanTables::new(2000).unwrap();
        let mut green = vec![0; ALPHABET_SIZE[GREEN]];
        green[0x10] = 1;
        green[256] = 1;
        let mut red = vec![0; 256];
        red[0x20] = 1;
        red[0x21] = 1;
        let mut blue = vec![0; 256];
        blue[0x30] = 1;
        let mut alpha = vec![0; 256];
        alpha[0xff] = 1;
        let mut dist = vec![0; ALPHABET_SIZE[DIST]];
        dist[0] = 1;

        let trees = [
            tables.build(8, &green).unwrap(),
            tables.build(8, &red).unwrap(),
            tables.build(8, &blue).unwrap(),
            tables.build(8, &alpha).unwrap(),
            tables.build(8, &dist).unwrap(),
        ];
        let group = HuffmanTreeGroup::new(trees, &tables, 4);
        let packed = group.packed.as_deref().unwrap();

        assert!(!group.is_trivial_literal);
        assert!(!group.is_trivial_code);

        // Green 0x10, then red 0x21.
        let data = [0b10, 0];
        let mut reader = BitReader::new(&data, Refill::Wide);
        assert_eq!(read_packed(packed, &mut reader), Packed::Pixel(0xff21_1030));
        assert_eq!(reader.bit_offset(), 2);

        // A length code.
        let data = [0b1, 0];
        let mut reader = BitReader::new(&data, Refill::Wide);
        assert_eq!(read_packed(packed, &mut reader), Packed::Symbol(256));
        assert_eq!(reader.bit_offset(), 1);
    }

    #[test]
    fn trivial_group() {
        let mut tables = HuffmanTables::new(2000).unwrap();
        let single = |tables: &mut HuffmanTables, size: usize, symbol: usize| {
            let mut lengths = vec![0; size];
            lengths[symbol] = 1;
            tables.build(8, &lengths).unwrap()
        };

        let trees = [
            single(&mut tables, 280, 0x40),
            single(&mut tables, 256, 0x50),
            single(&mut tables, 256, 0x60),
            single(&mut tables, 256, 0x70),
            single(&mut tables, 40, 0),
        ];
        let group = HuffmanTreeGroup::new(trees, &tables, 4);

        assert!(group.is_trivial_code);
        assert_eq!(group.literal_arb, 0x7050_4060);
        assert!(group.packed.is_none());
    }
}
