//! Construction and storage of length-limited prefix codes.

use super::{CODE_LENGTH_CODE_ORDER, MAX_CODE_LENGTH, NUM_CODE_LENGTH_CODES};
use crate::bit_writer::BitWriter;
use alloc::vec;
use alloc::vec::Vec;

/// The longest code length of the code used to store code lengths.
const MAX_CODE_LENGTH_CODE_LENGTH: u8 = 7;

#[derive(Debug, Clone, Copy)]
struct Node {
    count: u32,
    /// The symbol of a leaf, or -1.
    value: i32,
    left: i32,
    right: i32,
}

/// Compute optimal code lengths for `histogram` with no code longer than
/// `depth_limit`.
///
/// Small counts are raised to a growing minimum until the tree fits into the
/// limit, which flattens the deep end of the tree.
fn code_lengths(histogram: &[u32], depth_limit: u8) -> Vec<u8> {
    let mut lengths = vec![0; histogram.len()];

    if histogram.iter().all(|c| *c == 0) {
        return lengths;
    }

    let mut count_min = 1_u32;

    loop {
        lengths.fill(0);

        let mut nodes: Vec<Node> = histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(symbol, count)| Node {
                count: (*count).max(count_min),
                value: symbol as i32,
                left: -1,
                right: -1,
            })
            .collect();

        // Largest count first, ties by symbol.
        nodes.sort_by(|a, b| b.count.cmp(&a.count).then(a.value.cmp(&b.value)));

        if nodes.len() == 1 {
            lengths[nodes[0].value as usize] = 1;
        } else {
            let mut pool = Vec::with_capacity(2 * nodes.len());

            while let (Some(a), Some(b)) = (nodes.pop(), nodes.pop()) {
                pool.push(a);
                pool.push(b);

                let count = a.count.saturating_add(b.count);
                let at = nodes
                    .iter()
                    .position(|n| n.count <= count)
                    .unwrap_or(nodes.len());

                nodes.insert(
                    at,
                    Node {
                        count,
                        value: -1,
                        left: pool.len() as i32 - 1,
                        right: pool.len() as i32 - 2,
                    },
                );

                if nodes.len() == 1 {
                    break;
                }
            }

            let mut stack = vec![(nodes[0], 0_u8)];

            while let Some((node, depth)) = stack.pop() {
                if node.left >= 0 {
                    stack.push((pool[node.left as usize], depth + 1));
                    stack.push((pool[node.right as usize], depth + 1));
                } else {
                    lengths[node.value as usize] = depth;
                }
            }
        }

        if lengths.iter().all(|l| *l <= depth_limit) {
            return lengths;
        }

        count_min *= 2;
    }
}

fn reverse_bits(num_bits: u8, bits: u32) -> u16 {
    if num_bits == 0 {
        0
    } else {
        (bits.reverse_bits() >> (32 - num_bits as u32)) as u16
    }
}

/// Assign canonical codes, bit-reversed so they can be written LSB first.
fn canonical_codes(lengths: &[u8]) -> Vec<u16> {
    let mut depth_count = [0_u32; MAX_CODE_LENGTH + 1];

    for &len in lengths {
        depth_count[len as usize] += 1;
    }

    depth_count[0] = 0;

    let mut next_code = [0_u32; MAX_CODE_LENGTH + 1];
    let mut code = 0;

    for len in 1..=MAX_CODE_LENGTH {
        code = (code + depth_count[len - 1]) << 1;
        next_code[len] = code;
    }

    lengths
        .iter()
        .map(|&len| {
            let code = next_code[len as usize];
            next_code[len as usize] += 1;
            reverse_bits(len, code)
        })
        .collect()
}

/// A run-length token of the code length sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token {
    code: u8,
    extra_bits: u8,
}

fn push_repeated_values(tokens: &mut Vec<Token>, mut repetitions: usize, value: u8, prev: u8) {
    if value != prev {
        tokens.push(Token {
            code: value,
            extra_bits: 0,
        });
        repetitions -= 1;
    }

    while repetitions > 0 {
        if repetitions < 3 {
            for _ in 0..repetitions {
                tokens.push(Token {
                    code: value,
                    extra_bits: 0,
                });
            }
            break;
        } else if repetitions < 7 {
            tokens.push(Token {
                code: 16,
                extra_bits: (repetitions - 3) as u8,
            });
            break;
        } else {
            tokens.push(Token {
                code: 16,
                extra_bits: 3,
            });
            repetitions -= 6;
        }
    }
}

fn push_repeated_zeros(tokens: &mut Vec<Token>, mut repetitions: usize) {
    while repetitions > 0 {
        if repetitions < 3 {
            for _ in 0..repetitions {
                tokens.push(Token {
                    code: 0,
                    extra_bits: 0,
                });
            }
            break;
        } else if repetitions < 11 {
            tokens.push(Token {
                code: 17,
                extra_bits: (repetitions - 3) as u8,
            });
            break;
        } else if repetitions < 139 {
            tokens.push(Token {
                code: 18,
                extra_bits: (repetitions - 11) as u8,
            });
            break;
        } else {
            tokens.push(Token {
                code: 18,
                extra_bits: 0x7f,
            });
            repetitions -= 138;
        }
    }
}

fn tokenize(lengths: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut prev = 8;
    let mut i = 0;

    while i < lengths.len() {
        let value = lengths[i];
        let runs = lengths[i..].iter().take_while(|l| **l == value).count();

        if value == 0 {
            push_repeated_zeros(&mut tokens, runs);
        } else {
            push_repeated_values(&mut tokens, runs, value, prev);
            prev = value;
        }

        i += runs;
    }

    tokens
}

/// A prefix code ready for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PrefixCode {
    pub(crate) lengths: Vec<u8>,
    /// Bit-reversed codes.
    pub(crate) codes: Vec<u16>,
}

impl PrefixCode {
    pub(crate) fn from_histogram(histogram: &[u32], max_length: u8) -> Self {
        let lengths = code_lengths(histogram, max_length);
        let codes = canonical_codes(&lengths);

        Self { lengths, codes }
    }

    #[inline]
    pub(crate) fn write_symbol(&self, writer: &mut BitWriter, symbol: usize) {
        writer.put_bits(self.codes[symbol] as u32, self.lengths[symbol] as u32);
    }

    /// Write the code lengths to `writer`.
    ///
    /// Afterwards, a code with a single symbol is cleared, since such a code
    /// is read back as taking zero bits.
    pub(crate) fn store(&mut self, writer: &mut BitWriter) {
        let mut count = 0;
        let mut symbols = [0; 2];

        for (symbol, _) in self.lengths.iter().enumerate().filter(|(_, l)| **l != 0) {
            if count < 2 {
                symbols[count] = symbol;
            }

            count += 1;

            if count > 2 {
                break;
            }
        }

        if count == 0 {
            // A simple code with the single one-bit symbol 0.
            writer.put_bits(0x01, 4);
        } else if count <= 2 && symbols[0] < 256 && symbols[1] < 256 {
            writer.put_bits(1, 1);
            writer.put_bits(count as u32 - 1, 1);

            if symbols[0] <= 1 {
                writer.put_bits(0, 1);
                writer.put_bits(symbols[0] as u32, 1);
            } else {
                writer.put_bits(1, 1);
                writer.put_bits(symbols[0] as u32, 8);
            }

            if count == 2 {
                writer.put_bits(symbols[1] as u32, 8);
            }
        } else {
            self.store_full(writer);
        }

        self.clear_if_single_symbol();
    }

    fn store_full(&self, writer: &mut BitWriter) {
        writer.put_bits(0, 1);

        let tokens = tokenize(&self.lengths);
        let mut histogram = [0_u32; NUM_CODE_LENGTH_CODES];

        for token in &tokens {
            histogram[token.code as usize] += 1;
        }

        let mut lengths_code = Self::from_histogram(&histogram, MAX_CODE_LENGTH_CODE_LENGTH);

        let num_codes = (5..=NUM_CODE_LENGTH_CODES)
            .rev()
            .find(|n| lengths_code.lengths[CODE_LENGTH_CODE_ORDER[n - 1]] != 0)
            .unwrap_or(4);

        writer.put_bits(num_codes as u32 - 4, 4);

        for &code in &CODE_LENGTH_CODE_ORDER[..num_codes] {
            writer.put_bits(lengths_code.lengths[code] as u32, 3);
        }

        lengths_code.clear_if_single_symbol();

        let mut trailing_zero_bits = 0;
        let mut trimmed = tokens.len();

        for token in tokens.iter().rev() {
            let extra = match token.code {
                0 => 0,
                17 => 3,
                18 => 7,
                _ => break,
            };

            trimmed -= 1;
            trailing_zero_bits += lengths_code.lengths[token.code as usize] as u32 + extra;
        }

        let write_trimmed = trimmed > 1 && trailing_zero_bits > 12;
        let length = if write_trimmed { trimmed } else { tokens.len() };
        writer.put_bits(write_trimmed as u32, 1);

        if write_trimmed {
            if trimmed == 2 {
                writer.put_bits(0, 3 + 2);
            } else {
                let bit_pairs = (trimmed - 2).ilog2() / 2 + 1;
                writer.put_bits(bit_pairs - 1, 3);
                writer.put_bits((trimmed - 2) as u32, bit_pairs * 2);
            }
        }

        for token in &tokens[..length] {
            lengths_code.write_symbol(writer, token.code as usize);

            match token.code {
                16 => writer.put_bits(token.extra_bits as u32, 2),
                17 => writer.put_bits(token.extra_bits as u32, 3),
                18 => writer.put_bits(token.extra_bits as u32, 7),
                _ => {}
            }
        }
    }

    fn clear_if_single_symbol(&mut self) {
        if self.lengths.iter().filter(|l| **l != 0).count() > 1 {
            return;
        }

        self.lengths.fill(0);
        self.codes.fill(0);
    }
}
