//! Decoding of bitstreams that arrive in pieces.
//!
//! The decoder is fed either by appending chunks, which are copied into an
//! owned buffer, or by mapping a caller-owned buffer that only ever grows.
//! Every call decodes as far as the data allows and returns
//! [`DecodeError::Suspended`] if more is needed. The sub-decoders keep byte
//! offsets instead of pointers, so the buffer can be reallocated or swapped
//! between calls.

use crate::bit_reader::BitReader;
use crate::error::{BitstreamError, DecodeError, ParameterError, Result, bail};
use crate::lossless::{self, HEADER_SIZE, LosslessDecoder, LosslessHeader};
use crate::vp8::{FrameHeader, LossyHeader, Vp8Decoder};
use crate::{BitstreamFormat, DecodeSettings, ImageInfo, RowSink};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;

/// Appended data is stored in multiples of this many bytes. The buffer at
/// least doubles whenever it has to grow.
const GRANULE: usize = 4096;

/// The progress of an [`IncrementalDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for enough bytes to tell the format apart.
    HeaderPending,
    /// Waiting for the lossy frame header.
    FrameHeaderPending,
    /// Waiting for the first partition and the partition table.
    Partition0Pending,
    /// Decoding macroblock rows.
    RowDataPending,
    /// Waiting for the lossless header, transforms and prefix codes.
    LosslessHeaderPending,
    /// Decoding pixel rows.
    LosslessDataPending,
    Done,
    /// Decoding failed. The error is returned by every further call.
    Error,
}

#[derive(Debug)]
enum MemBuffer<'a> {
    /// No data was supplied yet, so the mode is still open.
    Unset,
    Append(Vec<u8>),
    Map(&'a [u8]),
}

impl MemBuffer<'_> {
    fn data(&self) -> &[u8] {
        match self {
            Self::Unset => &[],
            Self::Append(data) => data,
            Self::Map(data) => data,
        }
    }
}

#[derive(Debug)]
enum SubDecoder {
    Lossy(Box<Vp8Decoder>),
    Lossless(Box<LosslessDecoder>),
}

impl SubDecoder {
    fn resume_offset(&self) -> usize {
        match self {
            Self::Lossy(d) => d.resume_offset(),
            Self::Lossless(d) => d.resume_offset(),
        }
    }

    fn rebase(&mut self, bytes: usize) {
        match self {
            Self::Lossy(d) => d.rebase(bytes),
            Self::Lossless(d) => d.rebase(bytes),
        }
    }
}

#[derive(Debug)]
enum Stage {
    Header,
    FrameHeader,
    Partition0(FrameHeader),
    LosslessHeader,
    Decoding(SubDecoder),
    Done(SubDecoder),
    Error(DecodeError),
}

/// A decoder for lossy and lossless bitstreams that accepts its input in
/// pieces and hands decoded rows to a [`RowSink`] as soon as they are
/// complete.
pub struct IncrementalDecoder<'a, S: RowSink> {
    sink: S,
    settings: DecodeSettings,
    buffer: MemBuffer<'a>,
    /// Number of bytes discarded from the front of the stream.
    base: usize,
    stage: Stage,
    info: Option<ImageInfo>,
}

impl<'a, S: RowSink> IncrementalDecoder<'a, S> {
    /// Create a decoder that is fed with [`append`](Self::append) or
    /// [`update`](Self::update). The first call decides the mode.
    pub fn new(sink: S, settings: DecodeSettings) -> Self {
        Self {
            sink,
            settings,
            buffer: MemBuffer::Unset,
            base: 0,
            stage: Stage::Header,
            info: None,
        }
    }

    /// Create a decoder that reads from a caller-owned buffer. Longer views
    /// of the same stream are supplied with [`update`](Self::update).
    pub fn new_mapped(data: &'a [u8], sink: S, settings: DecodeSettings) -> Result<Self> {
        if data.is_empty() {
            bail!(ParameterError::EmptyBuffer);
        }

        let mut decoder = Self::new(sink, settings);
        decoder.buffer = MemBuffer::Map(data);

        Ok(decoder)
    }

    /// Copy `chunk` to the end of the buffered data and decode as far as
    /// possible.
    pub fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.check_latched()?;

        if chunk.is_empty() {
            bail!(ParameterError::EmptyBuffer);
        }

        if matches!(self.buffer, MemBuffer::Map(_)) {
            bail!(ParameterError::MixedBufferModes);
        }

        if matches!(self.buffer, MemBuffer::Unset) {
            self.buffer = MemBuffer::Append(Vec::new());
        }

        let discard = match &self.stage {
            Stage::Decoding(decoder) => decoder.resume_offset(),
            _ => 0,
        };

        if let MemBuffer::Append(buffer) = &mut self.buffer {
            if buffer.len() + chunk.len() > buffer.capacity() {
                if discard > 0 {
                    buffer.drain(..discard);
                    self.base += discard;

                    if let Stage::Decoding(decoder) = &mut self.stage {
                        decoder.rebase(discard);
                    }

                    ltrace!("discarded {} consumed bytes", discard);
                }

                let needed = buffer.len() + chunk.len();

                if needed > buffer.capacity() {
                    let size = needed
                        .max(2 * buffer.capacity())
                        .next_multiple_of(GRANULE);
                    buffer.try_reserve_exact(size - buffer.len())?;
                }
            }

            buffer.extend_from_slice(chunk);
        }

        self.advance()
    }

    /// Replace the mapped view with `data`, which must hold at least as many
    /// bytes of the same stream, and decode as far as possible.
    pub fn update(&mut self, data: &'a [u8]) -> Result<()> {
        self.check_latched()?;

        if data.is_empty() {
            bail!(ParameterError::EmptyBuffer);
        }

        match &mut self.buffer {
            MemBuffer::Append(_) => bail!(ParameterError::MixedBufferModes),
            MemBuffer::Map(old) if data.len() < old.len() => {
                bail!(ParameterError::ShrunkBuffer)
            }
            MemBuffer::Map(old) => *old = data,
            MemBuffer::Unset => self.buffer = MemBuffer::Map(data),
        }

        self.advance()
    }

    /// Decode as far as the buffered data allows.
    ///
    /// Returns `Ok(())` once the image is complete, and
    /// [`DecodeError::Suspended`] if more data is needed.
    pub fn advance(&mut self) -> Result<()> {
        self.run(usize::MAX)
    }

    /// Like [`advance`](Self::advance), but stop once the first `end_row`
    /// pixel rows were handed to the sink. Lossy frames are decoded in
    /// steps of 16 rows.
    ///
    /// Returns `Ok(())` when the rows are available.
    pub fn decode_row_range(&mut self, end_row: u32) -> Result<()> {
        self.run(end_row as usize)
    }

    /// `Ok(())` once decoding is complete, [`DecodeError::Suspended`] while
    /// it's in progress and the latched error after a failure.
    pub fn status(&self) -> Result<()> {
        match &self.stage {
            Stage::Done(_) => Ok(()),
            Stage::Error(e) => Err(*e),
            _ => Err(DecodeError::Suspended),
        }
    }

    pub fn state(&self) -> DecodeState {
        match &self.stage {
            Stage::Header => DecodeState::HeaderPending,
            Stage::FrameHeader => DecodeState::FrameHeaderPending,
            Stage::Partition0(_) => DecodeState::Partition0Pending,
            Stage::LosslessHeader => DecodeState::LosslessHeaderPending,
            Stage::Decoding(SubDecoder::Lossy(_)) => DecodeState::RowDataPending,
            Stage::Decoding(SubDecoder::Lossless(_)) => DecodeState::LosslessDataPending,
            Stage::Done(_) => DecodeState::Done,
            Stage::Error(_) => DecodeState::Error,
        }
    }

    /// The dimensions and format, once the header is parsed.
    pub fn info(&self) -> Option<ImageInfo> {
        self.info
    }

    /// The final pixels of the lossless rows emitted so far, as `0xAARRGGBB`.
    pub fn lossless_pixels(&self) -> &[u32] {
        match &self.stage {
            Stage::Decoding(SubDecoder::Lossless(d)) | Stage::Done(SubDecoder::Lossless(d)) => {
                d.pixels()
            }
            _ => &[],
        }
    }

    /// The headers of the lossy frame, once the first partition is parsed.
    pub fn lossy_header(&self) -> Option<&LossyHeader> {
        match &self.stage {
            Stage::Decoding(SubDecoder::Lossy(d)) | Stage::Done(SubDecoder::Lossy(d)) => {
                Some(d.header())
            }
            _ => None,
        }
    }

    /// Number of bytes consumed so far and no longer held by the decoder.
    pub fn discarded_bytes(&self) -> usize {
        self.base
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn check_latched(&self) -> Result<()> {
        match self.stage {
            Stage::Error(e) => Err(e),
            _ => Ok(()),
        }
    }

    fn run(&mut self, end_row: usize) -> Result<()> {
        self.check_latched()?;

        match self.step(end_row) {
            Ok(()) => Ok(()),
            Err(DecodeError::Bitstream(BitstreamError::UnexpectedEof)) => {
                Err(DecodeError::Suspended)
            }
            Err(e) => {
                ldebug!("decoding failed in state {:?}: {}", self.state(), e);
                self.stage = Stage::Error(e);

                Err(e)
            }
        }
    }

    fn step(&mut self, end_row: usize) -> Result<()> {
        let data = self.buffer.data();
        let settings = &self.settings;

        loop {
            let next = match &mut self.stage {
                Stage::Header => {
                    let format = match settings.format {
                        Some(format) => format,
                        None if data.len() < HEADER_SIZE => {
                            bail!(BitstreamError::UnexpectedEof)
                        }
                        None if lossless::is_lossless(data) => BitstreamFormat::Lossless,
                        None => BitstreamFormat::Lossy,
                    };

                    match format {
                        BitstreamFormat::Lossy => Stage::FrameHeader,
                        BitstreamFormat::Lossless => Stage::LosslessHeader,
                    }
                }
                Stage::FrameHeader => {
                    let frame = FrameHeader::read(data)?;
                    frame.check_limit(settings)?;
                    self.info = Some(frame.info());

                    Stage::Partition0(frame)
                }
                Stage::Partition0(frame) => {
                    let decoder = Vp8Decoder::new(data, *frame, settings, true)?;

                    Stage::Decoding(SubDecoder::Lossy(Box::new(decoder)))
                }
                Stage::LosslessHeader => {
                    if self.info.is_none() {
                        let mut reader = BitReader::new(data, settings.refill);
                        let header = LosslessHeader::read(&mut reader)?;
                        header.check_limit(settings)?;
                        self.info = Some(header.info());
                    }

                    let decoder = LosslessDecoder::new(data, settings, true)?;

                    Stage::Decoding(SubDecoder::Lossless(Box::new(decoder)))
                }
                Stage::Decoding(decoder) => {
                    let done = match decoder {
                        SubDecoder::Lossy(d) => {
                            d.decode(data, settings.refill, end_row, &mut self.sink)?
                        }
                        SubDecoder::Lossless(d) => {
                            d.decode(data, settings.refill, end_row, &mut self.sink)?
                        }
                    };

                    if !done {
                        return Ok(());
                    }

                    match mem::replace(&mut self.stage, Stage::Header) {
                        Stage::Decoding(decoder) => Stage::Done(decoder),
                        stage => stage,
                    }
                }
                Stage::Done(_) => return Ok(()),
                Stage::Error(e) => return Err(*e),
            };

            self.stage = next;
            ldebug!("incremental decoder entered state {:?}", self.state());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vp8::{FrameWriter, Macroblock, MacroblockLevels};
    use crate::{EncodeInput, EncodeSettings, RowBatch, encode_lossless};
    use alloc::vec;
    use nanorand::RNG;

    fn lossless_stream(width: u32, height: u32) -> (Vec<u8>, Vec<u32>) {
        let mut rng = nanorand::WyRand::new_seed(41);
        let mut pixels = Vec::new();

        for i in 0..(width * height) as usize {
            // Runs and repeats so that the stream has backward references.
            let pixel = if i % 7 < 3 && i > 0 {
                pixels[i - 1]
            } else {
                0xff00_0000 | rng.generate_range::<u32>(0, 1 << 24)
            };
            pixels.push(pixel);
        }

        let input = EncodeInput {
            width,
            height,
            pixels: &pixels,
        };
        let settings = EncodeSettings {
            palette: false,
            cache_bits: Some(4),
            ..EncodeSettings::default()
        };

        (encode_lossless(&input, &settings).unwrap(), pixels)
    }

    fn lossy_stream(width: u16, height: u16, num_partitions: u8) -> Vec<u8> {
        let mut header = LossyHeader::new(width, height);
        header.num_partitions = num_partitions;
        header.quant.base = 40;
        header.skip_prob = Some(200);

        let mut rng = nanorand::WyRand::new_seed(8);
        let mut writer = FrameWriter::new(&header).unwrap();
        let num_mbs = header.frame.mb_width() * header.frame.mb_height();

        for i in 0..num_mbs {
            let mut mb = MacroblockLevels::default();

            if i % 3 != 0 {
                for block in &mut mb.coeffs {
                    for c in &mut block[1..] {
                        if rng.generate_range::<u32>(0, 3) == 0 {
                            *c = rng.generate_range::<u32>(0, 41) as i16 - 20;
                        }
                    }
                }

                mb.y2[0] = 12;
            }

            writer.write_macroblock(&mb).unwrap();
        }

        writer.finish().unwrap()
    }

    #[derive(Default)]
    struct Collected {
        pixels: Vec<u32>,
        macroblocks: Vec<Macroblock>,
        batches: usize,
    }

    impl RowSink for Collected {
        fn rows(&mut self, batch: &RowBatch<'_>) -> bool {
            self.batches += 1;

            match batch {
                RowBatch::Argb { pixels, .. } => self.pixels.extend_from_slice(pixels),
                RowBatch::Macroblocks { macroblocks, .. } => {
                    self.macroblocks.extend_from_slice(macroblocks)
                }
            }

            true
        }
    }

    fn feed_in_pieces(data: &[u8], split: usize) -> Collected {
        let mut decoder = IncrementalDecoder::new(Collected::default(), DecodeSettings::default());

        for chunk in data.chunks(split) {
            match decoder.append(chunk) {
                Ok(()) | Err(DecodeError::Suspended) => {}
                Err(e) => panic!("{e} at split {split}"),
            }
        }

        assert_eq!(decoder.status(), Ok(()));
        assert_eq!(decoder.state(), DecodeState::Done);

        decoder.into_sink()
    }

    #[test]
    fn lossless_in_pieces() {
        let (data, pixels) = lossless_stream(37, 23);

        for split in [1, 2, 3, 7, 64, 1000, data.len()] {
            let collected = feed_in_pieces(&data, split);
            assert_eq!(collected.pixels, pixels, "split {split}");
        }
    }

    #[test]
    fn lossless_split_at_every_byte() {
        let (data, pixels) = lossless_stream(9, 6);

        for at in 1..data.len() {
            let mut decoder =
                IncrementalDecoder::new(Collected::default(), DecodeSettings::default());
            let first = decoder.append(&data[..at]);
            assert!(matches!(first, Ok(()) | Err(DecodeError::Suspended)), "split {at}");

            decoder.append(&data[at..]).unwrap();
            assert_eq!(decoder.lossless_pixels(), &pixels[..]);
            assert_eq!(decoder.into_sink().pixels, pixels, "split {at}");
        }
    }

    #[test]
    fn lossy_split_at_every_byte() {
        let data = lossy_stream(40, 35, 2);
        let mut expected = Vec::new();
        let header = crate::decode_lossy(&data, &mut |batch: &RowBatch<'_>| {
            if let RowBatch::Macroblocks { macroblocks, .. } = batch {
                expected.extend_from_slice(macroblocks);
            }

            true
        })
        .unwrap();

        for at in 1..data.len() {
            let mut decoder =
                IncrementalDecoder::new(Collected::default(), DecodeSettings::default());
            let first = decoder.append(&data[..at]);
            assert!(matches!(first, Ok(()) | Err(DecodeError::Suspended)), "split {at}");

            decoder.append(&data[at..]).unwrap();
            assert_eq!(decoder.lossy_header(), Some(&header));

            let collected = decoder.into_sink();
            assert_eq!(collected.macroblocks, expected, "split {at}");
            assert_eq!(collected.batches, 3);
        }
    }

    #[test]
    fn lossy_byte_by_byte_states() {
        let data = lossy_stream(16, 48, 1);
        let mut decoder = IncrementalDecoder::new(Collected::default(), DecodeSettings::default());
        let mut states = vec![decoder.state()];

        for byte in &data {
            let _ = decoder.append(core::slice::from_ref(byte));

            if states.last() != Some(&decoder.state()) {
                states.push(decoder.state());
            }
        }

        assert_eq!(
            states,
            [
                DecodeState::HeaderPending,
                DecodeState::FrameHeaderPending,
                DecodeState::Partition0Pending,
                DecodeState::RowDataPending,
                DecodeState::Done,
            ]
        );
        assert_eq!(
            decoder.info(),
            Some(ImageInfo {
                width: 16,
                height: 48,
                has_alpha: false,
                format: BitstreamFormat::Lossy,
            })
        );
    }

    #[test]
    fn consumed_data_is_discarded() {
        let (data, pixels) = lossless_stream(128, 128);
        let mut decoder = IncrementalDecoder::new(Collected::default(), DecodeSettings::default());

        for chunk in data.chunks(100) {
            let _ = decoder.append(chunk);
        }

        assert_eq!(decoder.status(), Ok(()));
        assert!(decoder.discarded_bytes() > 0);
        assert_eq!(decoder.into_sink().pixels, pixels);
    }

    #[test]
    fn appended_buffer_grows_geometrically() {
        // A frame whose first partition is far larger than the data fed, so
        // nothing can be discarded.
        let partition0_size = 400_000_u32;
        let tag = (partition0_size << 5) | 0x10;
        let mut data = vec![tag as u8, (tag >> 8) as u8, (tag >> 16) as u8];
        data.extend_from_slice(&[0x9d, 0x01, 0x2a, 64, 0, 64, 0]);
        data.resize(300_000, 0);

        let mut decoder = IncrementalDecoder::new(Collected::default(), DecodeSettings::default());
        let mut capacity = 0;
        let mut reallocations = 0;

        for chunk in data.chunks(128) {
            assert_eq!(decoder.append(chunk), Err(DecodeError::Suspended));

            let MemBuffer::Append(buffer) = &decoder.buffer else {
                unreachable!()
            };

            if buffer.capacity() != capacity {
                capacity = buffer.capacity();
                reallocations += 1;
            }
        }

        assert_eq!(decoder.state(), DecodeState::Partition0Pending);
        assert_eq!(decoder.discarded_bytes(), 0);
        assert!(capacity >= data.len());
        // 4 KiB doubled up to 512 KiB takes 8 steps. Growing by a granule
        // each time would take 74.
        assert!(reallocations <= 10, "{reallocations} reallocations");
    }

    #[test]
    fn mapped_buffer() {
        let (data, pixels) = lossless_stream(20, 20);
        let half = data.len() / 2;
        let settings = DecodeSettings::default();
        let mut decoder =
            IncrementalDecoder::new_mapped(&data[..half], Collected::default(), settings).unwrap();

        assert_eq!(decoder.advance(), Err(DecodeError::Suspended));
        assert_eq!(
            decoder.update(&data[..half - 1]),
            Err(ParameterError::ShrunkBuffer.into())
        );
        assert_eq!(
            decoder.append(&data[half..]),
            Err(ParameterError::MixedBufferModes.into())
        );

        decoder.update(&data).unwrap();
        assert_eq!(decoder.into_sink().pixels, pixels);
    }

    #[test]
    fn appending_then_mapping_is_rejected() {
        let (data, _) = lossless_stream(4, 4);
        let mut decoder = IncrementalDecoder::new(Collected::default(), DecodeSettings::default());

        assert_eq!(decoder.append(&data[..3]), Err(DecodeError::Suspended));
        assert_eq!(
            decoder.update(&data),
            Err(ParameterError::MixedBufferModes.into())
        );
        assert_eq!(decoder.append(&[]), Err(ParameterError::EmptyBuffer.into()));
        assert!(
            IncrementalDecoder::new_mapped(&[], Collected::default(), DecodeSettings::default())
                .is_err()
        );

        // Misuse doesn't poison the decoder.
        decoder.append(&data[3..]).unwrap();
    }

    #[test]
    fn sink_abort_is_latched() {
        let (data, _) = lossless_stream(8, 40);
        let mut calls = 0;
        let mut decoder = IncrementalDecoder::new(
            |_: &RowBatch<'_>| {
                calls += 1;
                false
            },
            DecodeSettings::default(),
        );

        assert_eq!(decoder.append(&data), Err(DecodeError::UserAbort));
        assert_eq!(decoder.state(), DecodeState::Error);
        assert_eq!(decoder.advance(), Err(DecodeError::UserAbort));
        assert_eq!(decoder.append(&[0]), Err(DecodeError::UserAbort));
        assert_eq!(decoder.status(), Err(DecodeError::UserAbort));
        drop(decoder);

        assert_eq!(calls, 1);
    }

    #[test]
    fn first_error_wins() {
        let mut decoder = IncrementalDecoder::new(Collected::default(), DecodeSettings::default());
        // A key frame with an invalid start code.
        let data = [0x50, 0x01, 0x00, 0x9d, 0x01, 0x2b, 0x10, 0x00, 0x10, 0x00];
        let invalid = DecodeError::Bitstream(BitstreamError::InvalidStartCode);

        assert_eq!(decoder.append(&data), Err(invalid));
        // A hidden frame would be a different error.
        assert_eq!(decoder.append(&[0x40]), Err(invalid));
        assert_eq!(decoder.decode_row_range(16), Err(invalid));
        assert_eq!(decoder.lossy_header(), None);
    }

    #[test]
    fn row_range() {
        let (data, pixels) = lossless_stream(10, 50);
        let mut decoder =
            IncrementalDecoder::new_mapped(&data, Collected::default(), DecodeSettings::default())
                .unwrap();

        decoder.decode_row_range(20).unwrap();
        assert_eq!(decoder.state(), DecodeState::LosslessDataPending);
        assert_eq!(decoder.lossless_pixels(), &pixels[..200]);

        decoder.decode_row_range(20).unwrap();
        assert_eq!(decoder.lossless_pixels().len(), 200);

        decoder.advance().unwrap();
        assert_eq!(decoder.state(), DecodeState::Done);
        assert_eq!(decoder.lossless_pixels(), &pixels[..]);
    }

    #[test]
    fn lossy_row_range_rounds_to_macroblocks() {
        let data = lossy_stream(32, 64, 4);
        let mut rows = Vec::new();
        let mut decoder = IncrementalDecoder::new_mapped(
            &data,
            |batch: &RowBatch<'_>| {
                if let RowBatch::Macroblocks { mb_y, .. } = batch {
                    rows.push(*mb_y);
                }

                true
            },
            DecodeSettings::default(),
        )
        .unwrap();

        decoder.decode_row_range(17).unwrap();
        assert_eq!(decoder.state(), DecodeState::RowDataPending);
        decoder.advance().unwrap();
        drop(decoder);

        assert_eq!(rows, [0, 1, 2, 3]);
    }

    #[test]
    fn format_hint_overrides_detection() {
        let (data, _) = lossless_stream(4, 4);
        let settings = DecodeSettings {
            format: Some(BitstreamFormat::Lossy),
            ..DecodeSettings::default()
        };
        let mut decoder = IncrementalDecoder::new(Collected::default(), settings);

        assert!(matches!(
            decoder.append(&data),
            Err(DecodeError::Bitstream(_) | DecodeError::Unsupported(_))
        ));
        assert_eq!(decoder.state(), DecodeState::Error);
        assert_eq!(decoder.info(), None);
    }

    #[test]
    fn pixel_limit() {
        let (data, _) = lossless_stream(30, 30);
        let settings = DecodeSettings {
            max_pixels: Some(899),
            ..DecodeSettings::default()
        };
        let mut decoder = IncrementalDecoder::new(Collected::default(), settings);

        assert_eq!(
            decoder.append(&data),
            Err(crate::UnsupportedFeature::ImageTooLarge.into())
        );
    }
}
