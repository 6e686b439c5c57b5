//! Error types for WebP decoding and encoding.

use core::fmt;

/// The main error type for WebP codec operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The caller misused the API.
    InvalidParameter(ParameterError),
    /// An allocation failed at a growth point.
    OutOfMemory,
    /// The bitstream is malformed.
    Bitstream(BitstreamError),
    /// The bitstream is valid but uses a feature that isn't handled.
    Unsupported(UnsupportedFeature),
    /// More input is needed before decoding can continue.
    ///
    /// This is the only recoverable error: appending more data and advancing
    /// again resumes decoding where it stopped.
    Suspended,
    /// The row callback requested early termination.
    UserAbort,
}

/// Errors caused by misuse of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterError {
    /// An empty buffer was supplied.
    EmptyBuffer,
    /// Append and map mode were mixed on the same decoder.
    MixedBufferModes,
    /// A mapped buffer was replaced by a shorter one.
    ShrunkBuffer,
    /// The image dimensions are zero or exceed the format limits.
    InvalidDimensions,
    /// The number of pixels doesn't match the dimensions.
    PixelCountMismatch,
    /// An encoder setting is out of range.
    InvalidSetting,
}

/// Errors related to malformed bitstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamError {
    /// The data ended before the stream was complete.
    UnexpectedEof,
    /// Invalid lossless signature.
    InvalidSignature,
    /// Unknown lossless version.
    InvalidVersion,
    /// Invalid lossy start code.
    InvalidStartCode,
    /// Invalid lossy profile.
    InvalidProfile,
    /// A lossy frame with a zero width or height.
    EmptyFrame,
    /// The code lengths don't form a complete prefix code.
    InvalidHuffmanCode,
    /// Repeat codes ran past the end of the alphabet.
    CodeLengthOverflow,
    /// A transform type appeared more than once.
    RepeatedTransform,
    /// Invalid color cache size.
    InvalidColorCacheBits,
    /// A backward reference points before the start of the image or past its
    /// end.
    InvalidBackwardReference,
    /// A color cache index was used without a color cache.
    InvalidColorCacheIndex,
    /// The partition sizes are inconsistent with the data.
    InvalidPartitions,
    /// A partition ran out of data although all of its bytes were present.
    TruncatedPartition,
}

/// Valid bitstream features that aren't supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedFeature {
    /// Lossy interframes.
    NonKeyFrame,
    /// Lossy frames that aren't meant to be shown.
    HiddenFrame,
    /// Images larger than the configured pixel limit.
    ImageTooLarge,
    /// Pixel output for lossy frames.
    LossyPixels,
}

impl DecodeError {
    /// Whether more input could make the operation succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Suspended)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter(e) => write!(f, "{e}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Bitstream(e) => write!(f, "{e}"),
            Self::Unsupported(e) => write!(f, "{e}"),
            Self::Suspended => write!(f, "not enough data"),
            Self::UserAbort => write!(f, "decoding was aborted by the row callback"),
        }
    }
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBuffer => write!(f, "empty input buffer"),
            Self::MixedBufferModes => write!(f, "append and map mode can't be mixed"),
            Self::ShrunkBuffer => write!(f, "mapped buffer can't shrink"),
            Self::InvalidDimensions => write!(f, "invalid image dimensions"),
            Self::PixelCountMismatch => write!(f, "pixel count doesn't match dimensions"),
            Self::InvalidSetting => write!(f, "invalid encoder setting"),
        }
    }
}

impl fmt::Display for BitstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of data"),
            Self::InvalidSignature => write!(f, "invalid lossless signature"),
            Self::InvalidVersion => write!(f, "invalid lossless version"),
            Self::InvalidStartCode => write!(f, "invalid lossy start code"),
            Self::InvalidProfile => write!(f, "invalid lossy profile"),
            Self::EmptyFrame => write!(f, "lossy frame has no pixels"),
            Self::InvalidHuffmanCode => write!(f, "invalid Huffman code"),
            Self::CodeLengthOverflow => write!(f, "code lengths exceed alphabet size"),
            Self::RepeatedTransform => write!(f, "transform type appeared twice"),
            Self::InvalidColorCacheBits => write!(f, "invalid color cache size"),
            Self::InvalidBackwardReference => write!(f, "invalid backward reference"),
            Self::InvalidColorCacheIndex => write!(f, "color cache index without color cache"),
            Self::InvalidPartitions => write!(f, "inconsistent partition sizes"),
            Self::TruncatedPartition => write!(f, "premature end of partition"),
        }
    }
}

impl fmt::Display for UnsupportedFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonKeyFrame => write!(f, "lossy interframes are not supported"),
            Self::HiddenFrame => write!(f, "hidden lossy frames are not supported"),
            Self::ImageTooLarge => write!(f, "image exceeds the pixel limit"),
            Self::LossyPixels => write!(f, "lossy frames can't be decoded to pixels"),
        }
    }
}

impl core::error::Error for DecodeError {}
impl core::error::Error for ParameterError {}
impl core::error::Error for BitstreamError {}
impl core::error::Error for UnsupportedFeature {}

impl From<ParameterError> for DecodeError {
    fn from(e: ParameterError) -> Self {
        Self::InvalidParameter(e)
    }
}

impl From<BitstreamError> for DecodeError {
    fn from(e: BitstreamError) -> Self {
        Self::Bitstream(e)
    }
}

impl From<UnsupportedFeature> for DecodeError {
    fn from(e: UnsupportedFeature) -> Self {
        Self::Unsupported(e)
    }
}

impl From<alloc::collections::TryReserveError> for DecodeError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result type for WebP codec operations.
pub type Result<T> = core::result::Result<T, DecodeError>;

macro_rules! bail {
    ($err:expr) => {
        return Err($err.into())
    };
}

macro_rules! err {
    ($err:expr) => {
        Err($err.into())
    };
}

pub(crate) use bail;
pub(crate) use err;
