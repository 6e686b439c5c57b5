//! Integration with the [image] crate

use std::ffi::OsStr;
use std::io::{BufRead, Seek};

use crate::{BitstreamFormat, DecodeError, LosslessImage, UnsupportedFeature};
use ::image::error::{DecodingError, ImageFormatHint};
use ::image::{ColorType, ImageDecoder, ImageError, ImageResult};
use image::hooks::{decoding_hook_registered, register_decoding_hook as register_hook};

const FORMAT_NAME: &str = "WebP lossless";

impl ImageDecoder for LosslessImage {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn color_type(&self) -> ColorType {
        if self.has_alpha {
            ColorType::Rgba8
        } else {
            ColorType::Rgb8
        }
    }

    fn read_image(self, buf: &mut [u8]) -> ImageResult<()>
    where
        Self: Sized,
    {
        write_pixels(&self, buf);

        Ok(())
    }

    fn read_image_boxed(self: Box<Self>, buf: &mut [u8]) -> ImageResult<()> {
        write_pixels(&self, buf);

        Ok(())
    }
}

fn write_pixels(image: &LosslessImage, buf: &mut [u8]) {
    if image.has_alpha {
        for (out, argb) in buf.chunks_exact_mut(4).zip(&image.pixels) {
            let [a, r, g, b] = argb.to_be_bytes();
            out.copy_from_slice(&[r, g, b, a]);
        }
    } else {
        for (out, argb) in buf.chunks_exact_mut(3).zip(&image.pixels) {
            out.copy_from_slice(&argb.to_be_bytes()[1..]);
        }
    }
}

#[doc(hidden)]
/// Lossless WebP decoder compatible with `image` decoding hook APIs that pass
/// an `impl Read + Seek`.
pub struct Vp8lDecoder {
    // The header only borrows the data while it's read, so the input is
    // decoded a second time in `read_image`.
    input: Vec<u8>,
    width: u32,
    height: u32,
    has_alpha: bool,
}

impl Vp8lDecoder {
    /// Create a new decoder that decodes from the stream `r`.
    pub fn new<R: BufRead + Seek>(r: R) -> ImageResult<Self> {
        let mut input = Vec::new();
        let mut r = r;
        r.read_to_end(&mut input)?;

        let info = crate::read_info(&input)?;

        if info.format != BitstreamFormat::Lossless {
            return Err(DecodeError::Unsupported(UnsupportedFeature::LossyPixels).into());
        }

        Ok(Self {
            width: info.width,
            height: info.height,
            has_alpha: info.has_alpha,
            input,
        })
    }

    fn decode(&self) -> ImageResult<LosslessImage> {
        let mut image = crate::decode_lossless(&self.input)?;
        // The hint from the header decides the layout reported earlier.
        image.has_alpha = self.has_alpha;

        Ok(image)
    }
}

impl ImageDecoder for Vp8lDecoder {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn color_type(&self) -> ColorType {
        if self.has_alpha {
            ColorType::Rgba8
        } else {
            ColorType::Rgb8
        }
    }

    fn read_image(self, buf: &mut [u8]) -> ImageResult<()>
    where
        Self: Sized,
    {
        self.decode()?.read_image(buf)
    }

    fn read_image_boxed(self: Box<Self>, buf: &mut [u8]) -> ImageResult<()> {
        self.decode()?.read_image(buf)
    }
}

impl From<DecodeError> for DecodingError {
    fn from(value: DecodeError) -> Self {
        let format = ImageFormatHint::Name(FORMAT_NAME.to_owned());
        Self::new(format, value)
    }
}

impl From<DecodeError> for ImageError {
    fn from(value: DecodeError) -> Self {
        Self::Decoding(value.into())
    }
}

/// Registers the decoder with the `image` crate so that non-format-specific
/// calls such as `ImageReader::open("image.vp8l")?.decode()?;` work with raw
/// lossless WebP bitstreams.
///
/// Returns `true` on success, or `false` if the hook is already registered.
pub fn register_decoding_hook() -> bool {
    if decoding_hook_registered(OsStr::new("vp8l")) {
        return false;
    }

    register_hook(
        "vp8l".into(),
        Box::new(|r| Ok(Box::new(Vp8lDecoder::new(r)?))),
    );

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodeInput, EncodeSettings, encode_lossless};
    use std::io::Cursor;

    fn encoded(pixels: &[u32], width: u32, height: u32) -> Vec<u8> {
        let input = EncodeInput {
            width,
            height,
            pixels,
        };

        encode_lossless(&input, &EncodeSettings::default()).unwrap()
    }

    #[test]
    fn decoder_reports_rgba() {
        let pixels = [0x8010_2030, 0xff40_5060, 0x0070_8090, 0xffa0_b0c0];
        let mut data = encoded(&pixels, 2, 2);
        // Set the alpha hint.
        data[4] |= 0x10;

        let decoder = Vp8lDecoder::new(Cursor::new(data)).unwrap();
        assert_eq!(decoder.dimensions(), (2, 2));
        assert_eq!(decoder.color_type(), ColorType::Rgba8);

        let mut buf = vec![0; decoder.total_bytes() as usize];
        decoder.read_image(&mut buf).unwrap();

        assert_eq!(
            buf,
            [
                0x10, 0x20, 0x30, 0x80, 0x40, 0x50, 0x60, 0xff, 0x70, 0x80, 0x90, 0x00, 0xa0, 0xb0,
                0xc0, 0xff
            ]
        );
    }

    #[test]
    fn opaque_image_drops_alpha() {
        let image = LosslessImage {
            width: 2,
            height: 1,
            has_alpha: false,
            pixels: vec![0xff01_0203, 0xff04_0506],
        };

        assert_eq!(image.color_type(), ColorType::Rgb8);

        let mut buf = vec![0; 6];
        image.read_image(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn lossy_input_is_rejected() {
        let data = [0x50, 0x01, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];
        let err = Vp8lDecoder::new(Cursor::new(data.to_vec())).err().unwrap();

        assert!(matches!(err, ImageError::Decoding(_)));
    }
}
