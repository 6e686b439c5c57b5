//! Tests for the public API of hayro-webp.

use hayro_webp::vp8::{IntraMode, LumaMode, MacroblockLevels};
use hayro_webp::{
    BitstreamFormat, CrossColorSettings, DecodeError, DecodeSettings, EncodeInput, EncodeSettings,
    FrameWriter, ImageInfo, IncrementalDecoder, LossyHeader, Macroblock, Multipliers,
    PredictorSettings, Refill, RowBatch,
};
use nanorand::RNG;

fn random_image(rng: &mut nanorand::WyRand, width: u32, height: u32, colors: usize) -> Vec<u32> {
    let palette: Vec<u32> = (0..colors).map(|_| rng.generate::<u32>()).collect();
    let mut pixels = Vec::with_capacity((width * height) as usize);

    for _ in 0..width * height {
        let pixel = match rng.generate_range::<u32>(0, 4) {
            // Repeat the pixel above or to the left to create matches.
            0 if pixels.len() >= width as usize => pixels[pixels.len() - width as usize],
            1 if !pixels.is_empty() => pixels[pixels.len() - 1],
            _ => palette[rng.generate_range::<usize>(0, colors)],
        };

        pixels.push(pixel);
    }

    pixels
}

fn round_trip(pixels: &[u32], width: u32, height: u32, settings: &EncodeSettings) {
    let input = EncodeInput {
        width,
        height,
        pixels,
    };
    let data = hayro_webp::encode_lossless(&input, settings).unwrap();
    let image = hayro_webp::decode_lossless(&data).unwrap();

    assert_eq!((image.width, image.height), (width, height));
    assert!(image.pixels == pixels, "{settings:?}");
}

#[test]
fn lossless_settings_round_trip() {
    let mut rng = nanorand::WyRand::new_seed(3);
    let (width, height) = (45, 31);
    let many_colors = random_image(&mut rng, width, height, 600);
    let few_colors = random_image(&mut rng, width, height, 13);

    let predictors = [
        None,
        Some(PredictorSettings { mode: 0, bits: 2 }),
        Some(PredictorSettings { mode: 5, bits: 3 }),
        Some(PredictorSettings { mode: 11, bits: 4 }),
        Some(PredictorSettings { mode: 13, bits: 9 }),
    ];
    let cross_colors = [
        None,
        Some(CrossColorSettings {
            multipliers: Multipliers {
                green_to_red: 3,
                green_to_blue: 250,
                red_to_blue: 17,
            },
            bits: 5,
        }),
    ];

    for predictor in predictors {
        for cross_color in cross_colors {
            for cache_bits in [Some(0), Some(1), Some(7), None] {
                for subtract_green in [false, true] {
                    let settings = EncodeSettings {
                        subtract_green,
                        predictor,
                        cross_color,
                        palette: false,
                        cache_bits,
                        huffman_bits: Some(4),
                        max_candidates: 8,
                    };

                    round_trip(&many_colors, width, height, &settings);
                }
            }
        }
    }

    for cache_bits in [Some(0), Some(4), None] {
        for huffman_bits in [None, Some(2), Some(9)] {
            let settings = EncodeSettings {
                palette: true,
                cache_bits,
                huffman_bits,
                ..EncodeSettings::default()
            };

            round_trip(&few_colors, width, height, &settings);
        }
    }
}

#[test]
fn tiny_images() {
    let mut rng = nanorand::WyRand::new_seed(11);

    for (width, height) in [(1, 1), (1, 17), (17, 1), (2, 2), (3, 5)] {
        for colors in [1, 2, 3, 5, 17, 300] {
            let pixels = random_image(&mut rng, width, height, colors);
            round_trip(&pixels, width, height, &EncodeSettings::default());
        }
    }
}

#[test]
fn alpha_hint() {
    let opaque = [0xff00_ff00; 4];
    let translucent = [0xff00_ff00, 0x8000_ff00, 0x0000_0000, 0xff00_ff00];

    for (pixels, has_alpha) in [(opaque, false), (translucent, true)] {
        let input = EncodeInput {
            width: 4,
            height: 1,
            pixels: &pixels,
        };
        let data = hayro_webp::encode_lossless(&input, &EncodeSettings::default()).unwrap();
        let image = hayro_webp::decode_lossless(&data).unwrap();

        assert_eq!(image.has_alpha, has_alpha);
        assert_eq!(image.pixels, pixels);
    }
}

#[test]
fn refill_strategies_agree() {
    let mut rng = nanorand::WyRand::new_seed(99);
    let pixels = random_image(&mut rng, 70, 40, 1000);
    let input = EncodeInput {
        width: 70,
        height: 40,
        pixels: &pixels,
    };
    let data = hayro_webp::encode_lossless(&input, &EncodeSettings::default()).unwrap();

    for refill in [Refill::Wide, Refill::Bytewise] {
        let settings = DecodeSettings {
            refill,
            ..DecodeSettings::default()
        };
        let image = hayro_webp::decode_lossless_with(&data, &settings).unwrap();
        assert_eq!(image.pixels, pixels);
    }
}

#[test]
fn image_info() {
    let input = EncodeInput {
        width: 300,
        height: 2,
        pixels: &[0xff12_3456; 600],
    };
    let lossless = hayro_webp::encode_lossless(&input, &EncodeSettings::default()).unwrap();

    assert_eq!(
        hayro_webp::read_info(&lossless).unwrap(),
        ImageInfo {
            width: 300,
            height: 2,
            has_alpha: false,
            format: BitstreamFormat::Lossless,
        }
    );

    let mut writer = FrameWriter::new(&LossyHeader::new(33, 17)).unwrap();

    for _ in 0..6 {
        writer.write_macroblock(&MacroblockLevels::default()).unwrap();
    }

    let lossy = writer.finish().unwrap();
    let info = hayro_webp::read_info(&lossy).unwrap();
    assert_eq!((info.width, info.height), (33, 17));
    assert_eq!(info.format, BitstreamFormat::Lossy);
}

#[test]
fn lossy_symbols() {
    let mut header = LossyHeader::new(32, 16);
    header.quant.base = 10;

    let mut first = MacroblockLevels {
        luma: LumaMode::Tm,
        ..MacroblockLevels::default()
    };
    first.y2[0] = -3;
    first.coeffs[0][1] = 2;
    first.coeffs[20][0] = 1;

    let mut second = MacroblockLevels {
        luma: LumaMode::B,
        ..MacroblockLevels::default()
    };
    second.subblock_modes[5] = IntraMode::Hu;
    second.coeffs[15][0] = -7;

    let mut writer = FrameWriter::new(&header).unwrap();
    writer.write_macroblock(&first).unwrap();
    writer.write_macroblock(&second).unwrap();
    let data = writer.finish().unwrap();

    let mut decoded: Vec<Macroblock> = Vec::new();
    let header = hayro_webp::decode_lossy(&data, &mut |batch: &RowBatch<'_>| {
        if let RowBatch::Macroblocks { mb_y, macroblocks } = batch {
            assert_eq!(*mb_y, 0);
            decoded.extend_from_slice(macroblocks);
        }

        true
    })
    .unwrap();

    assert_eq!(header.quant.base, 10);
    assert_eq!(decoded.len(), 2);

    let [a, b] = &decoded[..] else {
        unreachable!()
    };

    assert_eq!(a.luma, LumaMode::Tm);
    assert!(a.subblock_modes.iter().all(|m| *m == IntraMode::Tm));
    assert!(a.y2[0] < 0);
    assert!(a.coeffs[0][1] > 0);
    assert!(a.coeffs[20][0] > 0);
    assert_eq!(a.coeffs[1], [0; 16]);

    assert_eq!(b.luma, LumaMode::B);
    assert_eq!(b.subblock_modes[5], IntraMode::Hu);
    assert_eq!(b.y2, [0; 16]);
    assert!(b.coeffs[15][0] < 0);
    assert_eq!(b.non_zero, 1 << 15);
}

#[test]
fn incremental_random_chunks() {
    let mut rng = nanorand::WyRand::new_seed(1234);
    let pixels = random_image(&mut rng, 64, 64, 200);
    let input = EncodeInput {
        width: 64,
        height: 64,
        pixels: &pixels,
    };
    let data = hayro_webp::encode_lossless(&input, &EncodeSettings::default()).unwrap();

    for _ in 0..10 {
        let mut rows = Vec::new();
        let mut decoder = IncrementalDecoder::new(
            |batch: &RowBatch<'_>| {
                if let RowBatch::Argb { pixels, .. } = batch {
                    rows.extend_from_slice(pixels);
                }

                true
            },
            DecodeSettings::default(),
        );

        let mut rest = &data[..];

        while !rest.is_empty() {
            let len = rng.generate_range::<usize>(1, 300).min(rest.len());
            let (chunk, tail) = rest.split_at(len);
            rest = tail;

            match decoder.append(chunk) {
                Ok(()) => assert!(rest.is_empty()),
                Err(e) => assert_eq!(e, DecodeError::Suspended),
            }
        }

        assert_eq!(decoder.status(), Ok(()));
        drop(decoder);
        assert!(rows == pixels);
    }
}

#[test]
fn truncated_input_is_an_error() {
    let mut rng = nanorand::WyRand::new_seed(7);
    let pixels = random_image(&mut rng, 16, 16, 50);
    let input = EncodeInput {
        width: 16,
        height: 16,
        pixels: &pixels,
    };
    let data = hayro_webp::encode_lossless(&input, &EncodeSettings::default()).unwrap();

    for len in 0..data.len() {
        assert!(hayro_webp::decode_lossless(&data[..len]).is_err(), "length {len}");
    }
}

#[test]
fn image_crate_hook() {
    let input = EncodeInput {
        width: 3,
        height: 2,
        pixels: &[0xff01_0203, 0xff04_0506, 0xff07_0809, 0xff0a_0b0c, 0xff0d_0e0f, 0xff10_1112],
    };
    let data = hayro_webp::encode_lossless(&input, &EncodeSettings::default()).unwrap();

    let path = std::env::temp_dir().join("hayro_webp_hook_test.vp8l");
    std::fs::write(&path, &data).unwrap();

    hayro_webp::register_decoding_hook();
    assert!(!hayro_webp::register_decoding_hook());

    let image = image::ImageReader::open(&path).unwrap().decode().unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(image.to_rgb8().into_raw(), (1..=18).collect::<Vec<u8>>());
}
