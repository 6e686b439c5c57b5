#![no_main]

use hayro_webp::{DecodeSettings, IncrementalDecoder, RowBatch};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let settings = DecodeSettings {
        // Let's ignore larger images so we don't time out.
        max_pixels: Some(2500 * 2500),
        ..DecodeSettings::default()
    };

    let _ = hayro_webp::decode_lossless_with(data, &settings);
    let _ = hayro_webp::decode_lossy(data, &mut |_: &RowBatch<'_>| true);

    // Feeding the same data in pieces must not panic either.
    let mut decoder = IncrementalDecoder::new(|_: &RowBatch<'_>| true, settings);

    for chunk in data.chunks(97) {
        if let Err(e) = decoder.append(chunk)
            && !e.is_recoverable()
        {
            break;
        }
    }
});
