//! PNG re-encoding, ported in spirit from `png-support.c`'s
//! `png_recompress`: decode (de-interlacing if necessary), preserve sBIT
//! and gAMA, normalize pixel format, and re-encode. `quality` is accepted
//! for call-site symmetry with the JPEG adapter but only maps onto the
//! output compression-level selection -- PNG has no lossy quality knob.

use png::chunk::ChunkType;
use png::{BitDepth, ColorType, Compression, Transformations};

const SBIT: ChunkType = ChunkType(*b"sBIT");

pub fn png_recompress(src: &[u8], quality: u8) -> Option<Vec<u8>> {
    let mut decoder = png::Decoder::new(src);
    // The `png` crate's default is `Transformations::IDENTITY` -- no
    // normalization happens for free. `EXPAND` is the direct equivalent of
    // libpng's `png_set_palette_to_rgb` + `png_set_gray_1_2_4_to_8` (plus
    // tRNS-to-alpha expansion); `STRIP_16` is `png_set_strip_16`. Both have
    // to be requested explicitly before `read_info`, same as the original
    // calls them before `png_read_update_info`.
    decoder.set_transformations(Transformations::EXPAND | Transformations::STRIP_16);
    let mut reader = decoder.read_info().ok()?;
    let info = reader.info().clone();
    let sbit = find_ancillary_chunk(src, SBIT);

    let mut buf = vec![0u8; reader.output_buffer_size()];
    let output_info = reader.next_frame(&mut buf).ok()?;
    buf.truncate(output_info.buffer_size());

    // With the transformations above requested, `output_info` now reports
    // the normalized form (e.g. a paletted source comes out as RGB), and
    // progressively decoded interlaced sources are always de-interlaced,
    // matching the original's buffered-bitmap handling of interlaced
    // sources.
    let (color_type, bit_depth) = (output_info.color_type, output_info.bit_depth);

    let mut out = Vec::with_capacity(src.len());
    {
        let mut encoder = png::Encoder::new(&mut out, output_info.width, output_info.height);
        encoder.set_color(color_type);
        encoder.set_depth(bit_depth);
        encoder.set_compression(compression_for(quality));
        if let Some(gamma) = info.source_gamma {
            encoder.set_source_gamma(gamma);
        }

        let mut writer = encoder.write_header().ok()?;
        // `png_set_sBIT`'s equivalent: the encoder has no typed setter for
        // the significant-bits chunk, so write it back verbatim as a raw
        // ancillary chunk, same bytes libpng would have round-tripped.
        if let Some(data) = sbit {
            writer.write_chunk(SBIT, data).ok()?;
        }
        writer.write_image_data(&buf).ok()?;
    }

    Some(out)
}

fn compression_for(quality: u8) -> Compression {
    if quality >= 60 {
        Compression::Best
    } else {
        Compression::Default
    }
}

/// Scans the raw PNG byte stream for the first chunk of type `wanted`,
/// returning its data payload. PNG chunks are `length(4) | type(4) |
/// data(length) | crc(4)`, immediately following the 8-byte signature;
/// this walks that list directly rather than going through the decoder,
/// which doesn't expose unrecognized ancillary chunks like sBIT.
fn find_ancillary_chunk<'a>(src: &'a [u8], wanted: ChunkType) -> Option<&'a [u8]> {
    const SIGNATURE_LEN: usize = 8;
    let mut pos = SIGNATURE_LEN;
    while pos + 8 <= src.len() {
        let len = u32::from_be_bytes(src[pos..pos + 4].try_into().ok()?) as usize;
        let chunk_type = ChunkType([src[pos + 4], src[pos + 5], src[pos + 6], src[pos + 7]]);
        let data_start = pos + 8;
        let data_end = data_start.checked_add(len)?;
        if data_end + 4 > src.len() {
            return None;
        }
        if chunk_type == wanted {
            return Some(&src[data_start..data_end]);
        }
        if chunk_type == png::chunk::IDAT || chunk_type == png::chunk::IEND {
            return None;
        }
        pos = data_end + 4;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let width = 4u32;
        let height = 4u32;
        let pixels = vec![200u8; (width * height * 3) as usize];
        let mut buf = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut buf, width, height);
            encoder.set_color(ColorType::Rgb);
            encoder.set_depth(BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&pixels).unwrap();
        }
        buf
    }

    fn tiny_indexed_png() -> Vec<u8> {
        let width = 2u32;
        let height = 2u32;
        let palette: Vec<u8> = vec![255, 0, 0, 0, 255, 0]; // red, green
        let indices = vec![0u8, 1, 1, 0];
        let mut buf = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut buf, width, height);
            encoder.set_color(ColorType::Indexed);
            encoder.set_depth(BitDepth::Eight);
            encoder.set_palette(palette);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&indices).unwrap();
        }
        buf
    }

    fn tiny_png_with_sbit(sbit: &[u8]) -> Vec<u8> {
        let width = 4u32;
        let height = 4u32;
        let pixels = vec![200u8; (width * height * 3) as usize];
        let mut buf = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut buf, width, height);
            encoder.set_color(ColorType::Rgb);
            encoder.set_depth(BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_chunk(SBIT, sbit).unwrap();
            writer.write_image_data(&pixels).unwrap();
        }
        buf
    }

    #[test]
    fn recompress_round_trips_a_flat_image() {
        let src = tiny_png();
        let out = png_recompress(&src, 30);
        assert!(out.is_some());
    }

    #[test]
    fn find_ancillary_chunk_locates_sbit_between_ihdr_and_idat() {
        let src = tiny_png_with_sbit(&[8, 8, 8]);
        assert_eq!(find_ancillary_chunk(&src, SBIT), Some(&[8u8, 8, 8][..]));
    }

    #[test]
    fn recompress_preserves_sbit_chunk() {
        let src = tiny_png_with_sbit(&[5, 6, 5]);
        let out = png_recompress(&src, 30).expect("recompress should succeed");
        assert_eq!(find_ancillary_chunk(&out, SBIT), Some(&[5u8, 6, 5][..]));
    }

    #[test]
    fn recompress_expands_palette_to_rgb() {
        let src = tiny_indexed_png();
        let out = png_recompress(&src, 30).expect("paletted source should recompress");

        let decoder = png::Decoder::new(&out[..]);
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let output_info = reader.next_frame(&mut buf).unwrap();
        assert_ne!(output_info.color_type, ColorType::Indexed);
    }

    #[test]
    fn garbage_input_returns_none_not_panic() {
        let garbage = vec![0u8; 16];
        assert!(png_recompress(&garbage, 30).is_none());
    }
}
