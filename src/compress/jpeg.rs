//! JPEG re-encoding at a reduced quality, ported in spirt from `jpeg.c`'s
//! `jpeg_recompress`: fast-path decode, size-cap rejection, progressive
//! quality-reduced re-encode. Fatal decode/encode failures become `None`
//! instead of unwinding through a signal handler, which is the Rust
//! substitute for the original's `setjmp`/`longjmp` error trap.

const MAX_DIMENSION: usize = 6000;

pub fn jpeg_recompress(src: &[u8], quality: u8) -> Option<Vec<u8>> {
    let mut decoder = jpeg_decoder::Decoder::new(src);
    // Header-only parse first, mirroring the original's check right after
    // `jpeg_start_decompress()` and before the scanline decode loop: the
    // size gate exists to avoid paying for the decode of an oversized
    // image at all, not to reject it after the fact.
    decoder.read_info().ok()?;
    let info = decoder.info()?;

    if info.width as usize > MAX_DIMENSION || info.height as usize > MAX_DIMENSION {
        return None;
    }

    // No fancy upsampling / fastest IDCT: the decoder crate's defaults
    // already favor speed over fidelity for chroma upsampling, matching
    // the original's do_fancy_upsampling=FALSE + JDCT_FASTEST settings.
    let pixels = decoder.decode().ok()?;

    let color_type = match info.pixel_format {
        jpeg_decoder::PixelFormat::L8 => jpeg_encoder::ColorType::Luma,
        jpeg_decoder::PixelFormat::RGB24 => jpeg_encoder::ColorType::Rgb,
        jpeg_decoder::PixelFormat::CMYK32 => return None,
        _ => return None,
    };

    let mut out = Vec::with_capacity(src.len());
    let mut encoder = jpeg_encoder::Encoder::new(&mut out, quality);
    encoder.set_progressive(true);
    encoder
        .encode(&pixels, info.width, info.height, color_type)
        .ok()?;

    Some(out)
}
