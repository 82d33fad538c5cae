//! gzip/deflate re-encoding with early abort on a poor compression ratio.
//!
//! Ported in spirit from `gzip.c`'s `evbuffer_gzip`: drive the zlib-style
//! encoder in fixed-size chunks and re-check the three-tier threshold after
//! every chunk produced, so the abort can actually fire mid-stream instead
//! of only after the whole body has been encoded.

use flate2::{Compression, Status};
use flate2::Compress as RawCompress;

const CHUNK: usize = 4096 * 4;

fn max(a: i64, b: i64) -> i64 {
    if a < b { b } else { a }
}

/// `deflate_style = true` selects a raw deflate stream (no zlib/gzip
/// wrapper); `false` selects the gzip wrapper (what the spec calls
/// "window bits + 16").
pub fn gzip(src: &[u8], min_percent: i64, deflate_style: bool) -> Option<Vec<u8>> {
    if src.is_empty() {
        return None;
    }

    let mut compress = RawCompress::new_gzip(Compression::default(), 9);
    let mut raw_compress;
    let compress: &mut RawCompress = if deflate_style {
        raw_compress = RawCompress::new(Compression::default(), false);
        &mut raw_compress
    } else {
        &mut compress
    };

    let mut target = Vec::with_capacity(src.len());
    let mut scratch = vec![0u8; CHUNK];
    let total_in = src.len() as i64;

    loop {
        let before_in = compress.total_in() as usize;
        let before_out = compress.total_out();

        let remaining = &src[before_in..];
        let status = compress
            .compress(remaining, &mut scratch, flate2::FlushCompress::Finish)
            .ok()?;

        let produced_this_round = (compress.total_out() - before_out) as usize;
        target.extend_from_slice(&scratch[..produced_this_round]);

        let consumed = compress.total_in() as i64;
        let produced = compress.total_out() as i64;

        if consumed > 0 {
            let ratio = 100 * produced / consumed;
            let abort = (consumed < total_in / 2 && ratio > min_percent)
                || (consumed >= total_in / 2 && consumed < total_in && ratio > max(97, min_percent))
                || (consumed >= total_in && ratio > max(99, min_percent));
            if abort {
                return None;
            }
        }

        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if compress.total_in() as usize >= src.len() && produced_this_round == 0 {
                    // No forward progress possible; treat as done/failed.
                    break;
                }
            }
        }
    }

    if compress.total_in() as usize != src.len() {
        return None;
    }

    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highly_compressible_body_survives_the_abort_gate() {
        let body = vec![b'A'; 4096];
        let out = gzip(&body, 75, true).expect("repetitive input should compress well");
        assert!(out.len() < body.len());
        let ratio = 100 * out.len() as i64 / body.len() as i64;
        assert!(ratio <= std::cmp::max(99, 75));
    }

    #[test]
    fn incompressible_random_like_body_aborts() {
        // Pseudo-random-ish bytes via a simple LCG so the test has no
        // external RNG dependency; no real-world compressor wins here.
        let mut body = Vec::with_capacity(8192);
        let mut state: u32 = 0x1234_5678;
        for _ in 0..8192 {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            body.push((state >> 16) as u8);
        }
        assert!(gzip(&body, 75, true).is_none());
    }

    #[test]
    fn empty_input_returns_none() {
        assert!(gzip(&[], 75, true).is_none());
    }
}
