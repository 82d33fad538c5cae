pub mod deflate;
pub mod jpeg;
pub mod png;

pub use deflate::gzip;
pub use jpeg::jpeg_recompress;
pub use png::png_recompress;

/// Encoding the response pipeline picked for a transformed body, mirroring
/// the two content-encoding tokens the client/origin side actually speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Deflate,
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Gzip => "gzip",
        }
    }
}

/// Picks deflate over gzip when the client offers both, per the response
/// pipeline's documented preference.
pub fn preferred_encoding(accept_encoding: &str) -> Option<ContentEncoding> {
    let lower = accept_encoding.to_ascii_lowercase();
    if lower.contains("deflate") {
        Some(ContentEncoding::Deflate)
    } else if lower.contains("gzip") {
        Some(ContentEncoding::Gzip)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_deflate_when_both_offered() {
        assert_eq!(preferred_encoding("gzip, deflate"), Some(ContentEncoding::Deflate));
    }

    #[test]
    fn falls_back_to_gzip_alone() {
        assert_eq!(preferred_encoding("gzip"), Some(ContentEncoding::Gzip));
    }

    #[test]
    fn none_when_neither_offered() {
        assert_eq!(preferred_encoding("br"), None);
    }
}
