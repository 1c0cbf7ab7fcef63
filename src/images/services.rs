use base64ct::{Base64, Encoding};
use bytes::Bytes;

use crate::error::{AppError, AppResult};

/// A decoded, size-checked image ready for classification.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Standard base64 without any `data:` prefix.
    pub base64: String,
    pub bytes: Bytes,
    pub mime: &'static str,
}

/// Decode a base64 string or `data:image/...;base64,` URL.
pub fn decode_image(raw: &str, max_bytes: usize) -> AppResult<ImagePayload> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::validation("image is required"));
    }

    let body = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, body) = rest
                .split_once(',')
                .ok_or_else(|| AppError::validation("malformed data URL"))?;
            if !header.ends_with(";base64") {
                return Err(AppError::validation("data URL must be base64 encoded"));
            }
            body
        }
        None => raw,
    };

    let base64: String = if body.bytes().any(|b| b.is_ascii_whitespace()) {
        body.chars().filter(|c| !c.is_ascii_whitespace()).collect()
    } else {
        body.to_string()
    };

    // Reject before allocating the decoded buffer.
    if base64.len() / 4 * 3 > max_bytes + 3 {
        return Err(too_large(max_bytes));
    }

    let decoded =
        Base64::decode_vec(&base64).map_err(|_| AppError::validation("image is not valid base64"))?;
    if decoded.is_empty() {
        return Err(AppError::validation("image is empty"));
    }
    if decoded.len() > max_bytes {
        return Err(too_large(max_bytes));
    }

    let mime =
        sniff_mime(&decoded).ok_or_else(|| AppError::validation("unsupported image format"))?;

    Ok(ImagePayload {
        base64,
        bytes: Bytes::from(decoded),
        mime,
    })
}

fn too_large(max_bytes: usize) -> AppError {
    AppError::validation(format!("image exceeds {max_bytes} bytes"))
}

/// Identify an image by its magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some("image/png"),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] => Some("image/bmp"),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some("image/tiff"),
        _ => None,
    }
}

#[cfg(test)]
impl ImagePayload {
    pub fn sample_png() -> Self {
        let bytes = sample_png_bytes();
        Self {
            base64: Base64::encode_string(&bytes),
            bytes: Bytes::from(bytes),
            mime: "image/png",
        }
    }

    /// A PNG header followed by zero bytes, `len` bytes in total.
    pub fn sample_png_padded(len: usize) -> Self {
        let mut bytes = sample_png_bytes();
        bytes.resize(len.max(bytes.len()), 0);
        Self {
            base64: Base64::encode_string(&bytes),
            bytes: Bytes::from(bytes),
            mime: "image/png",
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(b"\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01");
    bytes
}

#[cfg(test)]
pub(crate) fn sample_png_data_url() -> String {
    format!("data:image/png;base64,{}", Base64::encode_string(&sample_png_bytes()))
}

#[cfg(test)]
mod image_tests {
    use super::*;

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_mime(&sample_png_bytes()), Some("image/png"));
        assert_eq!(sniff_mime(b"GIF89a...."), Some("image/gif"));
        assert_eq!(sniff_mime(b"RIFF\x10\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"BM\0\0"), Some("image/bmp"));
        assert_eq!(sniff_mime(b"II*\0"), Some("image/tiff"));
        assert_eq!(sniff_mime(b"%PDF-1.7"), None);
        assert_eq!(sniff_mime(b""), None);
    }

    #[test]
    fn decodes_data_url_and_strips_prefix() {
        let img = decode_image(&sample_png_data_url(), 1024).unwrap();
        assert_eq!(img.mime, "image/png");
        assert_eq!(img.bytes.as_ref(), sample_png_bytes().as_slice());
        assert!(!img.base64.starts_with("data:"));
    }

    #[test]
    fn decodes_bare_base64_with_line_breaks() {
        let b64 = Base64::encode_string(&sample_png_bytes());
        let wrapped = format!("{}\n{}", &b64[..8], &b64[8..]);
        let img = decode_image(&wrapped, 1024).unwrap();
        assert_eq!(img.base64, b64);
    }

    #[test]
    fn rejects_bad_payloads() {
        assert!(matches!(decode_image("", 1024), Err(AppError::Validation(_))));
        assert!(matches!(decode_image("!!!!", 1024), Err(AppError::Validation(_))));
        assert!(matches!(
            decode_image("data:image/png,abc", 1024),
            Err(AppError::Validation(_))
        ));
        let pdf = Base64::encode_string(b"%PDF-1.7 not an image");
        let err = decode_image(&pdf, 1024).unwrap_err();
        assert_eq!(err.to_string(), "unsupported image format");
    }

    #[test]
    fn enforces_size_limit() {
        let mut big = sample_png_bytes();
        big.resize(4096, 0);
        let b64 = Base64::encode_string(&big);
        let err = decode_image(&b64, 1024).unwrap_err();
        assert_eq!(err.to_string(), "image exceeds 1024 bytes");
        assert!(decode_image(&b64, 4096).is_ok());
    }
}
