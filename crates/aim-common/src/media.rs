//! Attachment normalization policy.
//!
//! Inbound attachment bytes are untrusted. For anything claiming an
//! `image/*` MIME type we sniff the real format from magic bytes, restrict
//! to JPEG/PNG/GIF, cap dimensions and pixel count, and re-encode JPEG/PNG
//! through a canonical encoder so trailing polyglot bytes cannot survive.
//! GIF is passed through unmodified to preserve animation.

use std::io::Cursor;

use image::{GenericImageView, ImageFormat, ImageReader};

use crate::error::{CoreError, CoreResult};

/// Size cap for a single direct `file.put` attachment.
pub const MAX_DIRECT_ATTACHMENT_BYTES: usize = 5 * 1024 * 1024;
/// Size cap for a chunked upload session.
pub const MAX_CHUNKED_ATTACHMENT_BYTES: usize = 64 * 1024 * 1024;

/// Maximum accepted width or height of an image, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 8192;
/// Maximum accepted total pixel count of an image.
pub const MAX_IMAGE_PIXELS: u64 = 30_000_000;

/// How the attachment bytes arrived, which decides the size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRoute {
    Direct,
    Chunked,
}

impl AttachmentRoute {
    pub fn max_bytes(&self) -> usize {
        match self {
            Self::Direct => MAX_DIRECT_ATTACHMENT_BYTES,
            Self::Chunked => MAX_CHUNKED_ATTACHMENT_BYTES,
        }
    }
}

/// The sanitized result handed to the blob store.
#[derive(Debug, Clone)]
pub struct NormalizedAttachment {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Image formats the policy accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SniffedImage {
    Jpeg,
    Png,
    Gif,
}

impl SniffedImage {
    fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
        }
    }

    fn format(&self) -> ImageFormat {
        match self {
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Png => ImageFormat::Png,
            Self::Gif => ImageFormat::Gif,
        }
    }
}

/// Identify the real image format from magic bytes, ignoring the claim.
fn sniff_image(bytes: &[u8]) -> Option<SniffedImage> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(SniffedImage::Jpeg)
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some(SniffedImage::Png)
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some(SniffedImage::Gif)
    } else {
        None
    }
}

/// Normalize one attachment.
///
/// Non-image MIME types pass through with only the size check. Image claims
/// are sniffed and sanitized; a claim the bytes don't back is rejected.
pub fn normalize_attachment(
    claimed_mime: &str,
    bytes: Vec<u8>,
    route: AttachmentRoute,
) -> CoreResult<NormalizedAttachment> {
    let claimed_mime = claimed_mime.trim();
    if bytes.is_empty() {
        return Err(CoreError::api("attachment is empty"));
    }
    if bytes.len() > route.max_bytes() {
        return Err(CoreError::api(format!(
            "attachment exceeds {} byte limit",
            route.max_bytes()
        )));
    }

    if !claimed_mime.starts_with("image/") {
        return Ok(NormalizedAttachment {
            bytes,
            mime: claimed_mime.to_owned(),
            width: None,
            height: None,
        });
    }

    let Some(sniffed) = sniff_image(&bytes) else {
        return Err(CoreError::api(format!(
            "attachment claims {claimed_mime} but is not a supported image"
        )));
    };

    let (width, height) = image_dimensions(&bytes, sniffed)?;
    if width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(CoreError::api(format!(
            "image dimensions {width}x{height} exceed {MAX_IMAGE_DIMENSION}"
        )));
    }
    if u64::from(width) * u64::from(height) > MAX_IMAGE_PIXELS {
        return Err(CoreError::api("image pixel count exceeds limit"));
    }

    // GIF keeps its original bytes so animation frames survive.
    let bytes = match sniffed {
        SniffedImage::Gif => bytes,
        SniffedImage::Jpeg | SniffedImage::Png => reencode(&bytes, sniffed)?,
    };

    Ok(NormalizedAttachment {
        bytes,
        mime: sniffed.mime().to_owned(),
        width: Some(width),
        height: Some(height),
    })
}

/// Read image dimensions without a full decode.
fn image_dimensions(bytes: &[u8], sniffed: SniffedImage) -> CoreResult<(u32, u32)> {
    let mut reader = ImageReader::new(Cursor::new(bytes));
    reader.set_format(sniffed.format());
    reader
        .into_dimensions()
        .map_err(|e| CoreError::api(format!("unreadable image header: {e}")))
}

/// Decode and re-encode through a canonical encoder, dropping anything the
/// decoder did not consume (trailing polyglot bytes, ancillary chunks).
fn reencode(bytes: &[u8], sniffed: SniffedImage) -> CoreResult<Vec<u8>> {
    let mut reader = ImageReader::new(Cursor::new(bytes));
    reader.set_format(sniffed.format());
    let img = reader
        .decode()
        .map_err(|e| CoreError::api(format!("undecodable image: {e}")))?;
    let (w, h) = img.dimensions();
    tracing::debug!(width = w, height = h, mime = sniffed.mime(), "re-encoding attachment image");

    let mut out = Cursor::new(Vec::with_capacity(bytes.len()));
    img.write_to(&mut out, sniffed.format())
        .map_err(|e| CoreError::api(format!("image re-encode failed: {e}")))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest valid 1×1 PNG (created once with the canonical encoder).
    fn tiny_png() -> Vec<u8> {
        let img = image::DynamicImage::new_rgba8(1, 1);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn non_image_passes_through() {
        let out =
            normalize_attachment("application/pdf", b"%PDF-1.4 ...".to_vec(), AttachmentRoute::Direct)
                .unwrap();
        assert_eq!(out.mime, "application/pdf");
        assert!(out.width.is_none());
    }

    #[test]
    fn oversized_attachment_is_rejected() {
        let bytes = vec![0u8; MAX_DIRECT_ATTACHMENT_BYTES + 1];
        assert!(normalize_attachment("application/octet-stream", bytes, AttachmentRoute::Direct)
            .is_err());
    }

    #[test]
    fn image_claim_without_image_bytes_is_rejected() {
        let err = normalize_attachment("image/png", b"not a png".to_vec(), AttachmentRoute::Direct)
            .unwrap_err();
        assert!(err.to_string().contains("not a supported image"));
    }

    #[test]
    fn png_is_reencoded_and_polyglot_tail_stripped() {
        let mut bytes = tiny_png();
        let clean_len = bytes.len();
        bytes.extend_from_slice(b"<script>alert(1)</script>");
        let out = normalize_attachment("image/png", bytes, AttachmentRoute::Direct).unwrap();
        assert_eq!(out.mime, "image/png");
        assert_eq!(out.width, Some(1));
        // Re-encoded output is a fresh canonical PNG, not the polyglot input.
        assert!(out.bytes.len() <= clean_len);
        assert!(out.bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn gif_passes_through_verbatim() {
        // 1×1 transparent GIF89a.
        let gif: Vec<u8> = vec![
            0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00,
            0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C,
            0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00,
            0x3B,
        ];
        let out = normalize_attachment("image/gif", gif.clone(), AttachmentRoute::Direct).unwrap();
        assert_eq!(out.bytes, gif);
        assert_eq!(out.mime, "image/gif");
    }
}
