//! Minimal binary parsing for the three texture container formats.
//!
//! Two jobs, both driven by the pipeline and review session:
//!
//! 1. **Dimension discovery** — [`read_dimensions`] pulls width/height out of
//!    TGA, PNG, or JPEG bytes without a full decode. This feeds the
//!    max-dimension skip policy.
//! 2. **Origin normalization** — [`normalize_origin`] rewrites top-left-origin
//!    TGA files as bottom-left, uncompressed true-color. The downstream engine
//!    assumes bottom-left scan lines and chokes on anything else, so this step
//!    runs after every conversion that produces a TGA.
//!
//! ## Why hand-rolled parsing
//!
//! The normalization contract is byte-exact: the id field, color map, and any
//! trailing bytes (TGA footer, developer area) must survive the rewrite
//! verbatim, and a file that is already bottom-left must come back untouched.
//! General-purpose image crates re-encode on save and cannot make that
//! guarantee, so the ~200 lines of header/RLE handling live here instead.
//!
//! ## Failure policy
//!
//! Every structural violation (short buffer, bad signature, unsupported depth
//! or image type, RLE packet overrun, pixel-count mismatch) is a fatal
//! [`CodecError`] for that one image. The codec never retries and never
//! falls back; callers decide what a broken image means for their workflow.

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated {0} header")]
    TruncatedHeader(&'static str),
    #[error("invalid PNG signature")]
    BadPngSignature,
    #[error("invalid PNG IHDR chunk")]
    BadIhdrChunk,
    #[error("invalid JPEG SOI marker")]
    BadJpegSoi,
    #[error("no JPEG frame header found")]
    MissingJpegFrame,
    #[error("invalid TGA dimensions {0}x{1}")]
    BadTgaDimensions(u32, u32),
    #[error("unsupported TGA pixel depth {0}")]
    UnsupportedTgaDepth(u8),
    #[error("unsupported TGA image type {0}")]
    UnsupportedTgaImageType(u8),
    #[error("unsupported TGA color map type {0}")]
    UnsupportedTgaColorMap(u8),
    #[error("TGA header fields exceed file length")]
    TgaHeaderOverrun,
    #[error("TGA pixel data is truncated")]
    TruncatedTgaPixels,
    #[error("TGA RLE packet overruns the stream")]
    RlePacketOverrun,
    #[error("decoded TGA pixel count mismatch")]
    PixelCountMismatch,
}

/// Container format, detected from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Tga,
    Png,
    Jpeg,
}

impl ImageFormat {
    /// Detect the format from a path's extension (case-insensitive).
    /// Returns `None` for extensions the pipeline does not handle.
    pub fn from_extension(path: &Path) -> Option<ImageFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "tga" => Some(ImageFormat::Tga),
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Extract dimensions from raw image bytes without a full decode.
pub fn read_dimensions(bytes: &[u8], format: ImageFormat) -> Result<Dimensions, CodecError> {
    match format {
        ImageFormat::Tga => tga_dimensions(bytes),
        ImageFormat::Png => png_dimensions(bytes),
        ImageFormat::Jpeg => jpeg_dimensions(bytes),
    }
}

/// TGA stores little-endian u16 width/height at fixed offsets 12 and 14
/// of the 18-byte header.
fn tga_dimensions(bytes: &[u8]) -> Result<Dimensions, CodecError> {
    if bytes.len() < TGA_HEADER_LEN {
        return Err(CodecError::TruncatedHeader("TGA"));
    }
    Ok(Dimensions {
        width: u16::from_le_bytes([bytes[12], bytes[13]]) as u32,
        height: u16::from_le_bytes([bytes[14], bytes[15]]) as u32,
    })
}

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// PNG dimensions are the first two big-endian u32 fields of the IHDR chunk,
/// which the standard requires to be first with a declared length of 13.
fn png_dimensions(bytes: &[u8]) -> Result<Dimensions, CodecError> {
    if bytes.len() < 24 {
        return Err(CodecError::TruncatedHeader("PNG"));
    }
    if &bytes[..8] != PNG_SIGNATURE {
        return Err(CodecError::BadPngSignature);
    }
    let length = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if length != 13 || &bytes[12..16] != b"IHDR" {
        return Err(CodecError::BadIhdrChunk);
    }
    Ok(Dimensions {
        width: u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        height: u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
    })
}

/// Start-of-frame markers that carry dimensions. C4 (DHT), C8 (JPG), and
/// CC (DAC) look like SOF markers but are not.
fn is_sof_marker(marker: u8) -> bool {
    matches!(
        marker,
        0xC0 | 0xC1 | 0xC2 | 0xC3 | 0xC5 | 0xC6 | 0xC7 | 0xC9 | 0xCA | 0xCB | 0xCD | 0xCE | 0xCF
    )
}

/// Walk JPEG marker segments, skipping non-frame segments by their declared
/// length, until the first SOF marker yields height then width.
fn jpeg_dimensions(bytes: &[u8]) -> Result<Dimensions, CodecError> {
    if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(CodecError::BadJpegSoi);
    }
    let mut pos = 2;
    while pos < bytes.len() {
        if bytes[pos] != 0xFF {
            pos += 1;
            continue;
        }
        // Fill bytes: any number of 0xFF may pad a marker.
        while pos < bytes.len() && bytes[pos] == 0xFF {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let marker = bytes[pos];
        pos += 1;
        if marker == 0xD8 || marker == 0xD9 {
            continue;
        }
        if pos + 2 > bytes.len() {
            break;
        }
        let seg_len = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        if is_sof_marker(marker) {
            // Segment layout: length(2) precision(1) height(2) width(2)
            if pos + 7 > bytes.len() {
                break;
            }
            let height = u16::from_be_bytes([bytes[pos + 3], bytes[pos + 4]]) as u32;
            let width = u16::from_be_bytes([bytes[pos + 5], bytes[pos + 6]]) as u32;
            return Ok(Dimensions { width, height });
        }
        pos += seg_len.max(2);
    }
    Err(CodecError::MissingJpegFrame)
}

// ============================================================================
// TGA origin normalization
// ============================================================================

const TGA_HEADER_LEN: usize = 18;
const TGA_TYPE_TRUECOLOR: u8 = 2;
const TGA_TYPE_RLE_TRUECOLOR: u8 = 10;
const TGA_DESCRIPTOR_TOP_DOWN: u8 = 0x20;

/// Parsed fields of the fixed 18-byte TGA header.
struct TgaHeader {
    id_len: usize,
    cmap_type: u8,
    image_type: u8,
    cmap_length: usize,
    cmap_entry_bits: u8,
    width: u32,
    height: u32,
    bpp: u8,
    descriptor: u8,
}

impl TgaHeader {
    fn parse(bytes: &[u8]) -> Result<TgaHeader, CodecError> {
        if bytes.len() < TGA_HEADER_LEN {
            return Err(CodecError::TruncatedHeader("TGA"));
        }
        Ok(TgaHeader {
            id_len: bytes[0] as usize,
            cmap_type: bytes[1],
            image_type: bytes[2],
            cmap_length: u16::from_le_bytes([bytes[5], bytes[6]]) as usize,
            cmap_entry_bits: bytes[7],
            width: u16::from_le_bytes([bytes[12], bytes[13]]) as u32,
            height: u16::from_le_bytes([bytes[14], bytes[15]]) as u32,
            bpp: bytes[16],
            descriptor: bytes[17],
        })
    }

    fn is_top_down(&self) -> bool {
        self.descriptor & TGA_DESCRIPTOR_TOP_DOWN != 0
    }

    /// Byte length of the color map block between the id field and pixel data.
    fn cmap_bytes(&self) -> Result<usize, CodecError> {
        match self.cmap_type {
            0 => Ok(0),
            1 => Ok(self.cmap_length * ((self.cmap_entry_bits as usize + 7) / 8)),
            other => Err(CodecError::UnsupportedTgaColorMap(other)),
        }
    }
}

/// Decode TGA pixel data into a flat buffer of exactly
/// `pixel_count * pixel_size` bytes. Returns the decoded pixels and the
/// number of encoded bytes consumed, so callers can preserve any trailer.
fn decode_tga_pixels(
    image_type: u8,
    encoded: &[u8],
    pixel_size: usize,
    pixel_count: usize,
) -> Result<(Vec<u8>, usize), CodecError> {
    let target = pixel_count * pixel_size;

    if image_type == TGA_TYPE_TRUECOLOR {
        if encoded.len() < target {
            return Err(CodecError::TruncatedTgaPixels);
        }
        return Ok((encoded[..target].to_vec(), target));
    }

    if image_type == TGA_TYPE_RLE_TRUECOLOR {
        let mut out = Vec::with_capacity(target);
        let mut pos = 0;
        while out.len() < target {
            let Some(&packet) = encoded.get(pos) else {
                return Err(CodecError::TruncatedTgaPixels);
            };
            pos += 1;
            let count = (packet as usize & 0x7F) + 1;
            if packet & 0x80 != 0 {
                // Run packet: one pixel value, repeated `count` times.
                let end = pos + pixel_size;
                if end > encoded.len() {
                    return Err(CodecError::RlePacketOverrun);
                }
                for _ in 0..count {
                    out.extend_from_slice(&encoded[pos..end]);
                }
                pos = end;
            } else {
                // Literal packet: `count` raw pixels.
                let end = pos + count * pixel_size;
                if end > encoded.len() {
                    return Err(CodecError::RlePacketOverrun);
                }
                out.extend_from_slice(&encoded[pos..end]);
                pos = end;
            }
        }
        // A final run packet may overshoot the row grid.
        if out.len() != target {
            return Err(CodecError::PixelCountMismatch);
        }
        return Ok((out, pos));
    }

    Err(CodecError::UnsupportedTgaImageType(image_type))
}

/// Rewrite a top-left-origin TGA file as bottom-left origin.
///
/// No-op (the file is left byte-identical) when the origin bit already says
/// bottom-left. Otherwise the pixel data is decoded (raw or RLE), scan lines
/// are reversed, and the file is rewritten as uncompressed true-color
/// (image type 2) with the origin bit cleared. The id field, color map, and
/// any bytes trailing the pixel data are preserved verbatim.
///
/// Only true-color images (types 2 and 10) at 24 or 32 bits per pixel are
/// supported; anything else is a [`CodecError`].
pub fn normalize_origin(path: &Path) -> Result<(), CodecError> {
    let raw = std::fs::read(path)?;
    let header = TgaHeader::parse(&raw)?;

    if header.width == 0 || header.height == 0 {
        return Err(CodecError::BadTgaDimensions(header.width, header.height));
    }
    if header.bpp != 24 && header.bpp != 32 {
        return Err(CodecError::UnsupportedTgaDepth(header.bpp));
    }

    if !header.is_top_down() {
        return Ok(());
    }

    let pixel_start = TGA_HEADER_LEN + header.id_len + header.cmap_bytes()?;
    if pixel_start > raw.len() {
        return Err(CodecError::TgaHeaderOverrun);
    }

    let pixel_size = header.bpp as usize / 8;
    let pixel_count = header.width as usize * header.height as usize;
    let encoded = &raw[pixel_start..];
    let (pixels, consumed) = decode_tga_pixels(header.image_type, encoded, pixel_size, pixel_count)?;
    let trailer = &encoded[consumed..];

    let row_bytes = header.width as usize * pixel_size;
    let mut out = Vec::with_capacity(raw.len());
    out.extend_from_slice(&raw[..pixel_start]);
    out[2] = TGA_TYPE_TRUECOLOR;
    out[17] = header.descriptor & !TGA_DESCRIPTOR_TOP_DOWN;
    for row in pixels.chunks_exact(row_bytes).rev() {
        out.extend_from_slice(row);
    }
    out.extend_from_slice(trailer);

    std::fs::write(path, &out)?;
    tracing::debug!(path = %path.display(), "normalized TGA origin to bottom-left");
    Ok(())
}
