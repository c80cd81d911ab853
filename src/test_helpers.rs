//! Shared builders for tests: minimal valid image bytes.

/// Minimal PNG: signature + IHDR with the given dimensions. Enough for the
/// codec's dimension parser; nothing downstream of tests decodes pixels.
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"\x89PNG\r\n\x1a\n");
    out.extend_from_slice(&13u32.to_be_bytes());
    out.extend_from_slice(b"IHDR");
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&[8, 6, 0, 0, 0]);
    out
}

/// Uncompressed 24bpp true-color TGA with zeroed pixels.
pub(crate) fn tga_bytes(width: u16, height: u16, top_down: bool) -> Vec<u8> {
    let mut out = vec![0u8; 18];
    out[2] = 2;
    out[12..14].copy_from_slice(&width.to_le_bytes());
    out[14..16].copy_from_slice(&height.to_le_bytes());
    out[16] = 24;
    if top_down {
        out[17] = 0x20;
    }
    out.extend(std::iter::repeat(0u8).take(width as usize * height as usize * 3));
    out
}
