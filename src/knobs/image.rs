//! Album-art conversion for knob LCDs.
//!
//! The knob display is a small square LCD taking RGB565 (2 bytes per pixel,
//! little-endian). JPEG responses are resized/re-encoded server-side so the
//! device never decodes more pixels than it shows.

use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, Rgba, RgbaImage};
use std::io::Cursor;

pub struct Rgb565Image {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode any supported image format, resize, and pack as RGB565.
pub fn to_rgb565(data: &[u8], width: u32, height: u32) -> Result<Rgb565Image, image::ImageError> {
    let img = image::load_from_memory(data)?;
    Ok(pack_rgb565(&resize(img, width, height), width, height))
}

/// Decode, resize, and re-encode as JPEG at the given quality.
pub fn to_jpeg(
    data: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, image::ImageError> {
    let img = resize(image::load_from_memory(data)?, width, height);
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    img.write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

fn resize(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() == width && img.height() == height {
        img
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Pack pixels as RGB565 little-endian (the display controller's native
/// order). Alpha is dropped.
fn pack_rgb565(img: &DynamicImage, width: u32, height: u32) -> Rgb565Image {
    let rgba = img.to_rgba8();
    let mut data = Vec::with_capacity((width * height * 2) as usize);
    for pixel in rgba.pixels() {
        let r = (pixel[0] >> 3) as u16;
        let g = (pixel[1] >> 2) as u16;
        let b = (pixel[2] >> 3) as u16;
        let value = (r << 11) | (g << 5) | b;
        data.push((value & 0xff) as u8);
        data.push((value >> 8) as u8);
    }
    Rgb565Image { data, width, height }
}

/// SVG placeholder served when no art is available and the caller wants an
/// image document.
pub fn placeholder_svg(width: u32, height: u32) -> String {
    format!(
        concat!(
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}">"##,
            r##"<rect width="100%" height="100%" fill="#333"/>"##,
            r##"<text x="50%" y="50%" fill="#888" text-anchor="middle" "##,
            r##"dy=".3em" font-family="sans-serif" font-size="24">No Image</text>"##,
            r##"</svg>"##
        ),
        width, height
    )
}

/// Flat dark placeholder for RGB565 callers (the LCD cannot render SVG).
pub fn placeholder_rgb565(width: u32, height: u32) -> Rgb565Image {
    let img = RgbaImage::from_pixel(width, height, Rgba([0x33, 0x33, 0x33, 0xff]));
    pack_rgb565(&DynamicImage::ImageRgba8(img), width, height)
}
