//! Encoding of composed appearances, and the resolution stored in PNG and
//! JPEG headers.

use image::codecs::jpeg::{JpegEncoder, PixelDensity};
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, Rgb, RgbImage, RgbaImage};

use crate::Result;

/// Resolution assumed when none is configured or stored in the image.
pub const DEFAULT_DPI: u32 = 300;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
/// Signature plus the IHDR chunk, which always comes first.
const PNG_IHDR_END: usize = 33;
const METERS_PER_INCH: f64 = 0.0254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFormat {
    Png,
    Jpeg,
}

/// A composed appearance, both as pixels and as an encoded file.
#[derive(Debug, Clone)]
pub struct SignatureImage {
    pub raster: RgbaImage,
    pub encoded: Vec<u8>,
    pub format: EncodedFormat,
    pub dpi: u32,
}

impl SignatureImage {
    /// PNG if any pixel is not fully opaque, JPEG otherwise. The resolution
    /// is written into the file header.
    pub fn encode(raster: RgbaImage, dpi: u32) -> Result<Self> {
        let dpi = effective_dpi(dpi);
        let (format, encoded) = if has_transparency(&raster) {
            (EncodedFormat::Png, encode_png(&raster, dpi)?)
        } else {
            (EncodedFormat::Jpeg, encode_jpeg(&raster, dpi)?)
        };
        Ok(Self {
            raster,
            encoded,
            format,
            dpi,
        })
    }

    /// Natural width, in points.
    pub fn width_points(&self) -> f32 {
        pixels_to_points(self.raster.width(), self.dpi)
    }

    /// Natural height, in points.
    pub fn height_points(&self) -> f32 {
        pixels_to_points(self.raster.height(), self.dpi)
    }
}

pub(crate) fn effective_dpi(dpi: u32) -> u32 {
    if dpi == 0 {
        DEFAULT_DPI
    } else {
        dpi
    }
}

pub fn pixels_to_points(pixels: u32, dpi: u32) -> f32 {
    pixels as f32 * 72.0 / effective_dpi(dpi) as f32
}

pub fn has_transparency(raster: &RgbaImage) -> bool {
    raster.pixels().any(|p| p[3] < 255)
}

fn encode_jpeg(raster: &RgbaImage, dpi: u32) -> Result<Vec<u8>> {
    let rgb = RgbImage::from_fn(raster.width(), raster.height(), |x, y| {
        let p = raster.get_pixel(x, y);
        Rgb([p[0], p[1], p[2]])
    });
    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, 100);
    encoder.set_pixel_density(PixelDensity::dpi(dpi.min(u16::MAX as u32) as u16));
    encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
    Ok(encoded)
}

fn encode_png(raster: &RgbaImage, dpi: u32) -> Result<Vec<u8>> {
    let mut encoded = Vec::new();
    PngEncoder::new(&mut encoded).write_image(
        raster.as_raw(),
        raster.width(),
        raster.height(),
        ColorType::Rgba8,
    )?;

    let ppm = (dpi as f64 / METERS_PER_INCH).round() as u32;
    let mut data = Vec::with_capacity(9);
    data.extend_from_slice(&ppm.to_be_bytes());
    data.extend_from_slice(&ppm.to_be_bytes());
    data.push(1);

    let mut chunk = Vec::with_capacity(21);
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(b"pHYs");
    hasher.update(&data);
    chunk.extend_from_slice(b"pHYs");
    chunk.extend_from_slice(&data);
    chunk.extend_from_slice(&hasher.finalize().to_be_bytes());

    encoded.splice(PNG_IHDR_END..PNG_IHDR_END, chunk);
    Ok(encoded)
}

/// Resolution stored in a PNG `pHYs` chunk or a JPEG JFIF header, or
/// [`DEFAULT_DPI`] when there is none.
pub fn read_dpi(encoded: &[u8]) -> u32 {
    let dpi = if encoded.starts_with(PNG_SIGNATURE) {
        png_dpi(encoded)
    } else if encoded.starts_with(&[0xff, 0xd8]) {
        jpeg_dpi(encoded)
    } else {
        None
    };
    dpi.filter(|&d| d > 0).unwrap_or(DEFAULT_DPI)
}

fn png_dpi(encoded: &[u8]) -> Option<u32> {
    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= encoded.len() {
        let len = u32::from_be_bytes(encoded[pos..pos + 4].try_into().ok()?) as usize;
        let kind = &encoded[pos + 4..pos + 8];
        let data = encoded.get(pos + 8..pos + 8 + len)?;
        match kind {
            b"pHYs" if len == 9 => {
                if data[8] != 1 {
                    return None;
                }
                let ppm = u32::from_be_bytes(data[0..4].try_into().ok()?);
                return Some((ppm as f64 * METERS_PER_INCH).round() as u32);
            }
            b"IDAT" | b"IEND" => return None,
            _ => pos += 12 + len,
        }
    }
    None
}

fn jpeg_dpi(encoded: &[u8]) -> Option<u32> {
    // SOI, then an APP0 segment holding "JFIF\0", version, units and density.
    let app0 = encoded.get(2..18)?;
    if app0[0..2] != [0xff, 0xe0] || &app0[4..9] != b"JFIF\0" {
        return None;
    }
    let units = app0[11];
    let density = u16::from_be_bytes([app0[12], app0[13]]) as f64;
    match units {
        1 => Some(density as u32),
        2 => Some((density * 2.54).round() as u32),
        _ => None,
    }
}
