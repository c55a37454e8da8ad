//! Combining rasters side by side, stacked, or on top of one another.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use super::{TextPosition, VerticalAlignment};
use crate::{Error, Result};

/// `left` and `right` next to each other on a `background` filled canvas.
pub(crate) fn on_right(
    left: RgbaImage,
    right: RgbaImage,
    background: Rgba<u8>,
    alignment: VerticalAlignment,
) -> Result<RgbaImage> {
    let width = left.width() + right.width();
    let height = left.height().max(right.height());
    let offset = |h: u32| -> Result<i64> {
        Ok(match alignment {
            VerticalAlignment::Top => 0,
            VerticalAlignment::Middle => ((height - h) / 2) as i64,
            VerticalAlignment::Bottom => (height - h) as i64,
            VerticalAlignment::None => {
                return Err(Error::UnsupportedAppearance(
                    "side by side rasters need a vertical alignment".into(),
                ))
            }
        })
    };

    let mut canvas = RgbaImage::from_pixel(width, height, background);
    imageops::overlay(&mut canvas, &left, 0, offset(left.height())?);
    imageops::overlay(&mut canvas, &right, left.width() as i64, offset(right.height())?);
    Ok(canvas)
}

/// Grows `raster` to `height` rows, filling the new rows with `background`.
pub(crate) fn extend_to_height(
    raster: RgbaImage,
    height: u32,
    background: Rgba<u8>,
    alignment: VerticalAlignment,
) -> Result<RgbaImage> {
    if raster.height() >= height {
        return Ok(raster);
    }
    let top = match alignment {
        VerticalAlignment::Top => 0,
        VerticalAlignment::Middle => (height - raster.height()) / 2,
        VerticalAlignment::Bottom => height - raster.height(),
        VerticalAlignment::None => {
            return Err(Error::UnsupportedAppearance(
                "side by side rasters need a vertical alignment".into(),
            ))
        }
    };
    let mut canvas = RgbaImage::from_pixel(raster.width(), height, background);
    imageops::overlay(&mut canvas, &raster, 0, top as i64);
    Ok(canvas)
}

/// `top` stacked over `bottom`, both centered horizontally.
pub(crate) fn on_top(bottom: RgbaImage, top: RgbaImage, background: Rgba<u8>) -> RgbaImage {
    let width = bottom.width().max(top.width());
    let height = bottom.height() + top.height();

    let mut canvas = RgbaImage::from_pixel(width, height, background);
    imageops::overlay(&mut canvas, &top, ((width - top.width()) / 2) as i64, 0);
    imageops::overlay(
        &mut canvas,
        &bottom,
        ((width - bottom.width()) / 2) as i64,
        top.height() as i64,
    );
    canvas
}

/// `front` drawn over `back`, both centered on a transparent canvas.
pub(crate) fn on_background(front: RgbaImage, back: RgbaImage) -> RgbaImage {
    let width = front.width().max(back.width());
    let height = front.height().max(back.height());

    let mut canvas = RgbaImage::new(width, height);
    for layer in [&back, &front] {
        imageops::overlay(
            &mut canvas,
            layer,
            ((width - layer.width()) / 2) as i64,
            ((height - layer.height()) / 2) as i64,
        );
    }
    canvas
}

/// Puts the rendered text where `position` says, relative to the image.
pub(crate) fn combine(
    image: RgbaImage,
    text: RgbaImage,
    position: TextPosition,
    alignment: VerticalAlignment,
    background: Rgba<u8>,
) -> Result<RgbaImage> {
    Ok(match position {
        TextPosition::Left => on_right(text, image, background, alignment)?,
        TextPosition::Right => on_right(image, text, background, alignment)?,
        TextPosition::Top => on_top(image, text, background),
        TextPosition::Bottom => on_top(text, image, background),
        TextPosition::Foreground => on_background(text, image),
    })
}

fn resized(raster: RgbaImage, width: u32, height: u32) -> RgbaImage {
    if (width, height) == raster.dimensions() {
        return raster;
    }
    imageops::resize(&raster, width.max(1), height.max(1), FilterType::CatmullRom)
}

fn scaled(raster: RgbaImage, factor: f64) -> RgbaImage {
    let width = (raster.width() as f64 * factor).round() as u32;
    let height = (raster.height() as f64 * factor).round() as u32;
    resized(raster, width, height)
}

/// Resamples a raster so it keeps its physical size at another resolution.
pub(crate) fn scale_to_dpi(raster: RgbaImage, from: u32, to: u32) -> RgbaImage {
    if from == to || from == 0 {
        return raster;
    }
    scaled(raster, to as f64 / from as f64)
}

pub(crate) fn zoom(raster: RgbaImage, percent: u32) -> RgbaImage {
    scaled(raster, percent as f64 / 100.0)
}

/// Turns a raster clockwise by a multiple of 90 degrees.
pub(crate) fn rotate(raster: RgbaImage, angle: u16) -> RgbaImage {
    match angle {
        90 => imageops::rotate90(&raster),
        180 => imageops::rotate180(&raster),
        270 => imageops::rotate270(&raster),
        _ => raster,
    }
}
