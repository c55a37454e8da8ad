//! Visible signature appearance.
//!
//! An optional image and up to two text blocks are composed into one raster,
//! which is then zoomed, rotated, encoded, and positioned on the page.

mod merge;
mod position;
pub mod raster;
mod text;

use std::borrow::Cow;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use image::{ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::placement::{PagePlacement, PageRange};
use crate::{Error, Result};

pub use position::{PageGeometry, Placement};
pub use raster::{EncodedFormat, SignatureImage, DEFAULT_DPI};
pub use text::substitute_template;

/// Where the text goes relative to the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextPosition {
    #[default]
    Left,
    Right,
    Top,
    Bottom,
    /// Text drawn over the image, both centered.
    Foreground,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HorizontalAlignment {
    #[default]
    None,
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerticalAlignment {
    #[default]
    None,
    Top,
    Middle,
    Bottom,
}

/// Alignment of the lines inside a text block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextAlignment {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    /// Counters the page's own `/Rotate`, so the appearance reads upright.
    Automatic,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Clockwise angle in degrees, one of 0, 90, 180 or 270.
    pub fn resolve(self, page_rotation: i64) -> Result<u16> {
        let angle = match self {
            Rotation::None => 0,
            Rotation::Automatic => (360 - page_rotation.rem_euclid(360)) % 360,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        };
        if angle % 90 != 0 {
            return Err(Error::UnsupportedAppearance(format!(
                "page rotation {page_rotation} is not a multiple of 90 degrees"
            )));
        }
        Ok(angle as u16)
    }
}

/// One block of text, rendered with its own font and colors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextBlock {
    /// Template, see [`substitute_template`]. Lines are split on `\n`.
    pub text: String,
    /// TrueType font data.
    pub font: Option<Vec<u8>>,
    /// In points.
    pub font_size: f32,
    /// RGBA.
    pub color: [u8; 4],
    /// RGBA.
    pub background: [u8; 4],
    /// In points, around the text.
    pub padding: f32,
    pub alignment: TextAlignment,
}

impl Default for TextBlock {
    fn default() -> Self {
        Self {
            text: String::new(),
            font: None,
            font_size: 12.0,
            color: [0, 0, 0, 255],
            background: [255, 255, 255, 255],
            padding: 5.0,
            alignment: TextAlignment::Left,
        }
    }
}

/// A visible signature or a stamp, as configured by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualElement {
    /// PNG or JPEG bytes.
    pub image: Option<Vec<u8>>,
    /// File name of the image inside [`CompositorConfig::image_dir`], used when
    /// `image` is not given.
    pub image_name: Option<String>,
    pub left_text: Option<TextBlock>,
    pub right_text: Option<TextBlock>,
    pub text_position: TextPosition,
    /// How text and image line up when placed side by side.
    pub text_vertical_alignment: VerticalAlignment,
    pub rotation: Rotation,
    pub horizontal_alignment: HorizontalAlignment,
    pub vertical_alignment: VerticalAlignment,
    /// In points. Negative values are measured from the right edge.
    pub x: f32,
    /// In points, from the top. Negative values are measured from the bottom.
    pub y: f32,
    /// In points, 0 derives it from the height and the raster's aspect ratio.
    pub width: f32,
    /// In points, 0 derives it from the width and the raster's aspect ratio.
    pub height: f32,
    /// Percentage.
    pub zoom: u32,
    /// Resolution of rendered text, 0 means [`DEFAULT_DPI`].
    pub dpi: u32,
    /// chrono format of `%DateTimeWithTimeZone%`.
    pub date_format: String,
    /// Alpha of the white background behind merged text blocks.
    pub background_opacity: u8,
    /// 1-based, negative counts from the last page.
    pub page: i32,
    pub placement: PagePlacement,
    pub page_range: Option<PageRange>,
}

impl Default for VisualElement {
    fn default() -> Self {
        Self {
            image: None,
            image_name: None,
            left_text: None,
            right_text: None,
            text_position: TextPosition::Left,
            text_vertical_alignment: VerticalAlignment::Middle,
            rotation: Rotation::None,
            horizontal_alignment: HorizontalAlignment::None,
            vertical_alignment: VerticalAlignment::None,
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            zoom: 100,
            dpi: DEFAULT_DPI,
            date_format: "%d.%m.%Y %H:%M %z".into(),
            background_opacity: 255,
            page: 1,
            placement: PagePlacement::SinglePage,
            page_range: None,
        }
    }
}

/// Settings shared by every element a compositor draws.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Where [`VisualElement::image_name`] is looked up.
    pub image_dir: Option<PathBuf>,
}

/// What the templates may refer to.
#[derive(Debug, Clone, Default)]
pub struct SignerDetails {
    /// Common name of the signing certificate.
    pub common_name: Option<String>,
    pub signing_time: Option<DateTime<Utc>>,
}

/// A composed appearance, ready to be embedded.
#[derive(Debug, Clone)]
pub struct SignatureImageAndPosition {
    pub image: SignatureImage,
    pub placement: Placement,
}

#[derive(Debug, Clone, Default)]
pub struct VisibleSignatureCompositor {
    config: CompositorConfig,
}

impl VisibleSignatureCompositor {
    pub fn new(config: CompositorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }

    /// Draws `element` for a page of the given geometry.
    pub fn compose(
        &self,
        element: &VisualElement,
        signer: &SignerDetails,
        page: &PageGeometry,
    ) -> Result<SignatureImageAndPosition> {
        if element.zoom == 0 {
            return Err(Error::UnsupportedAppearance(
                "zoom must be a positive percentage".into(),
            ));
        }
        if element.text_vertical_alignment == VerticalAlignment::None {
            return Err(Error::UnsupportedAppearance(
                "text vertical alignment must be top, middle or bottom".into(),
            ));
        }
        let angle = element.rotation.resolve(page.rotation)?;
        let target_dpi = raster::effective_dpi(element.dpi);

        let image = self.load_image(element)?;
        let text = compose_text(element, signer, target_dpi)?;
        let (composed, dpi) = match (image, text) {
            (None, None) => {
                return Err(Error::UnsupportedAppearance(
                    "neither an image nor a text to draw".into(),
                ))
            }
            (Some((image, image_dpi)), None) => (image, image_dpi),
            (None, Some(text)) => (text, target_dpi),
            (Some((image, image_dpi)), Some(text)) => {
                let image = merge::scale_to_dpi(image, image_dpi, target_dpi);
                let background = element
                    .left_text
                    .as_ref()
                    .map_or([255; 4], |t| t.background);
                let merged = merge::combine(
                    image,
                    text,
                    element.text_position,
                    element.text_vertical_alignment,
                    Rgba(background),
                )?;
                (merged, target_dpi)
            }
        };

        let zoomed = merge::zoom(composed, element.zoom);
        let rotated = merge::rotate(zoomed, angle);
        let image = SignatureImage::encode(rotated, dpi)?;
        let placement = position::place(element, page, &image, angle)?;
        log::debug!(
            "appearance of {}x{} px at {dpi} dpi placed at {placement:?}",
            image.raster.width(),
            image.raster.height()
        );
        Ok(SignatureImageAndPosition { image, placement })
    }

    /// Decodes the element's image and reads its resolution.
    fn load_image(&self, element: &VisualElement) -> Result<Option<(RgbaImage, u32)>> {
        let bytes = match (&element.image, &element.image_name) {
            (Some(bytes), _) => Cow::Borrowed(bytes.as_slice()),
            (None, Some(name)) => {
                let dir = self.config.image_dir.as_ref().ok_or_else(|| {
                    Error::UnsupportedAppearance(format!(
                        "image \"{name}\" is named but no image directory is configured"
                    ))
                })?;
                let path = dir.join(name);
                Cow::Owned(std::fs::read(&path).map_err(|e| {
                    Error::UnsupportedAppearance(format!("can not read {}: {e}", path.display()))
                })?)
            }
            (None, None) => return Ok(None),
        };

        let format = image::guess_format(&bytes)?;
        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            return Err(Error::UnsupportedAppearance(format!(
                "{format:?} images are not supported, only PNG and JPEG"
            )));
        }
        let decoded = image::load_from_memory_with_format(&bytes, format)?.to_rgba8();
        Ok(Some((decoded, raster::read_dpi(&bytes))))
    }
}

/// Renders the left text block, with the right one merged next to it.
fn compose_text(
    element: &VisualElement,
    signer: &SignerDetails,
    dpi: u32,
) -> Result<Option<RgbaImage>> {
    let Some(left) = element.left_text.as_ref().filter(|t| !t.text.is_empty()) else {
        return Ok(None);
    };
    let right = element.right_text.as_ref().filter(|t| !t.text.is_empty());

    let merged_background = Rgba([255, 255, 255, element.background_opacity]);
    let foreground = element.text_position == TextPosition::Foreground;
    let background_of = |block: &TextBlock| {
        if !foreground {
            Rgba(block.background)
        } else if right.is_some() {
            // Fully transparent when the blocks get merged, the merge paints
            // the background once.
            Rgba([255, 255, 255, 0])
        } else {
            merged_background
        }
    };

    let left_text = substitute_template(&left.text, signer, &element.date_format)?;
    let mut raster = text::render(&left_text, left, background_of(left), dpi)?;
    if let Some(right) = right {
        let right_text = substitute_template(&right.text, signer, &element.date_format)?;
        let mut right_raster = text::render(&right_text, right, background_of(right), dpi)?;
        if !foreground {
            // Each block keeps its own background down to the common height.
            let height = raster.height().max(right_raster.height());
            let alignment = element.text_vertical_alignment;
            raster = merge::extend_to_height(raster, height, background_of(left), alignment)?;
            right_raster =
                merge::extend_to_height(right_raster, height, background_of(right), alignment)?;
        }
        raster = merge::on_right(
            raster,
            right_raster,
            merged_background,
            element.text_vertical_alignment,
        )?;
    }
    Ok(Some(raster))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_font;

    fn letter() -> PageGeometry {
        PageGeometry {
            width: 612.0,
            height: 792.0,
            ..Default::default()
        }
    }

    fn png_of(width: u32, height: u32, alpha: u8) -> Vec<u8> {
        let raster = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, alpha]));
        SignatureImage::encode(raster, 72).unwrap().encoded
    }

    #[test]
    fn image_only_keeps_its_resolution() {
        let element = VisualElement {
            image: Some(png_of(144, 72, 128)),
            ..Default::default()
        };
        let composed = VisibleSignatureCompositor::default()
            .compose(&element, &SignerDetails::default(), &letter())
            .unwrap();
        assert_eq!(composed.image.dpi, 72);
        assert_eq!(composed.image.format, EncodedFormat::Png);
        assert_eq!(composed.placement.width, 144.0);
        assert_eq!(composed.placement.height, 72.0);
    }

    #[test]
    fn opaque_images_become_jpeg() {
        let element = VisualElement {
            image: Some(png_of(50, 40, 255)),
            rotation: Rotation::Rotate90,
            ..Default::default()
        };
        let composed = VisibleSignatureCompositor::default()
            .compose(&element, &SignerDetails::default(), &letter())
            .unwrap();
        assert_eq!(composed.image.format, EncodedFormat::Jpeg);
        assert_eq!(composed.image.raster.dimensions(), (40, 50));
        assert_eq!(composed.placement.rotation, 90);
    }

    #[test]
    fn zoom_scales_the_raster() {
        let element = VisualElement {
            image: Some(png_of(100, 50, 255)),
            zoom: 50,
            ..Default::default()
        };
        let composed = VisibleSignatureCompositor::default()
            .compose(&element, &SignerDetails::default(), &letter())
            .unwrap();
        assert_eq!(composed.image.raster.dimensions(), (50, 25));
    }

    #[test]
    fn text_next_to_image() {
        let font = test_font();
        let element = VisualElement {
            image: Some(png_of(60, 60, 255)),
            left_text: Some(TextBlock {
                text: "Signed by %CN_1%".into(),
                font: Some(font),
                ..Default::default()
            }),
            text_position: TextPosition::Left,
            dpi: 72,
            ..Default::default()
        };
        let signer = SignerDetails {
            common_name: Some("Jane Q Public".into()),
            signing_time: None,
        };
        let composed = VisibleSignatureCompositor::default()
            .compose(&element, &signer, &letter())
            .unwrap();
        let (width, height) = composed.image.raster.dimensions();
        assert!(width > 60);
        assert!(height >= 60);
        assert_eq!(composed.image.dpi, 72);
    }

    #[test]
    fn text_blocks_keep_their_own_background() {
        const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
        const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
        let block = |text: &str, background: Rgba<u8>| TextBlock {
            text: text.into(),
            font: Some(test_font()),
            background: background.0,
            ..Default::default()
        };
        let element = VisualElement {
            left_text: Some(block("Left", RED)),
            right_text: Some(block("Right\nand below", BLUE)),
            dpi: 72,
            ..Default::default()
        };

        let left_width = text::render("Left", &block("Left", RED), RED, 72)
            .unwrap()
            .width();
        let raster = compose_text(&element, &SignerDetails::default(), 72)
            .unwrap()
            .unwrap();
        let (width, height) = raster.dimensions();
        assert!(width > left_width);

        assert_eq!(*raster.get_pixel(1, 1), RED);
        // The shorter left block is filled with its own color.
        assert_eq!(*raster.get_pixel(1, height - 1), RED);
        assert_eq!(*raster.get_pixel(left_width + 1, 1), BLUE);
        assert_eq!(*raster.get_pixel(width - 1, height - 1), BLUE);
    }

    #[test]
    fn named_images_need_a_directory() {
        let element = VisualElement {
            image_name: Some("logo.png".into()),
            ..Default::default()
        };
        let err = VisibleSignatureCompositor::default()
            .compose(&element, &SignerDetails::default(), &letter())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAppearance(_)));
        assert!(!err.is_fatal());

        let dir = std::env::temp_dir().join(format!("ltv_pdf_images_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("logo.png"), png_of(20, 10, 255)).unwrap();
        let compositor = VisibleSignatureCompositor::new(CompositorConfig {
            image_dir: Some(dir.clone()),
        });
        let composed = compositor
            .compose(&element, &SignerDetails::default(), &letter())
            .unwrap();
        assert_eq!(composed.image.raster.dimensions(), (20, 10));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn bad_configurations() {
        let compositor = VisibleSignatureCompositor::default();
        let signer = SignerDetails::default();

        let nothing = VisualElement::default();
        assert!(matches!(
            compositor.compose(&nothing, &signer, &letter()),
            Err(Error::UnsupportedAppearance(_))
        ));

        let no_font = VisualElement {
            left_text: Some(TextBlock {
                text: "hello".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            compositor.compose(&no_font, &signer, &letter()),
            Err(Error::UnsupportedAppearance(_))
        ));

        let zero_zoom = VisualElement {
            image: Some(png_of(2, 2, 255)),
            zoom: 0,
            ..Default::default()
        };
        assert!(matches!(
            compositor.compose(&zero_zoom, &signer, &letter()),
            Err(Error::UnsupportedAppearance(_))
        ));

        let odd_page = PageGeometry {
            rotation: 45,
            ..letter()
        };
        let automatic = VisualElement {
            image: Some(png_of(2, 2, 255)),
            rotation: Rotation::Automatic,
            ..Default::default()
        };
        assert!(matches!(
            compositor.compose(&automatic, &signer, &odd_page),
            Err(Error::UnsupportedAppearance(_))
        ));
    }

    #[test]
    fn automatic_rotation_counters_the_page() {
        assert_eq!(Rotation::Automatic.resolve(90).unwrap(), 270);
        assert_eq!(Rotation::Automatic.resolve(0).unwrap(), 0);
        assert_eq!(Rotation::Automatic.resolve(-90).unwrap(), 90);
        assert_eq!(Rotation::Automatic.resolve(450).unwrap(), 270);
        assert_eq!(Rotation::Rotate180.resolve(90).unwrap(), 180);
    }

    #[test]
    fn configuration_from_json() {
        let element: VisualElement = serde_json::from_str(
            r#"{
                "text_position": "Top",
                "rotation": "Automatic",
                "horizontal_alignment": "Right",
                "x": -20.0,
                "page": -1,
                "placement": "Range",
                "page_range": { "exclude_last": true, "exclude_last_count": 1 }
            }"#,
        )
        .unwrap();
        assert_eq!(element.text_position, TextPosition::Top);
        assert_eq!(element.rotation, Rotation::Automatic);
        assert_eq!(element.zoom, 100);
        assert_eq!(element.dpi, DEFAULT_DPI);
        assert_eq!(element.page_range.unwrap().exclude_last_count, 1);
    }
}
