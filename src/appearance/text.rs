use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use image::{Rgba, RgbaImage};
use rusttype::{point, Font, Scale};

use super::{SignerDetails, TextAlignment, TextBlock};
use crate::{Error, Result};

const DATE_PLACEHOLDER: &str = "%DateTimeWithTimeZone%";

/// Fills in the signer placeholders of a text template.
///
/// The certificate's common name is split on spaces: `%CN_1%` is its first
/// token, `%CN_2%` and `%CN_3%` the next ones or nothing.
/// `%DateTimeWithTimeZone%` is the signing time, or the current time when it
/// is unknown, in `date_format`, a chrono pattern. Without a common name the
/// `%CN_n%` placeholders are left as they are.
pub fn substitute_template(
    template: &str,
    signer: &SignerDetails,
    date_format: &str,
) -> Result<String> {
    let mut text = template.to_owned();

    if let Some(common_name) = signer.common_name.as_deref() {
        let mut names = common_name.split(' ');
        for placeholder in ["%CN_1%", "%CN_2%", "%CN_3%"] {
            text = text.replace(placeholder, names.next().unwrap_or(""));
        }
    }

    if text.contains(DATE_PLACEHOLDER) {
        let time = signer.signing_time.unwrap_or_else(Utc::now);
        if StrftimeItems::new(date_format).any(|item| matches!(item, Item::Error)) {
            return Err(Error::UnsupportedAppearance(format!(
                "invalid date format {date_format:?}"
            )));
        }
        text = text.replace(DATE_PLACEHOLDER, &time.format(date_format).to_string());
    }

    Ok(text)
}

fn line_width(font: &Font, scale: Scale, line: &str) -> f32 {
    font.layout(line, scale, point(0.0, 0.0))
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .fold(0.0, f32::max)
}

fn blend(dst: &mut Rgba<u8>, color: [u8; 4], coverage: f32) {
    let alpha = coverage.clamp(0.0, 1.0) * color[3] as f32 / 255.0;
    for c in 0..3 {
        dst[c] = (color[c] as f32 * alpha + dst[c] as f32 * (1.0 - alpha)).round() as u8;
    }
    dst[3] = (255.0 * alpha + dst[3] as f32 * (1.0 - alpha)).round() as u8;
}

/// Draws `text` with the block's font, size, color and padding on a canvas
/// filled with `background`, at `dpi` pixels per inch.
pub(crate) fn render(
    text: &str,
    block: &TextBlock,
    background: Rgba<u8>,
    dpi: u32,
) -> Result<RgbaImage> {
    let font_data = block
        .font
        .clone()
        .ok_or_else(|| Error::UnsupportedAppearance("text block has no font".into()))?;
    let font = Font::try_from_vec(font_data)
        .ok_or_else(|| Error::UnsupportedAppearance("font data can not be parsed".into()))?;
    if block.font_size <= 0.0 {
        return Err(Error::UnsupportedAppearance(format!(
            "font size {} is not positive",
            block.font_size
        )));
    }

    let pixels_per_point = dpi as f32 / 72.0;
    let scale = Scale::uniform(block.font_size * pixels_per_point);
    let padding = (block.padding.max(0.0) * pixels_per_point).round() as u32;
    let metrics = font.v_metrics(scale);
    let line_height = (metrics.ascent - metrics.descent + metrics.line_gap).ceil();

    let lines: Vec<&str> = text.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let widths: Vec<f32> = lines.iter().map(|l| line_width(&font, scale, l)).collect();
    let text_width = widths.iter().copied().fold(0.0, f32::max).ceil() as u32;
    let text_height = (line_height * lines.len() as f32).ceil() as u32;

    let canvas_width = text_width + 2 * padding;
    let canvas_height = text_height + 2 * padding;
    let mut canvas = RgbaImage::from_pixel(canvas_width, canvas_height, background);

    for (i, (line, width)) in lines.iter().zip(&widths).enumerate() {
        let indent = match block.alignment {
            TextAlignment::Left => 0.0,
            TextAlignment::Center => (text_width as f32 - width) / 2.0,
            TextAlignment::Right => text_width as f32 - width,
        };
        let origin = point(
            padding as f32 + indent,
            padding as f32 + i as f32 * line_height + metrics.ascent,
        );
        for glyph in font.layout(line, scale, origin) {
            let Some(bounds) = glyph.pixel_bounding_box() else {
                continue;
            };
            glyph.draw(|gx, gy, coverage| {
                let x = bounds.min.x + gx as i32;
                let y = bounds.min.y + gy as i32;
                if x >= 0 && y >= 0 && (x as u32) < canvas_width && (y as u32) < canvas_height {
                    blend(canvas.get_pixel_mut(x as u32, y as u32), block.color, coverage);
                }
            });
        }
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_font;
    use chrono::TimeZone;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    fn signer(common_name: &str) -> SignerDetails {
        SignerDetails {
            common_name: Some(common_name.into()),
            signing_time: Some(Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap()),
        }
    }

    fn block(alignment: TextAlignment) -> TextBlock {
        TextBlock {
            font: Some(test_font()),
            alignment,
            ..Default::default()
        }
    }

    /// Leftmost column of the first text row containing ink.
    fn first_ink_column(raster: &RgbaImage, rows: std::ops::Range<u32>) -> Option<u32> {
        (0..raster.width()).find(|&x| rows.clone().any(|y| raster.get_pixel(x, y)[0] < 128))
    }

    #[test]
    fn common_name_tokens() {
        let template = "%CN_1% %CN_2%";
        let format = "%d.%m.%Y";
        assert_eq!(substitute_template(template, &signer("Jane Q Public"), format).unwrap(), "Jane Q");
        assert_eq!(substitute_template(template, &signer("Jane"), format).unwrap(), "Jane ");
        assert_eq!(
            substitute_template("%CN_3%", &signer("Jane Q Public"), format).unwrap(),
            "Public"
        );
        assert_eq!(
            substitute_template(template, &SignerDetails::default(), format).unwrap(),
            template
        );
    }

    #[test]
    fn signing_time() {
        let text = substitute_template(
            "Signed %DateTimeWithTimeZone%",
            &signer("x"),
            "%d.%m.%Y %H:%M %z",
        )
        .unwrap();
        assert_eq!(text, "Signed 09.03.2024 14:05 +0000");

        let err = substitute_template("%DateTimeWithTimeZone%", &signer("x"), "%Q").unwrap_err();
        assert!(matches!(err, Error::UnsupportedAppearance(_)));

        // A bad pattern only matters when it is used.
        assert_eq!(substitute_template("plain", &signer("x"), "%Q").unwrap(), "plain");

        let now = substitute_template("%DateTimeWithTimeZone%", &SignerDetails::default(), "%Y")
            .unwrap();
        assert_eq!(now.len(), 4);
    }

    #[test]
    fn renders_ink_with_padding() {
        let raster = render("Hello", &block(TextAlignment::Left), WHITE, 72).unwrap();
        assert!(raster.width() > 10);
        assert!(raster.height() > 12);
        let column = first_ink_column(&raster, 0..raster.height()).unwrap();
        assert!(column >= 5);
        assert!((0..raster.width()).all(|x| *raster.get_pixel(x, 0) == WHITE));
    }

    #[test]
    fn resolution_scales_the_raster() {
        let low = render("Hello", &block(TextAlignment::Left), WHITE, 72).unwrap();
        let high = render("Hello", &block(TextAlignment::Left), WHITE, 288).unwrap();
        assert!(high.width() > 3 * low.width());
        assert!(high.height() > 3 * low.height());
    }

    #[test]
    fn lines_are_aligned() {
        let text = "i\nWWWWWWWW";
        let left = render(text, &block(TextAlignment::Left), WHITE, 72).unwrap();
        let right = render(text, &block(TextAlignment::Right), WHITE, 72).unwrap();
        assert_eq!(left.dimensions(), right.dimensions());

        let first_line = 5..left.height() / 2;
        let left_column = first_ink_column(&left, first_line.clone()).unwrap();
        let right_column = first_ink_column(&right, first_line).unwrap();
        assert!(right_column > left_column + 50);
    }

    #[test]
    fn unusable_fonts() {
        let mut no_font = block(TextAlignment::Left);
        no_font.font = None;
        assert!(render("x", &no_font, WHITE, 72).is_err());

        let mut garbage = block(TextAlignment::Left);
        garbage.font = Some(b"not a font".to_vec());
        assert!(render("x", &garbage, WHITE, 72).is_err());
    }
}
