use super::{HorizontalAlignment, SignatureImage, VerticalAlignment, VisualElement};
use crate::{Error, Result};

/// The page an appearance is placed on.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PageGeometry {
    /// Lower left corner of the media box.
    pub origin_x: f32,
    pub origin_y: f32,
    pub width: f32,
    pub height: f32,
    /// The page's `/Rotate`.
    pub rotation: i64,
    /// Width and height of the `/CropBox`, when the page has one. Negative
    /// offsets count from its edges.
    pub crop_size: Option<[f32; 2]>,
}

impl PageGeometry {
    /// Reads a `/MediaBox` array, whose corners may come in any order.
    pub fn from_media_box(media_box: [f32; 4], rotation: i64) -> Self {
        let [x1, y1, x2, y2] = media_box;
        Self {
            origin_x: x1.min(x2),
            origin_y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
            rotation,
            crop_size: None,
        }
    }

    pub fn with_crop_box(self, crop_box: [f32; 4]) -> Self {
        let [x1, y1, x2, y2] = crop_box;
        Self {
            crop_size: Some([(x2 - x1).abs(), (y2 - y1).abs()]),
            ..self
        }
    }
}

/// Position and displayed size of an appearance, in points, measured from the
/// top left corner of the media box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Clockwise rotation applied to the raster, in degrees.
    pub rotation: u16,
}

impl Placement {
    /// `[llx lly urx ury]` in PDF user space.
    pub fn to_pdf_rect(&self, page: &PageGeometry) -> [f32; 4] {
        let llx = page.origin_x + self.x;
        let lly = page.origin_y + page.height - self.y - self.height;
        [llx, lly, llx + self.width, lly + self.height]
    }
}

/// Displayed size. Configured dimensions describe the unrotated appearance,
/// so they swap when it is turned a quarter.
fn displayed_size(element: &VisualElement, image: &SignatureImage, angle: u16) -> (f32, f32) {
    let natural_width = image.width_points();
    let natural_height = image.height_points();
    let (width, height) = if angle == 90 || angle == 270 {
        (element.height, element.width)
    } else {
        (element.width, element.height)
    };
    match (width > 0.0, height > 0.0) {
        (true, true) => (width, height),
        (true, false) => (width, width * natural_height / natural_width),
        (false, true) => (height * natural_width / natural_height, height),
        (false, false) => (natural_width, natural_height),
    }
}

/// Negative offsets count from the right and bottom edges of the visible
/// page area.
fn absolute_offsets(element: &VisualElement, page: &PageGeometry) -> (f32, f32) {
    let [width, height] = page.crop_size.unwrap_or([page.width, page.height]);
    let x = if element.x < 0.0 {
        width + element.x
    } else {
        element.x
    };
    let y = if element.y < 0.0 {
        height + element.y
    } else {
        element.y
    };
    (x, y)
}

/// Places an appearance rotated by `angle`. Alignments are relative to the
/// unrotated appearance, so at 90 and 270 degrees the vertical alignment moves
/// it along the page's x axis and the horizontal one along its y axis.
pub(crate) fn place(
    element: &VisualElement,
    page: &PageGeometry,
    image: &SignatureImage,
    angle: u16,
) -> Result<Placement> {
    let (w, h) = displayed_size(element, image, angle);
    let (x, y) = absolute_offsets(element, page);
    let free_x = page.width - w;
    let free_y = page.height - h;

    use HorizontalAlignment as Ha;
    use VerticalAlignment as Va;
    let (left, top) = match angle {
        0 => (
            match element.horizontal_alignment {
                Ha::None | Ha::Left => x,
                Ha::Center => free_x / 2.0,
                Ha::Right => free_x - x,
            },
            match element.vertical_alignment {
                Va::None | Va::Top => y,
                Va::Middle => free_y / 2.0,
                Va::Bottom => free_y - y,
            },
        ),
        90 => (
            match element.vertical_alignment {
                Va::None | Va::Top => free_x - y,
                Va::Middle => free_x / 2.0,
                Va::Bottom => y,
            },
            match element.horizontal_alignment {
                Ha::None | Ha::Left => x,
                Ha::Center => free_y / 2.0,
                Ha::Right => free_y - x,
            },
        ),
        180 => (
            match element.horizontal_alignment {
                Ha::None | Ha::Left => free_x - x,
                Ha::Center => free_x / 2.0,
                Ha::Right => x,
            },
            match element.vertical_alignment {
                Va::None | Va::Top => free_y - y,
                Va::Middle => free_y / 2.0,
                Va::Bottom => y,
            },
        ),
        270 => (
            match element.vertical_alignment {
                Va::None | Va::Top => y,
                Va::Middle => free_x / 2.0,
                Va::Bottom => free_x - y,
            },
            match element.horizontal_alignment {
                Ha::None | Ha::Left => free_y - x,
                Ha::Center => free_y / 2.0,
                Ha::Right => x,
            },
        ),
        other => {
            return Err(Error::UnsupportedAppearance(format!(
                "rotation of {other} degrees"
            )))
        }
    };

    Ok(Placement {
        x: left,
        y: top,
        width: w,
        height: h,
        rotation: angle,
    })
}
