use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detector::model::DetectorError;
use shared::Detection;

const BORDER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BORDER_WIDTH: i32 = 2;
const FONT_SIZE: f32 = 16.0;

pub fn load_font(path: &str) -> Result<FontVec, DetectorError> {
    let data = std::fs::read(path)?;
    FontVec::try_from_vec(data).map_err(|e| DetectorError::Font(e.to_string()))
}

/// Burn detection boxes (and labels, when a font is available) into the
/// image at `original` and save the result at `annotated`. The output format
/// follows the `annotated` extension.
pub fn render(
    original: &Path,
    annotated: &Path,
    detections: &[Detection],
    font: Option<&FontVec>,
) -> Result<(), DetectorError> {
    let mut image = image::open(original)?.to_rgb8();

    for detection in detections {
        if let Some(rect) = clamped_rect(&image, detection) {
            for i in 0..BORDER_WIDTH {
                let inset = Rect::at(rect.left() + i, rect.top() + i).of_size(
                    (rect.width() as i32 - 2 * i).max(1) as u32,
                    (rect.height() as i32 - 2 * i).max(1) as u32,
                );
                draw_hollow_rect_mut(&mut image, inset, BORDER_COLOR);
            }
            if let Some(font) = font {
                let text = format!("{} {:.2}", detection.label, detection.score);
                let text_y = (rect.top() - FONT_SIZE as i32 - 2).max(0);
                draw_text_mut(
                    &mut image,
                    TEXT_COLOR,
                    rect.left(),
                    text_y,
                    PxScale::from(FONT_SIZE),
                    font,
                    &text,
                );
            }
        }
    }

    image.save(annotated)?;
    Ok(())
}

fn clamped_rect(image: &RgbImage, detection: &Detection) -> Option<Rect> {
    let (width, height) = image.dimensions();
    let x1 = detection.bbox.x1().max(0.0).min(width as f64 - 1.0);
    let y1 = detection.bbox.y1().max(0.0).min(height as f64 - 1.0);
    let x2 = detection.bbox.x2().max(0.0).min(width as f64 - 1.0);
    let y2 = detection.bbox.y2().max(0.0).min(height as f64 - 1.0);

    let w = (x2 - x1) as u32;
    let h = (y2 - y1) as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size(w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::BoundingBox;

    fn test_detection(x1: f64, y1: f64, x2: f64, y2: f64) -> Detection {
        Detection {
            label: "person".to_string(),
            score: 0.9,
            bbox: BoundingBox::new(x1, y1, x2, y2),
        }
    }

    #[test]
    fn render_burns_box_into_image() {
        let dir = std::env::temp_dir();
        let original = dir.join(format!("annotate-in-{}.png", uuid::Uuid::new_v4()));
        let annotated = dir.join(format!("annotate-out-{}.png", uuid::Uuid::new_v4()));

        RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]))
            .save(&original)
            .unwrap();

        render(
            &original,
            &annotated,
            &[test_detection(10.0, 10.0, 40.0, 40.0)],
            None,
        )
        .unwrap();

        let out = image::open(&annotated).unwrap().to_rgb8();
        assert_eq!(*out.get_pixel(10, 10), BORDER_COLOR);
        assert_eq!(*out.get_pixel(25, 10), BORDER_COLOR);
        assert_eq!(*out.get_pixel(32, 32), Rgb([0, 0, 0]));
    }

    #[test]
    fn render_skips_degenerate_boxes() {
        let dir = std::env::temp_dir();
        let original = dir.join(format!("annotate-deg-{}.png", uuid::Uuid::new_v4()));
        let annotated = dir.join(format!("annotate-deg-out-{}.png", uuid::Uuid::new_v4()));

        RgbImage::from_pixel(32, 32, Rgb([7, 7, 7]))
            .save(&original)
            .unwrap();

        // Zero-width and fully out-of-frame boxes must not panic.
        render(
            &original,
            &annotated,
            &[
                test_detection(5.0, 5.0, 5.0, 20.0),
                test_detection(-50.0, -50.0, -10.0, -10.0),
            ],
            None,
        )
        .unwrap();

        let out = image::open(&annotated).unwrap().to_rgb8();
        assert_eq!(*out.get_pixel(16, 16), Rgb([7, 7, 7]));
    }
}
