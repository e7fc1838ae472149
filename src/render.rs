//! HTML to PNG rasterization
//!
//! Renders the canonical email document to pixels through a
//! wkhtmltoimage-compatible renderer (html on stdin, PNG on stdout), then
//! crops the result to its content bounding box so the chat photo carries no
//! dead whitespace.

use std::io::Cursor;
use std::process::Stdio;

use image::{ImageFormat, Rgb, RgbImage};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::{AppError, AppResult};

/// Render viewport, fixed
pub const VIEWPORT_WIDTH: u32 = 1200;
pub const VIEWPORT_HEIGHT: u32 = 1000;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Render an HTML document to cropped PNG bytes
///
/// # Errors
///
/// Returns `Render` when the renderer binary cannot be spawned, exits
/// non-zero, or produces output that is not a decodable image.
pub async fn rasterize_html(renderer_bin: &str, html: &str) -> AppResult<Vec<u8>> {
    let mut child = Command::new(renderer_bin)
        .args([
            "--quiet",
            "--format",
            "png",
            "--width",
            &VIEWPORT_WIDTH.to_string(),
            "--height",
            &VIEWPORT_HEIGHT.to_string(),
            "-",
            "-",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| AppError::Render(format!("failed to spawn {renderer_bin}: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Render("renderer stdin unavailable".to_owned()))?;
    stdin
        .write_all(html.as_bytes())
        .await
        .map_err(|e| AppError::Render(format!("writing html to renderer failed: {e}")))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| AppError::Render(format!("renderer did not finish: {e}")))?;
    if !output.status.success() {
        return Err(AppError::Render(format!(
            "renderer exited with {}",
            output.status
        )));
    }
    crop_to_content(&output.stdout)
}

/// Crop a PNG to its inverse-color bounding box and re-encode
///
/// An all-white render is returned uncropped rather than collapsing to an
/// empty image.
pub fn crop_to_content(png: &[u8]) -> AppResult<Vec<u8>> {
    let img = image::load_from_memory(png)
        .map_err(|e| AppError::Render(format!("renderer output is not an image: {e}")))?;
    let cropped = match content_bbox(&img.to_rgb8()) {
        Some((x, y, width, height)) => img.crop_imm(x, y, width, height),
        None => img,
    };
    let mut buf = Cursor::new(Vec::new());
    cropped
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| AppError::Render(format!("png encoding failed: {e}")))?;
    Ok(buf.into_inner())
}

/// Bounding box `(x, y, width, height)` of all non-white pixels
fn content_bbox(img: &RgbImage) -> Option<(u32, u32, u32, u32)> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;
    for (x, y, pixel) in img.enumerate_pixels() {
        if *pixel != WHITE {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    found.then(|| (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}

#[cfg(test)]
mod tests {
    use super::{WHITE, content_bbox, crop_to_content};
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_png(img: RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .expect("png encode");
        buf.into_inner()
    }

    #[test]
    fn bbox_spans_all_non_white_pixels() {
        let mut img = RgbImage::from_pixel(20, 10, WHITE);
        img.put_pixel(3, 2, Rgb([0, 0, 0]));
        img.put_pixel(15, 7, Rgb([200, 10, 10]));
        assert_eq!(content_bbox(&img), Some((3, 2, 13, 6)));
    }

    #[test]
    fn bbox_of_blank_image_is_none() {
        let img = RgbImage::from_pixel(8, 8, WHITE);
        assert_eq!(content_bbox(&img), None);
    }

    #[test]
    fn crop_shrinks_to_content() {
        let mut img = RgbImage::from_pixel(50, 40, WHITE);
        for x in 10..20 {
            for y in 5..15 {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        let cropped = crop_to_content(&encode_png(img)).expect("crop");
        let reloaded = image::load_from_memory(&cropped).expect("decode");
        assert_eq!(reloaded.dimensions(), (10, 10));
    }

    #[test]
    fn blank_image_survives_uncropped() {
        let img = RgbImage::from_pixel(12, 9, WHITE);
        let cropped = crop_to_content(&encode_png(img)).expect("crop");
        let reloaded = image::load_from_memory(&cropped).expect("decode");
        assert_eq!(reloaded.dimensions(), (12, 9));
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(crop_to_content(b"definitely not a png").is_err());
    }
}
