use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use tracing::debug;

use super::print_specs::{PrintSpecs, PuzzleSize};
use crate::error::ExportError;

const PREVIEW_EDGE_PX: u32 = 1200;
const GRID_ALPHA: f32 = 80.0 / 255.0;
const GRID_LINE_PX: u32 = 2;

pub struct ExportOutput {
    pub preview: DynamicImage,
    pub print_ready: DynamicImage,
}

/// Turns the final working image into a customer preview and a print file.
pub struct Exporter {
    specs: PrintSpecs,
}

impl Exporter {
    pub fn new(specs: PrintSpecs) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &PrintSpecs {
        &self.specs
    }

    /// The working image must already sit at the exact print target; export
    /// never resamples to hide an under-resolution upscale.
    pub fn export(&self, working: DynamicImage, size: PuzzleSize) -> Result<ExportOutput, ExportError> {
        let spec = self.specs.get(size)?;
        let (width, height) = working.dimensions();
        if (width, height) != (spec.dimensions.width, spec.dimensions.height) {
            return Err(ExportError::DimensionMismatch {
                expected_width: spec.dimensions.width,
                expected_height: spec.dimensions.height,
                actual_width: width,
                actual_height: height,
            });
        }

        let mut preview = if width.max(height) > PREVIEW_EDGE_PX {
            working.thumbnail(PREVIEW_EDGE_PX, PREVIEW_EDGE_PX).to_rgb8()
        } else {
            working.to_rgb8()
        };
        draw_grid(&mut preview, spec.grid_cols, spec.grid_rows);
        debug!(
            "Exported {} print file {}x{} with {}x{} preview",
            size,
            width,
            height,
            preview.width(),
            preview.height()
        );

        let print_ready = match working {
            rgb @ DynamicImage::ImageRgb8(_) => rgb,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };

        Ok(ExportOutput {
            preview: DynamicImage::ImageRgb8(preview),
            print_ready,
        })
    }
}

fn darken(pixel: &mut Rgb<u8>) {
    for channel in pixel.0.iter_mut() {
        *channel = (*channel as f32 * (1.0 - GRID_ALPHA)).round() as u8;
    }
}

/// Semi-transparent puzzle grid so customers see where the cuts fall.
fn draw_grid(image: &mut RgbImage, cols: u32, rows: u32) {
    let (width, height) = image.dimensions();
    if cols == 0 || rows == 0 {
        return;
    }

    for i in 1..cols {
        let x0 = i * (width / cols);
        for x in x0..(x0 + GRID_LINE_PX).min(width) {
            for y in 0..height {
                darken(image.get_pixel_mut(x, y));
            }
        }
    }
    for i in 1..rows {
        let y0 = i * (height / rows);
        for y in y0..(y0 + GRID_LINE_PX).min(height) {
            for x in 0..width {
                darken(image.get_pixel_mut(x, y));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::solid_image;

    #[test]
    fn test_thousand_piece_print_ready_is_exact() {
        let exporter = Exporter::new(PrintSpecs::default());
        let working = DynamicImage::new_rgb8(6000, 8400);

        let output = exporter.export(working, PuzzleSize::Pieces1000).unwrap();
        assert_eq!(output.print_ready.dimensions(), (6000, 8400));
        assert!(output.preview.width().max(output.preview.height()) <= 1200);
    }

    #[test]
    fn test_under_resolution_is_rejected() {
        let exporter = Exporter::new(PrintSpecs::default());
        let working = solid_image(100, 140, [1, 2, 3]);

        let err = exporter.export(working, PuzzleSize::Pieces500).err().unwrap();
        assert!(matches!(
            err,
            ExportError::DimensionMismatch {
                expected_width: 4800,
                expected_height: 6000,
                actual_width: 100,
                actual_height: 140,
            }
        ));
    }

    #[test]
    fn test_oversized_output_is_rejected_too() {
        let exporter = Exporter::new(
            PrintSpecs::default().with_dimensions(PuzzleSize::Pieces500, 48, 60),
        );
        let working = solid_image(49, 60, [1, 2, 3]);
        assert!(exporter.export(working, PuzzleSize::Pieces500).is_err());
    }

    #[test]
    fn test_preview_carries_grid_lines() {
        let exporter = Exporter::new(
            PrintSpecs::default().with_dimensions(PuzzleSize::Pieces500, 200, 250),
        );
        let working = solid_image(200, 250, [200, 200, 200]);

        let output = exporter.export(working, PuzzleSize::Pieces500).unwrap();
        let preview = output.preview.to_rgb8();
        // 20 columns over 200px: first line at x=10.
        assert!(preview.get_pixel(10, 3).0[0] < 200);
        assert_eq!(preview.get_pixel(5, 5).0, [200, 200, 200]);
        assert_eq!(output.print_ready.to_rgb8().get_pixel(10, 3).0, [200, 200, 200]);
    }
}
