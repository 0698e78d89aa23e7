use std::path::Path;

use crate::embedding::domain::crop_source::{CropError, CropSource};
use crate::shared::bounding_box::BoundingBox;
use crate::shared::constants::IMAGE_EXTENSIONS;
use crate::shared::crop::Crop;

/// Reads photos from disk with the `image` crate and cuts out RGB crops.
///
/// Boxes that run past the image edge are clamped; a box with no overlap at
/// all is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCropSource;

impl ImageCropSource {
    pub fn new() -> Self {
        Self
    }
}

impl CropSource for ImageCropSource {
    fn crop(&self, path: &Path, bbox: &BoundingBox) -> Result<Crop, CropError> {
        if !path.is_file() {
            return Err(CropError::Missing(path.to_path_buf()));
        }
        if !has_image_extension(path) {
            return Err(CropError::Unsupported(path.to_path_buf()));
        }

        let image = image::open(path)
            .map_err(|e| CropError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
            .to_rgb8();

        let (img_w, img_h) = image.dimensions();
        let x = bbox.x.min(img_w);
        let y = bbox.y.min(img_h);
        let w = bbox.width.min(img_w - x);
        let h = bbox.height.min(img_h - y);
        if w == 0 || h == 0 {
            return Err(CropError::OutOfBounds(path.to_path_buf()));
        }

        let region = image::imageops::crop_imm(&image, x, y, w, h).to_image();
        Ok(Crop::new(region.into_raw(), w, h))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// 20x10 image: left half red, right half blue.
    fn write_test_image(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let img = image::RgbImage::from_fn(20, 10, |x, _| {
            if x < 10 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        let path = dir.path().join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_crop_extracts_region_pixels() {
        let dir = TempDir::new().unwrap();
        let path = write_test_image(&dir, "photo.png");

        let crop = ImageCropSource
            .crop(&path, &BoundingBox::new(12, 2, 4, 3))
            .unwrap();
        assert_eq!((crop.width(), crop.height()), (4, 3));
        assert!(crop.data().chunks(3).all(|px| px == [0, 0, 255]));
    }

    #[test]
    fn test_crop_clamps_to_image_edge() {
        let dir = TempDir::new().unwrap();
        let path = write_test_image(&dir, "photo.png");

        let crop = ImageCropSource
            .crop(&path, &BoundingBox::new(15, 5, 100, 100))
            .unwrap();
        assert_eq!((crop.width(), crop.height()), (5, 5));
    }

    #[test]
    fn test_box_outside_image_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_test_image(&dir, "photo.png");

        let result = ImageCropSource.crop(&path, &BoundingBox::new(40, 40, 5, 5));
        assert!(matches!(result, Err(CropError::OutOfBounds(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = ImageCropSource.crop(&dir.path().join("nope.jpg"), &BoundingBox::new(0, 0, 1, 1));
        assert!(matches!(result, Err(CropError::Missing(_))));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not an image").unwrap();
        let result = ImageCropSource.crop(&path, &BoundingBox::new(0, 0, 1, 1));
        assert!(matches!(result, Err(CropError::Unsupported(_))));
    }

    #[test]
    fn test_undecodable_image_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not jpeg").unwrap();
        let result = ImageCropSource.crop(&path, &BoundingBox::new(0, 0, 1, 1));
        assert!(matches!(result, Err(CropError::Corrupt { .. })));
    }

    #[test]
    fn test_extension_check_ignores_case() {
        assert!(has_image_extension(Path::new("a/IMG_0001.JPG")));
        assert!(!has_image_extension(Path::new("a/clip.mp4")));
        assert!(!has_image_extension(Path::new("a/noext")));
    }
}
