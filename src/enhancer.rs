// Screenshot clean-up before text recognition.
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct EnhanceOptions {
    pub scale: u32,
    pub filter: FilterType,
    pub contrast: f32,
    pub brightness: f32,
    /// Luminance above this becomes pure white.
    pub white_threshold: u8,
    /// Luminance below this becomes pure black.
    pub black_threshold: u8,
    pub edge_pass: bool,
    /// 0.0 disables darkening, 1.0 turns the strongest edges black.
    pub edge_strength: f32,
    pub max_pixels: u64,
}

impl Default for EnhanceOptions {
    fn default() -> Self {
        Self {
            scale: 4,
            filter: FilterType::CatmullRom,
            contrast: 1.5,
            brightness: 0.0,
            white_threshold: 180,
            black_threshold: 120,
            edge_pass: true,
            edge_strength: 0.5,
            max_pixels: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("image is empty")]
    Empty,
    #[error("upscaled image {width}x{height} exceeds the pixel budget")]
    TooLarge { width: u64, height: u64 },
    #[error("invalid option: {0}")]
    InvalidOption(&'static str),
}

pub struct ImageEnhancer {
    options: EnhanceOptions,
}

impl ImageEnhancer {
    pub fn new(options: EnhanceOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EnhanceOptions {
        &self.options
    }

    /// Runs the pipeline; any failing step hands back the input untouched.
    pub fn enhance(&self, image: &DynamicImage) -> DynamicImage {
        match self.try_enhance(image) {
            Ok(enhanced) => enhanced,
            Err(e) => {
                warn!("Image enhancement skipped: {}", e);
                image.clone()
            }
        }
    }

    pub fn try_enhance(&self, image: &DynamicImage) -> Result<DynamicImage, EnhanceError> {
        let mut rgba = self.upscale(image)?;
        self.adjust(&mut rgba)?;
        self.binarize(&mut rgba);
        if self.options.edge_pass {
            rgba = self.emphasize_edges(&rgba)?;
        }
        debug!("Enhanced image to {}x{}", rgba.width(), rgba.height());
        Ok(DynamicImage::ImageRgba8(rgba))
    }

    fn upscale(&self, image: &DynamicImage) -> Result<RgbaImage, EnhanceError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(EnhanceError::Empty);
        }
        if self.options.scale == 0 {
            return Err(EnhanceError::InvalidOption("scale must be positive"));
        }

        let scaled_w = u64::from(width) * u64::from(self.options.scale);
        let scaled_h = u64::from(height) * u64::from(self.options.scale);
        if scaled_w > u64::from(u32::MAX)
            || scaled_h > u64::from(u32::MAX)
            || scaled_w * scaled_h > self.options.max_pixels
        {
            return Err(EnhanceError::TooLarge {
                width: scaled_w,
                height: scaled_h,
            });
        }

        let rgba = image.to_rgba8();
        if self.options.scale == 1 {
            return Ok(rgba);
        }
        Ok(imageops::resize(
            &rgba,
            scaled_w as u32,
            scaled_h as u32,
            self.options.filter,
        ))
    }

    fn adjust(&self, image: &mut RgbaImage) -> Result<(), EnhanceError> {
        let contrast = self.options.contrast;
        let brightness = self.options.brightness;
        if !contrast.is_finite() || !brightness.is_finite() {
            return Err(EnhanceError::InvalidOption("contrast and brightness must be finite"));
        }

        for pixel in image.pixels_mut() {
            for c in pixel.0.iter_mut().take(3) {
                let v = (f32::from(*c) - 128.0) * contrast + 128.0 + brightness;
                *c = v.clamp(0.0, 255.0) as u8;
            }
        }
        Ok(())
    }

    fn binarize(&self, image: &mut RgbaImage) {
        let white = f32::from(self.options.white_threshold);
        let black = f32::from(self.options.black_threshold);

        for pixel in image.pixels_mut() {
            let lum = luminance(pixel);
            if lum > white {
                pixel.0[..3].copy_from_slice(&[255, 255, 255]);
            } else if lum < black {
                pixel.0[..3].copy_from_slice(&[0, 0, 0]);
            }
        }
    }

    /// Sobel gradient magnitude, blended multiplicatively so glyph borders get darker.
    fn emphasize_edges(&self, image: &RgbaImage) -> Result<RgbaImage, EnhanceError> {
        let strength = self.options.edge_strength;
        if !(0.0..=1.0).contains(&strength) {
            return Err(EnhanceError::InvalidOption("edge_strength must be within 0..=1"));
        }

        let (w, h) = image.dimensions();
        if w < 3 || h < 3 {
            return Ok(image.clone());
        }

        let lum: Vec<f32> = image.pixels().map(luminance).collect();
        let at = |x: u32, y: u32| lum[(y * w + x) as usize];

        let mut magnitude = vec![0.0f32; lum.len()];
        let mut max_mag = 0.0f32;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                    - at(x - 1, y - 1)
                    - 2.0 * at(x - 1, y)
                    - at(x - 1, y + 1);
                let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                    - at(x - 1, y - 1)
                    - 2.0 * at(x, y - 1)
                    - at(x + 1, y - 1);
                let mag = (gx * gx + gy * gy).sqrt();
                magnitude[(y * w + x) as usize] = mag;
                max_mag = max_mag.max(mag);
            }
        }

        if max_mag <= f32::EPSILON {
            return Ok(image.clone());
        }

        let mut out = image.clone();
        for (i, pixel) in out.pixels_mut().enumerate() {
            let factor = 1.0 - strength * (magnitude[i] / max_mag);
            for c in pixel.0.iter_mut().take(3) {
                *c = (f32::from(*c) * factor).clamp(0.0, 255.0) as u8;
            }
        }
        Ok(out)
    }
}

impl Default for ImageEnhancer {
    fn default() -> Self {
        Self::new(EnhanceOptions::default())
    }
}

fn luminance(pixel: &Rgba<u8>) -> f32 {
    let [r, g, b, _] = pixel.0;
    0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([value, value, value, 255]),
        ))
    }

    fn no_frills() -> EnhanceOptions {
        EnhanceOptions {
            scale: 1,
            contrast: 1.0,
            edge_pass: false,
            ..EnhanceOptions::default()
        }
    }

    #[test]
    fn upscales_by_the_configured_factor() {
        let out = ImageEnhancer::default().enhance(&flat(10, 4, 200));
        assert_eq!(out.dimensions(), (40, 16));
    }

    #[test]
    fn binarization_uses_luminance_thresholds() {
        let enhancer = ImageEnhancer::new(no_frills());
        let bright = enhancer.enhance(&flat(2, 2, 190)).to_rgba8();
        let dark = enhancer.enhance(&flat(2, 2, 100)).to_rgba8();
        let middle = enhancer.enhance(&flat(2, 2, 150)).to_rgba8();

        assert_eq!(bright.get_pixel(0, 0).0, [255, 255, 255, 255]);
        assert_eq!(dark.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(middle.get_pixel(0, 0).0, [150, 150, 150, 255]);
    }

    #[test]
    fn contrast_pushes_values_apart() {
        let enhancer = ImageEnhancer::new(EnhanceOptions {
            contrast: 2.0,
            ..no_frills()
        });
        // 150 -> 172 stays in the untouched middle band
        let out = enhancer.enhance(&flat(1, 1, 150)).to_rgba8();
        assert_eq!(out.get_pixel(0, 0).0[0], 172);
    }

    #[test]
    fn edge_pass_darkens_boundaries_only() {
        let mut img = RgbaImage::from_pixel(9, 9, Rgba([255, 255, 255, 255]));
        for y in 3..6 {
            for x in 3..6 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let enhancer = ImageEnhancer::new(EnhanceOptions {
            edge_pass: true,
            ..no_frills()
        });
        let out = enhancer.enhance(&DynamicImage::ImageRgba8(img)).to_rgba8();

        assert_eq!(out.get_pixel(0, 0).0[0], 255);
        assert!(out.get_pixel(2, 4).0[0] < 255);
        assert_eq!(out.get_pixel(4, 4).0[0], 0);
    }

    #[test]
    fn failures_return_the_input_unchanged() {
        let enhancer = ImageEnhancer::new(EnhanceOptions {
            max_pixels: 10,
            ..EnhanceOptions::default()
        });
        let input = flat(8, 8, 42);
        let out = enhancer.enhance(&input);
        assert_eq!(out.dimensions(), (8, 8));
        assert_eq!(out.to_rgba8().get_pixel(0, 0).0, [42, 42, 42, 255]);

        let empty = DynamicImage::new_rgba8(0, 0);
        assert_eq!(ImageEnhancer::default().enhance(&empty).dimensions(), (0, 0));
    }
}
