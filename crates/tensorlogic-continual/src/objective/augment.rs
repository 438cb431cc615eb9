//! Photometric augmentation for the student view in consistency mode.
//!
//! Images are flattened rows with intensities in `[0, 1]`. Every augmenter
//! keeps the shape and clamps back into range.

use crate::{ContinualError, ContinualResult};
use scirs2_core::ndarray::{Array2, ArrayView2};
use scirs2_core::random::{Rng, StdRng};

/// Trait for image-batch augmentations.
pub trait ImageAugmenter: Send + Sync {
    /// Augment a batch of flattened images.
    fn augment(&self, images: &ArrayView2<f64>, rng: &mut StdRng) -> ContinualResult<Array2<f64>>;
}

/// Random brightness and contrast jitter, drawn once per image.
#[derive(Debug, Clone)]
pub struct ColorJitter {
    /// Brightness offset is drawn from `[-brightness, brightness]`.
    pub brightness: f64,
    /// Contrast factor is drawn from `[1 - contrast, 1 + contrast]`.
    pub contrast: f64,
}

impl ColorJitter {
    /// Create a jitter with the given ranges.
    pub fn new(brightness: f64, contrast: f64) -> ContinualResult<Self> {
        if !(0.0..=1.0).contains(&brightness) || !(0.0..=1.0).contains(&contrast) {
            return Err(ContinualError::InvalidParameter(
                "brightness and contrast must be in [0, 1]".to_string(),
            ));
        }
        Ok(Self {
            brightness,
            contrast,
        })
    }
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            brightness: 0.4,
            contrast: 0.4,
        }
    }
}

impl ImageAugmenter for ColorJitter {
    fn augment(&self, images: &ArrayView2<f64>, rng: &mut StdRng) -> ContinualResult<Array2<f64>> {
        let mut out = images.to_owned();
        for mut row in out.rows_mut() {
            let offset = (rng.random::<f64>() * 2.0 - 1.0) * self.brightness;
            let factor = 1.0 + (rng.random::<f64>() * 2.0 - 1.0) * self.contrast;
            let mean = row.mean().unwrap_or(0.0);
            row.mapv_inplace(|x| ((x - mean) * factor + mean + offset).clamp(0.0, 1.0));
        }
        Ok(out)
    }
}

/// Additive gaussian pixel noise.
#[derive(Debug, Clone)]
pub struct GaussianNoise {
    /// Standard deviation of the noise.
    pub std_dev: f64,
}

impl GaussianNoise {
    /// Create a noise augmenter.
    pub fn new(std_dev: f64) -> ContinualResult<Self> {
        if std_dev < 0.0 {
            return Err(ContinualError::InvalidParameter(
                "std_dev must be non-negative".to_string(),
            ));
        }
        Ok(Self { std_dev })
    }
}

impl Default for GaussianNoise {
    fn default() -> Self {
        Self { std_dev: 0.05 }
    }
}

impl ImageAugmenter for GaussianNoise {
    fn augment(&self, images: &ArrayView2<f64>, rng: &mut StdRng) -> ContinualResult<Array2<f64>> {
        let mut out = images.to_owned();
        for value in out.iter_mut() {
            // Box-Muller
            let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = rng.random();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            *value = (*value + z * self.std_dev).clamp(0.0, 1.0);
        }
        Ok(out)
    }
}

/// Strong view: color jitter followed by gaussian noise.
#[derive(Debug, Clone, Default)]
pub struct StrongPhotometric {
    /// Jitter stage.
    pub jitter: ColorJitter,
    /// Noise stage.
    pub noise: GaussianNoise,
}

impl ImageAugmenter for StrongPhotometric {
    fn augment(&self, images: &ArrayView2<f64>, rng: &mut StdRng) -> ContinualResult<Array2<f64>> {
        let jittered = self.jitter.augment(images, rng)?;
        self.noise.augment(&jittered.view(), rng)
    }
}
