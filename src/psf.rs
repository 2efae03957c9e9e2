/// PSF (Point Spread Function) models sampled as images
///
/// A model's image at `point` is a `width` x `height` kernel whose pixel
/// `(i, j)` lies over parent pixel `(round(x) - (width - 1) / 2 + i,
/// round(y) - (height - 1) / 2 + j)`. The sub-pixel part of `point` shifts
/// the profile inside the kernel.
use std::fmt;
use std::sync::Arc;

use crate::coadd_psf::{CoaddPsf, ExposureCatalog};
use crate::error::{MeasError, Result};
use crate::geom::{BoundingBox, Point2};
use crate::image::Image;
use crate::registry::PsfKind;

pub trait Psf: fmt::Debug + Send + Sync {
    fn kind(&self) -> PsfKind;

    /// Kernel size (width, height)
    fn dimensions(&self) -> (usize, usize);

    /// Model image at `point`, normalized the way the model defines it
    fn compute_image(&self, point: Point2) -> Result<Image<f64>>;
}

/// Parent pixel under kernel pixel (0, 0) for a PSF image at `point`
pub fn kernel_origin(point: &Point2, dimensions: (usize, usize)) -> (i32, i32) {
    let (width, height) = dimensions;
    (
        point.x.round() as i32 - ((width as i32 - 1) / 2),
        point.y.round() as i32 - ((height as i32 - 1) / 2),
    )
}

fn check_finite(point: &Point2) -> Result<()> {
    if !point.x.is_finite() || !point.y.is_finite() {
        return Err(MeasError::EvaluationError {
            x: point.x,
            y: point.y,
            reason: "position is not finite".to_string(),
        });
    }
    Ok(())
}

/// Circular Gaussian, unit sum over the kernel
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianPsf {
    width: usize,
    height: usize,
    sigma: f64,
}

impl GaussianPsf {
    pub fn new(width: usize, height: usize, sigma: f64) -> Self {
        Self {
            width,
            height,
            sigma,
        }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn fwhm(&self) -> f64 {
        self.sigma * 2.0 * (2.0 * 2.0_f64.ln()).sqrt()
    }
}

impl Psf for GaussianPsf {
    fn kind(&self) -> PsfKind {
        PsfKind::Gaussian
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn compute_image(&self, point: Point2) -> Result<Image<f64>> {
        check_finite(&point)?;
        if self.sigma <= 0.0 || self.width == 0 || self.height == 0 {
            return Err(MeasError::EvaluationError {
                x: point.x,
                y: point.y,
                reason: format!("degenerate Gaussian (sigma={})", self.sigma),
            });
        }

        let cx = ((self.width - 1) / 2) as f64 + (point.x - point.x.round());
        let cy = ((self.height - 1) / 2) as f64 + (point.y - point.y.round());
        let two_sigma_sq = 2.0 * self.sigma * self.sigma;

        let mut image = Image::new(self.width, self.height);
        for j in 0..self.height {
            for i in 0..self.width {
                let dx = i as f64 - cx;
                let dy = j as f64 - cy;
                image.set(i, j, (-(dx * dx + dy * dy) / two_sigma_sq).exp());
            }
        }

        let sum = image.sum();
        image.scale(1.0 / sum);
        Ok(image)
    }
}

/// Spatially constant kernel, optionally only defined inside `valid`
#[derive(Debug, Clone, PartialEq)]
pub struct FixedKernelPsf {
    kernel: Image<f64>,
    valid: Option<BoundingBox>,
}

impl FixedKernelPsf {
    pub fn new(kernel: Image<f64>) -> Self {
        Self {
            kernel,
            valid: None,
        }
    }

    pub fn with_valid_region(mut self, valid: BoundingBox) -> Self {
        self.valid = Some(valid);
        self
    }

    /// Kernel filled with a single value
    pub fn constant(width: usize, height: usize, value: f64) -> Self {
        let mut kernel = Image::new(width, height);
        kernel.fill(value);
        Self::new(kernel)
    }
}

impl Psf for FixedKernelPsf {
    fn kind(&self) -> PsfKind {
        PsfKind::Fixed
    }

    fn dimensions(&self) -> (usize, usize) {
        self.kernel.dimensions()
    }

    fn compute_image(&self, point: Point2) -> Result<Image<f64>> {
        check_finite(&point)?;
        if let Some(valid) = &self.valid {
            if !valid.contains_point(&point) {
                return Err(MeasError::EvaluationError {
                    x: point.x,
                    y: point.y,
                    reason: format!("outside the model's valid region {:?}", valid),
                });
            }
        }
        Ok(self.kernel.clone())
    }
}

/// Parameters understood by `create_psf`
#[derive(Debug, Clone, Default)]
pub struct PsfParams {
    pub width: usize,
    pub height: usize,
    pub sigma: f64,
    pub exposures: Option<ExposureCatalog>,
}

/// Build a PSF model of the given kind
pub fn create_psf(kind: PsfKind, params: &PsfParams) -> Result<Arc<dyn Psf>> {
    match kind {
        PsfKind::Gaussian => Ok(Arc::new(GaussianPsf::new(
            params.width,
            params.height,
            params.sigma,
        ))),
        PsfKind::Fixed => {
            let gaussian = GaussianPsf::new(params.width, params.height, params.sigma);
            let kernel = gaussian.compute_image(Point2::origin())?;
            Ok(Arc::new(FixedKernelPsf::new(kernel)))
        }
        PsfKind::Coadd => {
            let catalog = params.exposures.clone().unwrap_or_default();
            Ok(Arc::new(CoaddPsf::new(&catalog)))
        }
        other => Err(MeasError::NotImplemented {
            registry: "psf",
            kind: other.to_string(),
        }),
    }
}
