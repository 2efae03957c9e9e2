/// PSF of a coadd, built by stacking the PSFs of its input exposures
///
/// Each input exposure contributes its own PSF evaluated at the query point
/// translated into that exposure's pixel frame. Only image evaluation is
/// supported; the composite carries no analytic parameterization.
use std::sync::Arc;

use crate::error::{MeasError, Result};
use crate::geom::{AffineWcs, BoundingBox, Point2};
use crate::image::Image;
use crate::psf::Psf;
use crate::registry::PsfKind;

/// How component images are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accumulation {
    /// Plain sum; per-exposure weights are carried but not applied
    #[default]
    Uniform,
    /// Each component is scaled by its exposure weight before summing
    Weighted,
}

/// One contributing exposure
#[derive(Debug, Clone)]
pub struct ExposureRecord {
    pub id: u64,
    pub psf: Arc<dyn Psf>,
    pub wcs: AffineWcs,
    pub bbox: BoundingBox,
    pub weight: f64,
}

impl ExposureRecord {
    pub fn new(id: u64, psf: Arc<dyn Psf>, wcs: AffineWcs, bbox: BoundingBox) -> Self {
        Self {
            id,
            psf,
            wcs,
            bbox,
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Ordered exposure records; `has_weight` says whether the weight column exists
#[derive(Debug, Clone, Default)]
pub struct ExposureCatalog {
    has_weight: bool,
    records: Vec<ExposureRecord>,
}

impl ExposureCatalog {
    /// Catalog without a weight column
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight_field() -> Self {
        Self {
            has_weight: true,
            records: Vec::new(),
        }
    }

    pub fn has_weight(&self) -> bool {
        self.has_weight
    }

    pub fn push(&mut self, record: ExposureRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ExposureRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [ExposureRecord] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CoaddPsf {
    catalog: ExposureCatalog,
    accumulation: Accumulation,
}

impl CoaddPsf {
    pub fn new(catalog: &ExposureCatalog) -> Self {
        let mut psf = Self {
            catalog: ExposureCatalog::with_weight_field(),
            accumulation: Accumulation::default(),
        };
        psf.set_exposures(catalog);
        psf
    }

    pub fn with_accumulation(mut self, accumulation: Accumulation) -> Self {
        self.accumulation = accumulation;
        self
    }

    pub fn accumulation(&self) -> Accumulation {
        self.accumulation
    }

    /// Rebuild the private catalog from `catalog`, discarding the old one.
    /// Weights default to 1.0 when the input has no weight column.
    pub fn set_exposures(&mut self, catalog: &ExposureCatalog) {
        let mut internal = ExposureCatalog::with_weight_field();
        for record in catalog.records() {
            let weight = if catalog.has_weight() { record.weight } else { 1.0 };
            internal.push(ExposureRecord {
                id: record.id,
                psf: Arc::clone(&record.psf),
                wcs: record.wcs.clone(),
                bbox: record.bbox,
                weight,
            });
        }
        tracing::debug!(
            "CoaddPsf: {} exposures, weights {}",
            internal.len(),
            if catalog.has_weight() { "copied" } else { "defaulted" }
        );
        self.catalog = internal;
    }

    pub fn component_count(&self) -> usize {
        self.catalog.len()
    }

    pub fn exposures(&self) -> &ExposureCatalog {
        &self.catalog
    }

    /// Zero `output`, then add every component evaluated at (x, y) in its own
    /// exposure frame. With `do_normalize` the result is scaled to unit sum.
    pub fn compute_image_into(
        &self,
        output: &mut Image<f64>,
        do_normalize: bool,
        x: f64,
        y: f64,
    ) -> Result<()> {
        output.fill(0.0);
        for record in self.catalog.records() {
            let local = record.bbox.to_local(x, y);
            let component = record.psf.compute_image(local)?;
            let factor = match self.accumulation {
                Accumulation::Uniform => 1.0,
                Accumulation::Weighted => record.weight,
            };
            output.add_scaled(&component, factor)?;
        }

        if do_normalize {
            let sum = output.sum();
            if sum == 0.0 {
                return Err(MeasError::EvaluationError {
                    x,
                    y,
                    reason: "coadd PSF has zero total flux".to_string(),
                });
            }
            output.scale(1.0 / sum);
        }
        Ok(())
    }
}

impl Psf for CoaddPsf {
    fn kind(&self) -> PsfKind {
        PsfKind::Coadd
    }

    /// Kernel size of the first component; (0, 0) when empty
    fn dimensions(&self) -> (usize, usize) {
        self.catalog
            .records()
            .first()
            .map(|r| r.psf.dimensions())
            .unwrap_or((0, 0))
    }

    fn compute_image(&self, point: Point2) -> Result<Image<f64>> {
        if self.catalog.is_empty() {
            return Err(MeasError::EvaluationError {
                x: point.x,
                y: point.y,
                reason: "coadd PSF has no contributing exposures".to_string(),
            });
        }
        let (width, height) = self.dimensions();
        let mut image = Image::new(width, height);
        self.compute_image_into(&mut image, true, point.x, point.y)?;
        Ok(image)
    }
}
