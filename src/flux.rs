/// PSF flux: amplitude of the exposure's PSF model fitted to the source
use std::marker::PhantomData;

use crate::algorithm::{Algorithm, AlgorithmControl, ExposurePatch, FLUX_ORDER};
use crate::error::{MeasError, Result};
use crate::geom::Point2;
use crate::image::Pixel;
use crate::psf::{kernel_origin, Psf};
use crate::schema::{Key, Schema, SourceRecord};
use crate::shape::CentroidKeys;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PsfFluxControl {
    pub name: String,
    pub order: i32,
    /// Centroid field prefix; the peak pixel is used when unset
    pub centroid: Option<String>,
}

impl Default for PsfFluxControl {
    fn default() -> Self {
        Self {
            name: "flux.psf".to_string(),
            order: FLUX_ORDER,
            centroid: Some("centroid.naive".to_string()),
        }
    }
}

impl AlgorithmControl for PsfFluxControl {
    crate::control_body!();
    crate::algorithm_factory!(PsfFlux; u16, f32, f64);
}

pub struct PsfFlux<P> {
    name: String,
    centroid: Option<CentroidKeys>,
    flux: Key<f64>,
    flux_err: Key<f64>,
    _pixel: PhantomData<fn() -> P>,
}

impl<P: Pixel> PsfFlux<P> {
    pub fn new(control: &PsfFluxControl, schema: &mut Schema) -> Result<Self> {
        let centroid = CentroidKeys::find(schema, control.centroid.as_deref())?;
        let name = &control.name;
        Ok(Self {
            name: name.clone(),
            centroid,
            flux: schema.add_field(&format!("{name}.flux"), "PSF-weighted flux (counts)")?,
            flux_err: schema.add_field(
                &format!("{name}.flux_err"),
                "PSF flux uncertainty from Poisson noise (counts)",
            )?,
            _pixel: PhantomData,
        })
    }
}

impl<P: Pixel> Algorithm<P> for PsfFlux<P> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Least-squares amplitude `sum(d * p) / sum(p * p)` over the kernel
    /// footprint, `d` being background-subtracted data
    fn apply(&self, source: &mut SourceRecord, patch: &ExposurePatch<'_, P>) -> Result<()> {
        let psf = patch
            .psf()
            .ok_or_else(|| MeasError::MissingPsf(self.name.clone()))?;
        let (peak_x, peak_y) = patch.peak();
        let (cx, cy) = CentroidKeys::position(self.centroid, source, (peak_x, peak_y));
        let center = Point2::new(cx, cy);

        let kernel = psf.compute_image(center)?;
        let (ox, oy) = kernel_origin(&center, kernel.dimensions());
        let image = patch.image();
        let background = patch.background();

        let (mut sum_dp, mut sum_pp, mut sum_var) = (0.0, 0.0, 0.0);
        for j in 0..kernel.height() {
            for i in 0..kernel.width() {
                let Some(value) = image.get_parent(ox + i as i32, oy + j as i32) else {
                    continue;
                };
                let value = value.to_f64();
                let p = kernel.get(i, j);
                sum_dp += (value - background) * p;
                sum_pp += p * p;
                sum_var += p * p * value.max(0.0);
            }
        }
        if sum_pp == 0.0 {
            return Err(MeasError::ZeroFlux {
                x: peak_x,
                y: peak_y,
            });
        }

        source.set(self.flux, sum_dp / sum_pp);
        source.set(self.flux_err, sum_var.sqrt() / sum_pp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Exposure, Image};
    use crate::psf::{FixedKernelPsf, GaussianPsf};
    use std::sync::Arc;

    fn peak_only() -> PsfFluxControl {
        PsfFluxControl {
            centroid: None,
            ..PsfFluxControl::default()
        }
    }

    fn render(psf: &dyn Psf, x: i32, y: i32, amplitude: f64, background: f64) -> Image<f64> {
        let mut image = Image::<f64>::new(32, 32);
        image.fill(background);
        let center = Point2::new(x as f64, y as f64);
        let kernel = psf.compute_image(center).unwrap();
        let (ox, oy) = kernel_origin(&center, kernel.dimensions());
        for j in 0..kernel.height() {
            for i in 0..kernel.width() {
                let px = (ox + i as i32) as usize;
                let py = (oy + j as i32) as usize;
                image.set(px, py, background + amplitude * kernel.get(i, j));
            }
        }
        image
    }

    fn run(exposure: &Exposure<f64>, x: i32, y: i32) -> (Schema, Result<SourceRecord>) {
        let mut schema = Schema::new();
        let algorithm = PsfFlux::<f64>::new(&peak_only(), &mut schema).unwrap();
        let mut record = SourceRecord::new(&schema, 1, x, y);
        let result = algorithm
            .apply(&mut record, &ExposurePatch::new(exposure, x, y))
            .map(|_| record);
        (schema, result)
    }

    #[test]
    fn test_recovers_amplitude() {
        let psf: Arc<dyn Psf> = Arc::new(GaussianPsf::new(11, 11, 1.8));
        let image = render(&*psf, 15, 12, 2500.0, 100.0);
        let exposure = Exposure::new(image).with_background(100.0).with_psf(psf);
        let (schema, record) = run(&exposure, 15, 12);
        let record = record.unwrap();
        let flux = record.get(schema.find::<f64>("flux.psf.flux").unwrap());
        assert!((flux - 2500.0).abs() < 1e-8, "flux = {}", flux);
        assert!(record.get(schema.find::<f64>("flux.psf.flux_err").unwrap()) > 0.0);
    }

    #[test]
    fn test_requires_psf() {
        let exposure = Exposure::new(Image::<f64>::new(16, 16));
        let (_, record) = run(&exposure, 8, 8);
        assert_eq!(
            record.unwrap_err(),
            MeasError::MissingPsf("flux.psf".to_string())
        );
    }

    #[test]
    fn test_zero_kernel_is_zero_flux() {
        let psf: Arc<dyn Psf> = Arc::new(FixedKernelPsf::constant(5, 5, 0.0));
        let exposure = Exposure::new(Image::<f64>::new(16, 16)).with_psf(psf);
        let (_, record) = run(&exposure, 8, 8);
        assert_eq!(record.unwrap_err(), MeasError::ZeroFlux { x: 8, y: 8 });
    }

    #[test]
    fn test_psf_evaluation_error_propagates() {
        let psf: Arc<dyn Psf> =
            Arc::new(FixedKernelPsf::constant(5, 5, 1.0).with_valid_region(
                crate::geom::BoundingBox::new(0, 0, 4, 4),
            ));
        let exposure = Exposure::new(Image::<f64>::new(16, 16)).with_psf(psf);
        let (_, record) = run(&exposure, 8, 8);
        assert!(matches!(record.unwrap_err(), MeasError::EvaluationError { .. }));
    }
}
