/// Centroiding: 3x3 centroiders behind a name-based dispatcher
///
/// Coordinates handed to the dispatcher are parent-frame integer pixels. The
/// dispatcher rejects objects whose 3x3 neighborhood would leave the image,
/// then delegates to the centroider registered under its configured name.
use std::fmt;
use std::marker::PhantomData;

use crate::algorithm::{Algorithm, AlgorithmControl, ExposurePatch, CENTROID_ORDER};
use crate::error::{MeasError, Result};
use crate::geom::{index_to_position, Point2};
use crate::image::{ImageAccess, Pixel};
use crate::psf::Psf;
use crate::registry::{CentroidKind, Registries};
use crate::schema::{Key, Schema, SourceRecord};

/// Stateless centroid computation
pub trait Centroider: fmt::Debug + Send + Sync {
    fn kind(&self) -> CentroidKind;

    /// Sub-pixel position of the object whose peak is at parent pixel (x, y)
    fn compute(
        &self,
        image: &dyn ImageAccess,
        x: i32,
        y: i32,
        psf: Option<&dyn Psf>,
        background: f64,
    ) -> Result<Point2>;
}

/// Fail unless (x, y) is at least one pixel inside every edge
pub fn check_interior(image: &dyn ImageAccess, x: i32, y: i32) -> Result<(usize, usize)> {
    let (x0, y0) = image.origin();
    let (width, height) = image.dimensions();
    let lx = x - x0;
    let ly = y - y0;
    if lx < 1 || ly < 1 || lx > width as i32 - 2 || ly > height as i32 - 2 {
        return Err(MeasError::OutOfRange { x, y });
    }
    Ok((lx as usize, ly as usize))
}

/// 3x3 neighborhood, indexed as `im(dx, dy)` with dx, dy in -1..=1
struct Neighborhood {
    samples: [[f64; 3]; 3],
}

impl Neighborhood {
    fn read(image: &dyn ImageAccess, x: i32, y: i32) -> Result<Self> {
        let (lx, ly) = check_interior(image, x, y)?;
        let mut samples = [[0.0; 3]; 3];
        for (j, row) in samples.iter_mut().enumerate() {
            for (i, sample) in row.iter_mut().enumerate() {
                *sample = image.value(lx + i - 1, ly + j - 1);
            }
        }
        Ok(Self { samples })
    }

    fn im(&self, dx: i32, dy: i32) -> f64 {
        self.samples[(dy + 1) as usize][(dx + 1) as usize]
    }
}

/// Summation order of the 3x3 moments: top row first, left to right
const SCAN_ORDER: [(i32, i32); 9] = [
    (-1, 1),
    (0, 1),
    (1, 1),
    (-1, 0),
    (0, 0),
    (1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// Unweighted first moment of the 3x3 neighborhood
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveCentroid;

impl Centroider for NaiveCentroid {
    fn kind(&self) -> CentroidKind {
        CentroidKind::Naive
    }

    fn compute(
        &self,
        image: &dyn ImageAccess,
        x: i32,
        y: i32,
        _psf: Option<&dyn Psf>,
        background: f64,
    ) -> Result<Point2> {
        let n = Neighborhood::read(image, x, y)?;

        let sum = SCAN_ORDER
            .iter()
            .map(|&(dx, dy)| n.im(dx, dy))
            .sum::<f64>()
            - 9.0 * background;

        if sum == 0.0 {
            return Err(MeasError::ZeroFlux { x, y });
        }

        let sum_x = SCAN_ORDER
            .iter()
            .filter(|&&(dx, _)| dx != 0)
            .map(|&(dx, dy)| dx as f64 * n.im(dx, dy))
            .sum::<f64>();
        let row = |dy: i32| (-1..=1).map(|dx| n.im(dx, dy)).sum::<f64>();
        let sum_y = row(1) - row(-1);

        Ok(Point2::new(
            index_to_position(x) + sum_x / sum,
            index_to_position(y) + sum_y / sum,
        ))
    }
}

/// Vertex of the parabola through the peak row and column, per axis
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticCentroid;

impl QuadraticCentroid {
    fn vertex(minus: f64, center: f64, plus: f64) -> Option<f64> {
        let denom = minus - 2.0 * center + plus;
        if denom == 0.0 {
            return None;
        }
        Some(0.5 * (minus - plus) / denom)
    }
}

impl Centroider for QuadraticCentroid {
    fn kind(&self) -> CentroidKind {
        CentroidKind::Quadratic
    }

    fn compute(
        &self,
        image: &dyn ImageAccess,
        x: i32,
        y: i32,
        _psf: Option<&dyn Psf>,
        background: f64,
    ) -> Result<Point2> {
        let n = Neighborhood::read(image, x, y)?;
        let c = n.im(0, 0) - background;
        let dx = Self::vertex(n.im(-1, 0) - background, c, n.im(1, 0) - background)
            .ok_or(MeasError::ZeroFlux { x, y })?;
        let dy = Self::vertex(n.im(0, -1) - background, c, n.im(0, 1) - background)
            .ok_or(MeasError::ZeroFlux { x, y })?;
        Ok(Point2::new(index_to_position(x) + dx, index_to_position(y) + dy))
    }
}

static NAIVE: NaiveCentroid = NaiveCentroid;
static QUADRATIC: QuadraticCentroid = QuadraticCentroid;

/// Shared instance implementing `kind`
pub fn create_centroider(kind: CentroidKind) -> Result<&'static dyn Centroider> {
    match kind {
        CentroidKind::Naive => Ok(&NAIVE),
        CentroidKind::Quadratic => Ok(&QUADRATIC),
        other => Err(MeasError::NotImplemented {
            registry: "centroid",
            kind: other.to_string(),
        }),
    }
}

/// Centroider resolved by registered name
#[derive(Debug, Clone, Copy)]
pub struct CentroidDispatcher {
    centroider: &'static dyn Centroider,
}

impl CentroidDispatcher {
    pub fn new(registries: &Registries, name: &str) -> Result<Self> {
        let kind = registries.centroid.lookup_type(name)?;
        Ok(Self {
            centroider: create_centroider(kind)?,
        })
    }

    pub fn kind(&self) -> CentroidKind {
        self.centroider.kind()
    }

    pub fn apply(
        &self,
        image: &dyn ImageAccess,
        x: i32,
        y: i32,
        psf: Option<&dyn Psf>,
        background: f64,
    ) -> Result<Point2> {
        check_interior(image, x, y)?;
        tracing::trace!("Centroiding object at ({}, {})", x, y);
        self.centroider.compute(image, x, y, psf, background)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CentroidControl {
    pub name: String,
    pub order: i32,
    /// Registered centroider name
    pub centroider: String,
}

impl Default for CentroidControl {
    fn default() -> Self {
        Self {
            name: "centroid.naive".to_string(),
            order: CENTROID_ORDER,
            centroider: "NAIVE".to_string(),
        }
    }
}

impl CentroidControl {
    pub fn quadratic() -> Self {
        Self {
            name: "centroid.quadratic".to_string(),
            centroider: "QUADRATIC".to_string(),
            ..Self::default()
        }
    }
}

impl AlgorithmControl for CentroidControl {
    crate::control_body!();
    crate::algorithm_factory!(CentroidAlgorithm; u16, f32, f64);
}

/// Writes `<name>.x` and `<name>.y`
pub struct CentroidAlgorithm<P> {
    name: String,
    dispatcher: CentroidDispatcher,
    x_key: Key<f64>,
    y_key: Key<f64>,
    _pixel: PhantomData<fn() -> P>,
}

impl<P: Pixel> CentroidAlgorithm<P> {
    pub fn new(control: &CentroidControl, schema: &mut Schema) -> Result<Self> {
        let dispatcher = CentroidDispatcher::new(Registries::global(), &control.centroider)?;
        let x_key = schema.add_field(
            &format!("{}.x", control.name),
            "centroid column position (pixels)",
        )?;
        let y_key = schema.add_field(
            &format!("{}.y", control.name),
            "centroid row position (pixels)",
        )?;
        Ok(Self {
            name: control.name.clone(),
            dispatcher,
            x_key,
            y_key,
            _pixel: PhantomData,
        })
    }
}

impl<P: Pixel> Algorithm<P> for CentroidAlgorithm<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, source: &mut SourceRecord, patch: &ExposurePatch<'_, P>) -> Result<()> {
        let (x, y) = patch.peak();
        let center = self.dispatcher.apply(
            patch.image(),
            x,
            y,
            patch.psf().map(|psf| &**psf),
            patch.background(),
        )?;
        source.set(self.x_key, center.x);
        source.set(self.y_key, center.y);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{Exposure, Image};
    use rand::prelude::*;

    fn dispatcher() -> CentroidDispatcher {
        CentroidDispatcher::new(&Registries::with_builtins(), "NAIVE").unwrap()
    }

    fn pattern(values: [[f64; 3]; 3], x0: i32, y0: i32) -> Image<f64> {
        let mut image = Image::new(5, 5).with_origin(x0, y0);
        for (j, row) in values.iter().enumerate() {
            for (i, v) in row.iter().enumerate() {
                image.set(i + 1, j + 1, *v);
            }
        }
        image
    }

    #[test]
    fn test_symmetric_pattern_gives_center() {
        let image = pattern([[3.0, 5.0, 3.0], [5.0, 10.0, 5.0], [3.0, 5.0, 3.0]], 0, 0);
        let center = dispatcher().apply(&image, 2, 2, None, 1.0).unwrap();
        assert_eq!(center, Point2::new(2.0, 2.0));
    }

    #[test]
    fn test_first_moment_in_parent_frame() {
        // rows are dy = -1, 0, 1
        let image = pattern([[1.0, 1.0, 1.0], [1.0, 4.0, 3.0], [1.0, 1.0, 1.0]], 100, 200);
        let center = dispatcher().apply(&image, 102, 202, None, 0.0).unwrap();
        assert_eq!(center.x, 102.0 + 2.0 / 14.0);
        assert_eq!(center.y, 202.0);
    }

    #[test]
    fn test_flat_background_is_zero_flux() {
        let mut image = Image::<f64>::new(5, 5);
        image.fill(5.0);
        let err = dispatcher().apply(&image, 2, 2, None, 5.0).unwrap_err();
        assert_eq!(err, MeasError::ZeroFlux { x: 2, y: 2 });
    }

    #[test]
    fn test_edges_are_out_of_range() {
        let image = Image::<f32>::new(5, 5).with_origin(10, 20);
        let d = dispatcher();
        for (x, y) in [(10, 22), (14, 22), (12, 20), (12, 24), (0, 0)] {
            let err = d.apply(&image, x, y, None, 0.0).unwrap_err();
            assert_eq!(err, MeasError::OutOfRange { x, y });
        }
        assert!(check_interior(&image, 11, 21).is_ok());
        assert!(check_interior(&image, 13, 23).is_ok());
    }

    #[test]
    fn test_result_stays_inside_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let d = dispatcher();
        for _ in 0..200 {
            let mut image = Image::<f64>::new(6, 6).with_origin(-3, 4);
            for j in 0..6 {
                for i in 0..6 {
                    image.set(i, j, rng.gen_range(10.0..100.0));
                }
            }
            let x = rng.gen_range(-2..=1);
            let y = rng.gen_range(5..=8);
            let center = d.apply(&image, x, y, None, 5.0).unwrap();
            assert!((center.x - x as f64).abs() <= 1.0);
            assert!((center.y - y as f64).abs() <= 1.0);
        }
    }

    #[test]
    fn test_quadratic_recovers_parabola_vertex() {
        let f = |d: f64| 10.0 - (d - 0.2) * (d - 0.2);
        let g = |d: f64| 10.0 - (d + 0.1) * (d + 0.1);
        let mut image = Image::<f64>::new(5, 5);
        image.set(1, 2, f(-1.0));
        image.set(2, 2, f(0.0));
        image.set(3, 2, f(1.0));
        // Column through the peak shares the center sample
        image.set(2, 1, g(-1.0) - g(0.0) + f(0.0));
        image.set(2, 3, g(1.0) - g(0.0) + f(0.0));
        let center = QuadraticCentroid.compute(&image, 2, 2, None, 0.0).unwrap();
        assert!((center.x - 2.2).abs() < 1e-12);
        assert!((center.y - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_quadratic_flat_row_is_zero_flux() {
        let mut image = Image::<f64>::new(3, 3);
        image.fill(2.0);
        let err = QuadraticCentroid.compute(&image, 1, 1, None, 0.0).unwrap_err();
        assert_eq!(err, MeasError::ZeroFlux { x: 1, y: 1 });
    }

    #[test]
    fn test_factory_returns_singletons() {
        let a = create_centroider(CentroidKind::Naive).unwrap();
        let b = create_centroider(CentroidKind::Naive).unwrap();
        assert!(std::ptr::addr_eq(a, b));
        assert_eq!(a.kind(), CentroidKind::Naive);
        assert!(matches!(
            create_centroider(CentroidKind::Sdss),
            Err(MeasError::NotImplemented { .. })
        ));
    }

    #[test]
    fn test_unknown_centroider_name() {
        let err = CentroidDispatcher::new(&Registries::with_builtins(), "SDSS").unwrap_err();
        assert_eq!(
            err,
            MeasError::NotFound {
                registry: "centroid",
                name: "SDSS".to_string()
            }
        );
    }

    #[test]
    fn test_control_writes_centroid_fields() {
        let control: Box<dyn AlgorithmControl> = Box::new(CentroidControl::default());
        let mut schema = Schema::new();
        let algorithm = control.make_algorithm::<u16>(&mut schema).unwrap();

        let mut image = Image::<u16>::new(7, 7);
        image.fill(10);
        image.set(3, 3, 50);
        image.set(4, 3, 30);
        let exposure = Exposure::new(image).with_background(10.0);
        let mut record = SourceRecord::new(&schema, 1, 3, 3);
        algorithm
            .apply(&mut record, &ExposurePatch::new(&exposure, 3, 3))
            .unwrap();

        let x = schema.find::<f64>("centroid.naive.x").unwrap();
        let y = schema.find::<f64>("centroid.naive.y").unwrap();
        assert_eq!(record.get(x), 3.0 + 20.0 / 60.0);
        assert_eq!(record.get(y), 3.0);
    }
}
