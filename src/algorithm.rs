/// Measurement algorithms and their control objects
///
/// A control carries an algorithm's configuration and doubles as its factory.
/// Generic callers ask a `&dyn AlgorithmControl` for an algorithm bound to a
/// pixel type and never see the concrete algorithm types. Concrete controls
/// implement one factory method per pixel type they support, usually through
/// `algorithm_factory!`.
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{MeasError, Result};
use crate::geom::Point2;
use crate::image::{Exposure, Image, Mask, Pixel, PixelType};
use crate::psf::Psf;
use crate::schema::{Schema, SourceRecord};

/// Conventional `order` bands
pub const PIXEL_FLAGS_ORDER: i32 = 0;
pub const CENTROID_ORDER: i32 = 50;
pub const SHAPE_ORDER: i32 = 150;
pub const FLUX_ORDER: i32 = 250;

/// Read-only view of the exposure around one source
#[derive(Debug, Clone, Copy)]
pub struct ExposurePatch<'a, P> {
    exposure: &'a Exposure<P>,
    peak_x: i32,
    peak_y: i32,
}

impl<'a, P: Pixel> ExposurePatch<'a, P> {
    pub fn new(exposure: &'a Exposure<P>, peak_x: i32, peak_y: i32) -> Self {
        Self {
            exposure,
            peak_x,
            peak_y,
        }
    }

    pub fn for_source(exposure: &'a Exposure<P>, source: &SourceRecord) -> Self {
        Self::new(exposure, source.peak_x, source.peak_y)
    }

    pub fn image(&self) -> &'a Image<P> {
        &self.exposure.image
    }

    pub fn mask(&self) -> &'a Mask {
        &self.exposure.mask
    }

    pub fn psf(&self) -> Option<&'a Arc<dyn Psf>> {
        self.exposure.psf.as_ref()
    }

    pub fn background(&self) -> f64 {
        self.exposure.background
    }

    pub fn peak(&self) -> (i32, i32) {
        (self.peak_x, self.peak_y)
    }

    pub fn peak_position(&self) -> Point2 {
        Point2::new(self.peak_x as f64, self.peak_y as f64)
    }

    pub fn origin(&self) -> (i32, i32) {
        (self.exposure.image.x0(), self.exposure.image.y0())
    }
}

/// An executable measurement bound to one pixel type
///
/// `apply` may run concurrently for different sources and must only write
/// the fields the algorithm declared when it was built.
pub trait Algorithm<P: Pixel>: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, source: &mut SourceRecord, patch: &ExposurePatch<'_, P>) -> Result<()>;
}

pub trait AlgorithmControl: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Relative position among algorithms run on the same source
    fn order(&self) -> i32;

    /// Deep copy preserving the concrete control type
    fn clone_control(&self) -> Box<dyn AlgorithmControl>;

    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn make_algorithm_u16(&self, _schema: &mut Schema) -> Result<Box<dyn Algorithm<u16>>> {
        Err(unsupported(self.name(), PixelType::U16))
    }

    fn make_algorithm_f32(&self, _schema: &mut Schema) -> Result<Box<dyn Algorithm<f32>>> {
        Err(unsupported(self.name(), PixelType::F32))
    }

    fn make_algorithm_f64(&self, _schema: &mut Schema) -> Result<Box<dyn Algorithm<f64>>> {
        Err(unsupported(self.name(), PixelType::F64))
    }
}

fn unsupported(name: &str, pixel_type: PixelType) -> MeasError {
    MeasError::UnsupportedPixelType {
        algorithm: name.to_string(),
        pixel_type,
    }
}

impl dyn AlgorithmControl {
    /// Build the algorithm for pixel type `P`, adding its output fields to
    /// `schema`
    pub fn make_algorithm<P: MeasurablePixel>(
        &self,
        schema: &mut Schema,
    ) -> Result<Box<dyn Algorithm<P>>> {
        P::make_algorithm(self, schema)
    }

    pub fn downcast_ref<T: AlgorithmControl>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl Clone for Box<dyn AlgorithmControl> {
    fn clone(&self) -> Self {
        self.clone_control()
    }
}

/// Pixel types a control can manufacture algorithms for
pub trait MeasurablePixel: Pixel {
    fn make_algorithm(
        control: &dyn AlgorithmControl,
        schema: &mut Schema,
    ) -> Result<Box<dyn Algorithm<Self>>>;
}

impl MeasurablePixel for u16 {
    fn make_algorithm(
        control: &dyn AlgorithmControl,
        schema: &mut Schema,
    ) -> Result<Box<dyn Algorithm<Self>>> {
        control.make_algorithm_u16(schema)
    }
}

impl MeasurablePixel for f32 {
    fn make_algorithm(
        control: &dyn AlgorithmControl,
        schema: &mut Schema,
    ) -> Result<Box<dyn Algorithm<Self>>> {
        control.make_algorithm_f32(schema)
    }
}

impl MeasurablePixel for f64 {
    fn make_algorithm(
        control: &dyn AlgorithmControl,
        schema: &mut Schema,
    ) -> Result<Box<dyn Algorithm<Self>>> {
        control.make_algorithm_f64(schema)
    }
}

/// Implement `name`, `order`, `clone_control` and `as_any` for a control
/// struct with `name: String` and `order: i32` fields
#[macro_export]
macro_rules! control_body {
    () => {
        fn name(&self) -> &str {
            &self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn clone_control(&self) -> Box<dyn $crate::algorithm::AlgorithmControl> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    };
}

/// Implement the per-pixel factory methods of a control by calling
/// `$alg::<P>::new(&control, &mut schema)` for each listed pixel type
#[macro_export]
macro_rules! algorithm_factory {
    ($alg:ident; $($pixel:ident),+) => {
        $( $crate::algorithm_factory!(@pixel $alg, $pixel); )+
    };
    (@pixel $alg:ident, u16) => {
        fn make_algorithm_u16(
            &self,
            schema: &mut $crate::schema::Schema,
        ) -> $crate::error::Result<Box<dyn $crate::algorithm::Algorithm<u16>>> {
            Ok(Box::new($alg::<u16>::new(self, schema)?))
        }
    };
    (@pixel $alg:ident, f32) => {
        fn make_algorithm_f32(
            &self,
            schema: &mut $crate::schema::Schema,
        ) -> $crate::error::Result<Box<dyn $crate::algorithm::Algorithm<f32>>> {
            Ok(Box::new($alg::<f32>::new(self, schema)?))
        }
    };
    (@pixel $alg:ident, f64) => {
        fn make_algorithm_f64(
            &self,
            schema: &mut $crate::schema::Schema,
        ) -> $crate::error::Result<Box<dyn $crate::algorithm::Algorithm<f64>>> {
            Ok(Box::new($alg::<f64>::new(self, schema)?))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Key;
    use std::marker::PhantomData;

    /// Writes the peak pixel value
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct PeakValueControl {
        name: String,
        order: i32,
    }

    impl Default for PeakValueControl {
        fn default() -> Self {
            Self {
                name: "test.peak".to_string(),
                order: 42,
            }
        }
    }

    struct PeakValue<P> {
        name: String,
        key: Key<f64>,
        _pixel: PhantomData<fn() -> P>,
    }

    impl<P: Pixel> PeakValue<P> {
        fn new(control: &PeakValueControl, schema: &mut Schema) -> Result<Self> {
            Ok(Self {
                name: control.name.clone(),
                key: schema.add_field(&format!("{}.value", control.name), "peak value")?,
                _pixel: PhantomData,
            })
        }
    }

    impl<P: Pixel> Algorithm<P> for PeakValue<P> {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply(&self, source: &mut SourceRecord, patch: &ExposurePatch<'_, P>) -> Result<()> {
            let (x, y) = patch.peak();
            let value = patch
                .image()
                .get_parent(x, y)
                .ok_or(MeasError::OutOfRange { x, y })?;
            source.set(self.key, value.to_f64());
            Ok(())
        }
    }

    impl AlgorithmControl for PeakValueControl {
        crate::control_body!();
        crate::algorithm_factory!(PeakValue; f32, f64);
    }

    #[test]
    fn test_clone_preserves_kind_name_and_order() {
        let control: Box<dyn AlgorithmControl> = Box::new(PeakValueControl::default());
        let copy = control.clone();
        assert_eq!(copy.name(), control.name());
        assert_eq!(copy.order(), control.order());
        assert_eq!(copy.type_name(), control.type_name());
        assert_eq!(
            copy.downcast_ref::<PeakValueControl>(),
            Some(&PeakValueControl::default())
        );
    }

    #[test]
    fn test_make_algorithm_extends_schema() {
        let control: Box<dyn AlgorithmControl> = Box::new(PeakValueControl::default());
        let mut schema = Schema::new();
        let algorithm = control.make_algorithm::<f32>(&mut schema).unwrap();
        assert_eq!(algorithm.name(), "test.peak");
        assert!(schema.contains("test.peak.value"));

        let mut image = Image::<f32>::new(5, 5);
        image.set(2, 3, 11.5);
        let exposure = Exposure::new(image);
        let mut record = SourceRecord::new(&schema, 1, 2, 3);
        let patch = ExposurePatch::new(&exposure, 2, 3);
        algorithm.apply(&mut record, &patch).unwrap();
        let key = schema.find::<f64>("test.peak.value").unwrap();
        assert_eq!(record.get(key), 11.5);
    }

    #[test]
    fn test_unsupported_pixel_type() {
        let control: Box<dyn AlgorithmControl> = Box::new(PeakValueControl::default());
        let mut schema = Schema::new();
        let err = control.make_algorithm::<u16>(&mut schema).err().unwrap();
        assert_eq!(
            err,
            MeasError::UnsupportedPixelType {
                algorithm: "test.peak".to_string(),
                pixel_type: PixelType::U16,
            }
        );
        assert!(schema.is_empty());
    }

    #[test]
    fn test_second_algorithm_with_same_fields_fails_at_construction() {
        let control: Box<dyn AlgorithmControl> = Box::new(PeakValueControl::default());
        let mut schema = Schema::new();
        control.make_algorithm::<f64>(&mut schema).unwrap();
        let err = control.make_algorithm::<f64>(&mut schema).err().unwrap();
        assert_eq!(err, MeasError::DuplicateField("test.peak.value".to_string()));
    }
}
