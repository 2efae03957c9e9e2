/// Second-moment shapes from the pixels inside a circular aperture
///
/// The aperture is centered on the centroid written earlier in the same
/// record, so this algorithm must run after the centroid it names.
use std::marker::PhantomData;

use nalgebra::Complex;

use crate::algorithm::{Algorithm, AlgorithmControl, ExposurePatch, SHAPE_ORDER};
use crate::error::{MeasError, Result};
use crate::image::{mask_plane, Pixel};
use crate::pixel::{sub_pixel_list, PixelList, PixelSample, FLAG_LT10PIX};
use crate::schema::{Key, Schema, SourceRecord};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MomentShapeControl {
    pub name: String,
    pub order: i32,
    /// Prefix of the `<prefix>.x` / `<prefix>.y` centroid fields; the peak
    /// pixel is used when unset
    pub centroid: Option<String>,
    /// Aperture radius in pixels
    pub aperture: f64,
    /// Only the nearest `max_pixels` samples contribute
    pub max_pixels: Option<usize>,
    /// Draw pixel lists from the shared sample pool
    pub use_pool: bool,
}

impl Default for MomentShapeControl {
    fn default() -> Self {
        Self {
            name: "shape.moments".to_string(),
            order: SHAPE_ORDER,
            centroid: Some("centroid.naive".to_string()),
            aperture: 5.0,
            max_pixels: None,
            use_pool: false,
        }
    }
}

impl AlgorithmControl for MomentShapeControl {
    crate::control_body!();
    crate::algorithm_factory!(MomentShape; u16, f32, f64);
}

/// Keys of previously measured `<prefix>.x` / `<prefix>.y`
#[derive(Debug, Clone, Copy)]
pub(crate) struct CentroidKeys {
    x: Key<f64>,
    y: Key<f64>,
}

impl CentroidKeys {
    pub(crate) fn find(schema: &Schema, prefix: Option<&str>) -> Result<Option<Self>> {
        match prefix {
            Some(prefix) => Ok(Some(Self {
                x: schema.find(&format!("{prefix}.x"))?,
                y: schema.find(&format!("{prefix}.y"))?,
            })),
            None => Ok(None),
        }
    }

    /// Measured centroid, or the peak pixel when missing or not finite
    pub(crate) fn position(
        keys: Option<Self>,
        source: &SourceRecord,
        peak: (i32, i32),
    ) -> (f64, f64) {
        let peak_position = (peak.0 as f64, peak.1 as f64);
        match keys {
            Some(keys) => {
                let (x, y) = (source.get(keys.x), source.get(keys.y));
                if x.is_finite() && y.is_finite() {
                    (x, y)
                } else {
                    peak_position
                }
            }
            None => peak_position,
        }
    }
}

pub struct MomentShape<P> {
    name: String,
    aperture: f64,
    max_pixels: Option<usize>,
    use_pool: bool,
    centroid: Option<CentroidKeys>,
    xx: Key<f64>,
    yy: Key<f64>,
    xy: Key<f64>,
    npix: Key<i32>,
    lt10pix: Key<bool>,
    _pixel: PhantomData<fn() -> P>,
}

impl<P: Pixel> MomentShape<P> {
    pub fn new(control: &MomentShapeControl, schema: &mut Schema) -> Result<Self> {
        let centroid = CentroidKeys::find(schema, control.centroid.as_deref())?;
        let name = &control.name;
        Ok(Self {
            name: name.clone(),
            aperture: control.aperture,
            max_pixels: control.max_pixels,
            use_pool: control.use_pool,
            centroid,
            xx: schema.add_field(&format!("{name}.xx"), "second moment in x (pixels^2)")?,
            yy: schema.add_field(&format!("{name}.yy"), "second moment in y (pixels^2)")?,
            xy: schema.add_field(&format!("{name}.xy"), "cross moment (pixels^2)")?,
            npix: schema.add_field(&format!("{name}.npix"), "pixels inside the aperture")?,
            lt10pix: schema.add_field(
                &format!("{name}.lt10pix"),
                "fewer than 10 pixels inside the aperture",
            )?,
            _pixel: PhantomData,
        })
    }

    fn new_list(&self) -> PixelList {
        let mut list = PixelList::new();
        if self.use_pool {
            list.use_pool();
        }
        list
    }

    /// Background-subtracted samples of the box enclosing the aperture,
    /// positioned relative to the peak pixel
    fn collect_pixels(&self, patch: &ExposurePatch<'_, P>, all: &mut PixelList) {
        let (peak_x, peak_y) = patch.peak();
        let image = patch.image();
        let mask = patch.mask();
        let background = patch.background();
        let half = self.aperture.ceil() as i32 + 1;
        let side = (2 * half + 1) as usize;
        all.reserve(side * side);

        for py in peak_y - half..=peak_y + half {
            for px in peak_x - half..=peak_x + half {
                let Some(value) = image.get_parent(px, py) else {
                    continue;
                };
                if mask.get_parent(px, py).unwrap_or(0) & mask_plane::BAD != 0 {
                    continue;
                }
                let value = value.to_f64();
                all.push(PixelSample::new(
                    (px - peak_x) as f64,
                    (py - peak_y) as f64,
                    value - background,
                    1.0 / value.max(1.0).sqrt(),
                ));
            }
        }
    }
}

impl<P: Pixel> Algorithm<P> for MomentShape<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, source: &mut SourceRecord, patch: &ExposurePatch<'_, P>) -> Result<()> {
        let (peak_x, peak_y) = patch.peak();
        let (cx, cy) = CentroidKeys::position(self.centroid, source, (peak_x, peak_y));
        let cen_offset = Complex::new(cx - peak_x as f64, cy - peak_y as f64);

        let mut all = self.new_list();
        self.collect_pixels(patch, &mut all);
        all.sort(cen_offset);

        let mut pix = self.new_list();
        let no_shear = Complex::new(0.0, 0.0);
        let flags = sub_pixel_list(&mut pix, &all, cen_offset, no_shear, self.aperture);
        if let Some(max) = self.max_pixels {
            if pix.len() > max {
                pix.resize(max);
            }
        }

        let (mut sum, mut sum_xx, mut sum_yy, mut sum_xy) = (0.0, 0.0, 0.0, 0.0);
        for sample in pix.iter() {
            let z = sample.pos();
            let f = sample.flux();
            sum += f;
            sum_xx += f * z.re * z.re;
            sum_yy += f * z.im * z.im;
            sum_xy += f * z.re * z.im;
        }
        if sum <= 0.0 {
            return Err(MeasError::ZeroFlux {
                x: peak_x,
                y: peak_y,
            });
        }

        source.set(self.xx, sum_xx / sum);
        source.set(self.yy, sum_yy / sum);
        source.set(self.xy, sum_xy / sum);
        source.set(self.npix, pix.len() as i32);
        source.set(self.lt10pix, flags & FLAG_LT10PIX != 0);
        Ok(())
    }
}
