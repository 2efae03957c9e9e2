/// Mask-derived quality flags for each source
use std::marker::PhantomData;

use crate::algorithm::{Algorithm, AlgorithmControl, ExposurePatch, PIXEL_FLAGS_ORDER};
use crate::error::Result;
use crate::image::{mask_plane, Pixel};
use crate::schema::{Key, Schema, SourceRecord};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PixelFlagControl {
    pub name: String,
    pub order: i32,
    /// Half-size of the box searched around the peak
    pub radius: i32,
}

impl Default for PixelFlagControl {
    fn default() -> Self {
        Self {
            name: "flags.pixel".to_string(),
            order: PIXEL_FLAGS_ORDER,
            radius: 2,
        }
    }
}

impl AlgorithmControl for PixelFlagControl {
    crate::control_body!();
    crate::algorithm_factory!(PixelFlagAlgorithm; u16, f32, f64);
}

/// An any/center flag pair for one mask plane
#[derive(Debug, Clone, Copy)]
struct PlaneKeys {
    bit: u16,
    any: Key<bool>,
    center: Key<bool>,
}

impl PlaneKeys {
    fn add(schema: &mut Schema, prefix: &str, plane: &str, bit: u16) -> Result<Self> {
        Ok(Self {
            bit,
            any: schema.add_field(
                &format!("{prefix}.{plane}.any"),
                &format!("{plane} pixel in the source footprint"),
            )?,
            center: schema.add_field(
                &format!("{prefix}.{plane}.center"),
                &format!("{plane} pixel at the source center"),
            )?,
        })
    }
}

pub struct PixelFlagAlgorithm<P> {
    name: String,
    radius: i32,
    edge: Key<bool>,
    bad: Key<bool>,
    planes: [PlaneKeys; 3],
    _pixel: PhantomData<fn() -> P>,
}

impl<P: Pixel> PixelFlagAlgorithm<P> {
    pub fn new(control: &PixelFlagControl, schema: &mut Schema) -> Result<Self> {
        let prefix = control.name.as_str();
        let edge = schema.add_field(
            &format!("{prefix}.edge"),
            "source is close to the edge of the image",
        )?;
        let bad = schema.add_field(&format!("{prefix}.bad"), "bad pixel in the source footprint")?;
        let planes = [
            PlaneKeys::add(schema, prefix, "interpolated", mask_plane::INTRP)?,
            PlaneKeys::add(schema, prefix, "saturated", mask_plane::SAT)?,
            PlaneKeys::add(schema, prefix, "cr", mask_plane::CR)?,
        ];
        Ok(Self {
            name: control.name.clone(),
            radius: control.radius.max(0),
            edge,
            bad,
            planes,
            _pixel: PhantomData,
        })
    }
}

impl<P: Pixel> Algorithm<P> for PixelFlagAlgorithm<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, source: &mut SourceRecord, patch: &ExposurePatch<'_, P>) -> Result<()> {
        let mask = patch.mask();
        let (x, y) = patch.peak();

        let mut edge = false;
        let mut any = 0u16;
        for py in y - self.radius..=y + self.radius {
            for px in x - self.radius..=x + self.radius {
                match mask.get_parent(px, py) {
                    Some(bits) => any |= bits,
                    None => edge = true,
                }
            }
        }
        let center = mask.get_parent(x, y).unwrap_or(0);

        source.set(self.edge, edge || any & mask_plane::EDGE != 0);
        source.set(self.bad, any & mask_plane::BAD != 0);
        for plane in &self.planes {
            source.set(plane.any, any & plane.bit != 0);
            source.set(plane.center, center & plane.bit != 0);
        }
        Ok(())
    }
}
