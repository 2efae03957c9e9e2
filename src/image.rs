/// Pixel containers: typed images, mask planes and exposures
use std::fmt;
use std::sync::Arc;

use crate::geom::{AffineWcs, BoundingBox};
use crate::psf::Psf;

/// Numeric pixel representation an algorithm is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    U16,
    F32,
    F64,
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelType::U16 => "u16",
            PixelType::F32 => "f32",
            PixelType::F64 => "f64",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for PixelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "u16" | "uint16" => Ok(PixelType::U16),
            "f32" | "float" => Ok(PixelType::F32),
            "f64" | "double" => Ok(PixelType::F64),
            _ => Err(format!("Unknown pixel type: {}", s)),
        }
    }
}

/// Scalar sample type stored in an `Image`
pub trait Pixel: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const TYPE: PixelType;

    fn to_f64(self) -> f64;

    /// Saturating conversion for integer representations
    fn from_f64(value: f64) -> Self;
}

impl Pixel for u16 {
    const TYPE: PixelType = PixelType::U16;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value.round().clamp(0.0, 65535.0) as u16
    }
}

impl Pixel for f32 {
    const TYPE: PixelType = PixelType::F32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Pixel for f64 {
    const TYPE: PixelType = PixelType::F64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

/// Row-major image whose pixel (0, 0) sits at parent position (x0, y0)
#[derive(Debug, Clone, PartialEq)]
pub struct Image<P> {
    width: usize,
    height: usize,
    x0: i32,
    y0: i32,
    data: Vec<P>,
}

impl<P: Pixel> Image<P> {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            x0: 0,
            y0: 0,
            data: vec![P::default(); width * height],
        }
    }

    /// Returns None when `data` does not hold `width * height` samples
    pub fn from_vec(width: usize, height: usize, data: Vec<P>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            x0: 0,
            y0: 0,
            data,
        })
    }

    pub fn with_origin(mut self, x0: i32, y0: i32) -> Self {
        self.x0 = x0;
        self.y0 = y0;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn x0(&self) -> i32 {
        self.x0
    }

    pub fn y0(&self) -> i32 {
        self.y0
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(self.x0, self.y0, self.width, self.height)
    }

    pub fn data(&self) -> &[P] {
        &self.data
    }

    /// Local (0-based) pixel access; panics when out of bounds
    pub fn get(&self, x: usize, y: usize) -> P {
        self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: P) {
        self.data[y * self.width + x] = value;
    }

    /// Parent-frame pixel access
    pub fn get_parent(&self, x: i32, y: i32) -> Option<P> {
        let lx = x - self.x0;
        let ly = y - self.y0;
        if lx < 0 || ly < 0 || lx as usize >= self.width || ly as usize >= self.height {
            return None;
        }
        Some(self.get(lx as usize, ly as usize))
    }

    pub fn fill(&mut self, value: P) {
        self.data.iter_mut().for_each(|p| *p = value);
    }

    /// Widen every sample to f64, keeping the origin
    pub fn to_f64_image(&self) -> Image<f64> {
        Image {
            width: self.width,
            height: self.height,
            x0: self.x0,
            y0: self.y0,
            data: self.data.iter().map(|p| p.to_f64()).collect(),
        }
    }

    pub fn convert<Q: Pixel>(&self) -> Image<Q> {
        Image {
            width: self.width,
            height: self.height,
            x0: self.x0,
            y0: self.y0,
            data: self.data.iter().map(|p| Q::from_f64(p.to_f64())).collect(),
        }
    }
}

impl Image<f64> {
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|p| *p *= factor);
    }

    /// Pixel-wise `self += factor * other`, in storage order
    pub fn add_scaled(&mut self, other: &Image<f64>, factor: f64) -> crate::error::Result<()> {
        if other.dimensions() != self.dimensions() {
            return Err(crate::error::MeasError::DimensionMismatch {
                expected: self.dimensions(),
                actual: other.dimensions(),
            });
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += factor * src;
        }
        Ok(())
    }

    pub fn max_value(&self) -> f64 {
        self.data.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Pixel-type-erased read access, for code that must stay object safe
pub trait ImageAccess {
    /// Parent position of local pixel (0, 0)
    fn origin(&self) -> (i32, i32);

    fn dimensions(&self) -> (usize, usize);

    /// Local-frame sample widened to f64
    fn value(&self, x: usize, y: usize) -> f64;
}

impl<P: Pixel> ImageAccess for Image<P> {
    fn origin(&self) -> (i32, i32) {
        (self.x0, self.y0)
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn value(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x].to_f64()
    }
}

/// Mask plane bits
pub mod mask_plane {
    pub const BAD: u16 = 0x01;
    pub const SAT: u16 = 0x02;
    pub const INTRP: u16 = 0x04;
    pub const CR: u16 = 0x08;
    pub const EDGE: u16 = 0x10;
    pub const DETECTED: u16 = 0x20;
}

pub type Mask = Image<u16>;

/// Image plus its mask, background level, and optional PSF / WCS
#[derive(Debug, Clone)]
pub struct Exposure<P> {
    pub image: Image<P>,
    pub mask: Mask,
    pub background: f64,
    pub psf: Option<Arc<dyn Psf>>,
    pub wcs: Option<AffineWcs>,
}

impl<P: Pixel> Exposure<P> {
    pub fn new(image: Image<P>) -> Self {
        let mask =
            Mask::new(image.width(), image.height()).with_origin(image.x0(), image.y0());
        Self {
            image,
            mask,
            background: 0.0,
            psf: None,
            wcs: None,
        }
    }

    pub fn with_background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }

    pub fn with_psf(mut self, psf: Arc<dyn Psf>) -> Self {
        self.psf = Some(psf);
        self
    }

    pub fn with_wcs(mut self, wcs: AffineWcs) -> Self {
        self.wcs = Some(wcs);
        self
    }

    pub fn bbox(&self) -> BoundingBox {
        self.image.bbox()
    }

    /// OR `bits` into the mask at parent position (x, y)
    pub fn mask_pixel(&mut self, x: i32, y: i32, bits: u16) {
        let lx = x - self.mask.x0();
        let ly = y - self.mask.y0();
        if lx >= 0
            && ly >= 0
            && (lx as usize) < self.mask.width()
            && (ly as usize) < self.mask.height()
        {
            let current = self.mask.get(lx as usize, ly as usize);
            self.mask.set(lx as usize, ly as usize, current | bits);
        }
    }
}
