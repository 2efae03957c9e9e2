/// Pixel-space geometry and world coordinate transforms
use nalgebra::{Matrix2, Point2 as NaPoint2, Vector2};

pub type Point2 = NaPoint2<f64>;

/// Position of the center of pixel `index`; pixel centers sit on integers
pub fn index_to_position(index: i32) -> f64 {
    index as f64
}

/// Integer pixel box, inclusive of `min`, `width` x `height` pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub min_x: i32,
    pub min_y: i32,
    pub width: usize,
    pub height: usize,
}

impl BoundingBox {
    pub fn new(min_x: i32, min_y: i32, width: usize, height: usize) -> Self {
        Self {
            min_x,
            min_y,
            width,
            height,
        }
    }

    pub fn max_x(&self) -> i32 {
        self.min_x + self.width as i32 - 1
    }

    pub fn max_y(&self) -> i32 {
        self.min_y + self.height as i32 - 1
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x <= self.max_x() && y >= self.min_y && y <= self.max_y()
    }

    pub fn contains_point(&self, point: &Point2) -> bool {
        point.x >= self.min_x as f64 - 0.5
            && point.x <= self.max_x() as f64 + 0.5
            && point.y >= self.min_y as f64 - 0.5
            && point.y <= self.max_y() as f64 + 0.5
    }

    /// Map a point from the parent frame into this box's local frame
    pub fn to_local(&self, x: f64, y: f64) -> Point2 {
        Point2::new(x - self.min_x as f64, y - self.min_y as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Linear tangent-plane WCS: `sky = crval + cd * (pixel - crpix)`
#[derive(Debug, Clone, PartialEq)]
pub struct AffineWcs {
    pub crpix: Point2,
    pub crval: Point2,
    pub cd: Matrix2<f64>,
}

impl AffineWcs {
    pub fn new(crpix: Point2, crval: Point2, cd: Matrix2<f64>) -> Self {
        Self { crpix, crval, cd }
    }

    /// Pure pixel-scale WCS with no rotation
    pub fn from_scale(crpix: Point2, crval: Point2, scale: f64) -> Self {
        Self::new(crpix, crval, Matrix2::new(scale, 0.0, 0.0, scale))
    }

    pub fn pixel_to_sky(&self, pixel: &Point2) -> Point2 {
        self.crval + self.cd * (pixel - self.crpix)
    }

    /// Returns None when the CD matrix is singular
    pub fn sky_to_pixel(&self, sky: &Point2) -> Option<Point2> {
        let inverse = self.cd.try_inverse()?;
        let offset: Vector2<f64> = inverse * (sky - self.crval);
        Some(self.crpix + offset)
    }

    pub fn pixel_scale(&self) -> f64 {
        self.cd.determinant().abs().sqrt()
    }
}
