/// Deterministic synthetic star fields
use std::sync::Arc;

use rand::prelude::*;

use crate::image::{Exposure, Image, Pixel};
use crate::psf::GaussianPsf;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStar {
    pub x: f64,
    pub y: f64,
    pub peak_brightness: f64,
    pub fwhm: f64,
}

impl SyntheticStar {
    pub fn sigma(&self) -> f64 {
        self.fwhm / 2.355
    }

    /// Nearest pixel to the true center
    pub fn peak(&self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }
}

/// Flat background with uniform noise plus Gaussian stars
#[derive(Debug, Clone)]
pub struct SyntheticField {
    pub width: usize,
    pub height: usize,
    pub background: f64,
    pub data: Vec<f64>,
    pub stars: Vec<SyntheticStar>,
    rng: StdRng,
}

impl SyntheticField {
    pub fn new(width: usize, height: usize, background: f64, noise_level: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..width * height)
            .map(|_| (background + (rng.gen::<f64>() - 0.5) * noise_level).max(0.0))
            .collect();
        Self {
            width,
            height,
            background,
            data,
            stars: Vec::new(),
            rng,
        }
    }

    /// Field with `count` stars placed at least `margin` pixels from the edges
    pub fn random(width: usize, height: usize, count: usize, seed: u64) -> Self {
        let mut field = Self::new(width, height, 1000.0, 20.0, seed);
        let margin = 12.0;
        for _ in 0..count {
            let x = field.rng.gen_range(margin..(width as f64 - margin).max(margin + 1.0));
            let y = field.rng.gen_range(margin..(height as f64 - margin).max(margin + 1.0));
            let fwhm = field.rng.gen_range(3.0..5.0);
            let brightness = field.rng.gen_range(5000.0..30000.0);
            field.add_gaussian_star(x, y, fwhm, brightness);
        }
        field
    }

    pub fn add_gaussian_star(&mut self, x: f64, y: f64, fwhm: f64, peak_brightness: f64) {
        let star = SyntheticStar {
            x,
            y,
            peak_brightness,
            fwhm,
        };
        let sigma = star.sigma();
        let radius = fwhm * 2.0;

        let x_min = (x - radius).max(0.0) as usize;
        let x_max = ((x + radius).ceil() as usize).min(self.width);
        let y_min = (y - radius).max(0.0) as usize;
        let y_max = ((y + radius).ceil() as usize).min(self.height);

        for py in y_min..y_max {
            for px in x_min..x_max {
                let dx = px as f64 - x;
                let dy = py as f64 - y;
                let distance_sq = dx * dx + dy * dy;
                self.data[py * self.width + px] +=
                    peak_brightness * (-distance_sq / (2.0 * sigma * sigma)).exp();
            }
        }
        self.stars.push(star);
    }

    /// Peak pixels of every star, as a detection step would report them
    pub fn peaks(&self) -> Vec<(i32, i32)> {
        self.stars.iter().map(|s| s.peak()).collect()
    }

    /// Mean star sigma, or 1.5 pixels for an empty field
    pub fn mean_sigma(&self) -> f64 {
        if self.stars.is_empty() {
            return 1.5;
        }
        self.stars.iter().map(|s| s.sigma()).sum::<f64>() / self.stars.len() as f64
    }

    /// Exposure in pixel type `P` with the background level and a Gaussian
    /// PSF of the mean star width attached
    pub fn to_exposure<P: Pixel>(&self) -> Exposure<P> {
        let data = self.data.iter().map(|&v| P::from_f64(v)).collect();
        let image = Image::from_vec(self.width, self.height, data)
            .unwrap_or_else(|| Image::new(self.width, self.height));
        let sigma = self.mean_sigma();
        let size = ((sigma * 8.0).ceil() as usize) | 1;
        Exposure::new(image)
            .with_background(self.background)
            .with_psf(Arc::new(GaussianPsf::new(size, size, sigma)))
    }
}
