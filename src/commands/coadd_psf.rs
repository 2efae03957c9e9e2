use anyhow::{Context, Result};
use image::{ImageBuffer, Luma};
use std::path::PathBuf;
use std::sync::Arc;

use crate::coadd_psf::{Accumulation, CoaddPsf, ExposureCatalog, ExposureRecord};
use crate::geom::{AffineWcs, BoundingBox, Point2};
use crate::image::Image;
use crate::psf::{GaussianPsf, Psf};

/// Scale the image to 8 bits, peak value at 255
fn to_luma(image: &Image<f64>) -> Result<ImageBuffer<Luma<u8>, Vec<u8>>> {
    let peak = image.max_value();
    let scale = if peak > 0.0 { 255.0 / peak } else { 0.0 };
    let pixels = image
        .data()
        .iter()
        .map(|&v| (v * scale).clamp(0.0, 255.0) as u8)
        .collect();
    ImageBuffer::from_raw(image.width() as u32, image.height() as u32, pixels)
        .context("Failed to create image buffer")
}

/// Exposures offset by a few pixels from each other, each with a slightly
/// wider Gaussian than the last and a weight falling off with width
pub fn synthetic_catalog(exposures: usize, sigma: f64) -> ExposureCatalog {
    let size = ((sigma * 1.1_f64.powi(exposures as i32) * 8.0).ceil() as usize) | 1;
    let mut catalog = ExposureCatalog::with_weight_field();
    for i in 0..exposures {
        let sigma_i = sigma * 1.1_f64.powi(i as i32);
        let offset = 3 * i as i32;
        let bbox = BoundingBox::new(offset, -offset, 2048, 2048);
        let wcs = AffineWcs::from_scale(
            Point2::new(offset as f64, -offset as f64),
            Point2::new(150.0, 2.0),
            0.2 / 3600.0,
        );
        let record = ExposureRecord::new(
            i as u64 + 1,
            Arc::new(GaussianPsf::new(size, size, sigma_i)),
            wcs,
            bbox,
        )
        .with_weight(1.0 / (sigma_i * sigma_i));
        catalog.push(record);
    }
    catalog
}

pub fn coadd_psf(
    exposures: usize,
    sigma: f64,
    x: f64,
    y: f64,
    weighted: bool,
    output: Option<String>,
) -> Result<()> {
    let accumulation = if weighted {
        Accumulation::Weighted
    } else {
        Accumulation::Uniform
    };
    let catalog = synthetic_catalog(exposures, sigma);
    let coadd = CoaddPsf::new(&catalog).with_accumulation(accumulation);
    tracing::info!(
        "Coadd PSF from {} exposures ({:?} accumulation)",
        coadd.component_count(),
        accumulation
    );

    let (width, height) = catalog
        .records()
        .first()
        .map(|r| r.psf.dimensions())
        .unwrap_or((0, 0));
    let mut raw = Image::<f64>::new(width, height);
    coadd
        .compute_image_into(&mut raw, false, x, y)
        .with_context(|| format!("Failed to evaluate coadd PSF at ({}, {})", x, y))?;
    let mut normalized = raw.clone();
    normalized.scale(if raw.sum() != 0.0 { 1.0 / raw.sum() } else { 0.0 });

    println!(
        "components={} size={}x{} raw_sum={:.6} peak={:.6}",
        coadd.component_count(),
        width,
        height,
        raw.sum(),
        normalized.max_value()
    );

    if let Some(path) = output {
        let path = PathBuf::from(path);
        to_luma(&normalized)?
            .save(&path)
            .with_context(|| format!("Failed to save PNG to: {}", path.display()))?;
        println!("Saved coadd PSF image to: {}", path.display());
    }
    Ok(())
}
