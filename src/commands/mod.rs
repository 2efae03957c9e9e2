pub mod coadd_psf;
pub mod measure_synthetic;

pub use coadd_psf::coadd_psf;
pub use measure_synthetic::measure_synthetic;
