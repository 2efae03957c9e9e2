pub mod algorithm;
pub mod centroid;
pub mod coadd_psf;
pub mod error;
pub mod flux;
pub mod geom;
pub mod image;
pub mod measure;
pub mod pixel;
pub mod pixel_flags;
pub mod psf;
pub mod registry;
pub mod schema;
pub mod shape;
pub mod synthetic;

pub mod cli;
pub mod commands;

// Re-export commonly used items
pub use algorithm::{Algorithm, AlgorithmControl, ExposurePatch};
pub use error::{MeasError, Result};
pub use measure::{MeasurementStage, MeasurementStageBuilder, MeasurementSummary};
pub use registry::Registries;
