use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "starmeasure")]
#[command(about = "Per-source measurement of centroids, shapes and PSF fluxes", long_about = None)]
pub struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render a synthetic star field and measure every star
    MeasureSynthetic {
        /// Number of stars to render
        #[arg(long, default_value = "25")]
        stars: usize,

        /// Image width and height in pixels
        #[arg(long, default_value = "256")]
        size: usize,

        /// Random seed for the field
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Pixel type the algorithms run on (u16, f32, f64)
        #[arg(long, default_value = "f32")]
        pixel_type: String,

        /// Build shape pixel lists from the shared sample pool
        #[arg(long)]
        pool: bool,
    },

    /// Stack Gaussian PSFs from several exposures into a coadd PSF image
    CoaddPsf {
        /// Number of contributing exposures
        #[arg(long, default_value = "4")]
        exposures: usize,

        /// Gaussian sigma of the first exposure; later ones widen by 10% each
        #[arg(long, default_value = "1.5")]
        sigma: f64,

        /// Query position in coadd pixels
        #[arg(long, default_value = "100.0")]
        x: f64,

        #[arg(long, default_value = "100.0")]
        y: f64,

        /// Apply per-exposure weights while stacking
        #[arg(long)]
        weighted: bool,

        /// Write the stacked image as PNG
        #[arg(short, long)]
        output: Option<String>,
    },
}
