/// Error taxonomy for measurement, registry and PSF operations
use crate::image::PixelType;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MeasError {
    /// Unknown name in a registry lookup
    #[error("Unknown {registry} algorithm: {name}")]
    NotFound { registry: &'static str, name: String },

    /// Registered kind with no backing implementation
    #[error("{registry} of type {kind} is not implemented")]
    NotImplemented { registry: &'static str, kind: String },

    #[error("Algorithm {algorithm} does not support {pixel_type} pixels")]
    UnsupportedPixelType {
        algorithm: String,
        pixel_type: PixelType,
    },

    #[error("Field {0} is already defined in the schema")]
    DuplicateField(String),

    #[error("Schema field {name} is not of type {expected}")]
    FieldTypeMismatch { name: String, expected: &'static str },

    #[error("Object at ({x}, {y}) is too close to the edge of the frame")]
    OutOfRange { x: i32, y: i32 },

    #[error("Object at ({x}, {y}) has no counts")]
    ZeroFlux { x: i32, y: i32 },

    #[error("PSF cannot be evaluated at ({x}, {y}): {reason}")]
    EvaluationError { x: f64, y: f64, reason: String },

    #[error("Image dimensions {actual:?} do not match expected {expected:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Algorithm {0} requires a PSF but the exposure has none")]
    MissingPsf(String),
}

pub type Result<T> = std::result::Result<T, MeasError>;
