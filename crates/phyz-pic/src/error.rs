//! Error types for phyz-pic.

use thiserror::Error;

use crate::field::FieldComponent;

#[derive(Debug, Error)]
pub enum PicError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Non-finite {component:?} value {value} at index {index} in step {step}")]
    NumericDivergence {
        step: u64,
        component: FieldComponent,
        index: usize,
        value: f64,
    },

    #[error("Particle count changed from {before} to {after} during migration in step {step}")]
    ParticleCountMismatch { step: u64, before: u64, after: u64 },

    #[error("Particle {particle} needs {hops} cell hops, beyond the overshoot policy")]
    BoundaryViolation { particle: u64, hops: usize },

    #[error("Deposit of particle {particle} falls outside the ghost layer")]
    DepositionOutOfRange { particle: u64 },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Control point IO error: {0}")]
    ControlPointIo(#[from] std::io::Error),

    #[error("Malformed control point: {0}")]
    MalformedControlPoint(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub type Result<T> = std::result::Result<T, PicError>;
