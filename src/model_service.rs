use ndarray::{Array4, ArrayD};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("ONNX runtime error: {0}")]
    Runtime(#[from] ort::Error),
    #[error("Session mutex poisoned: {0}")]
    SessionPoisoned(String),
    #[error("Invalid tensor shape: {0}")]
    Shape(String),
}

/// A loaded classifier. Implementations must be safe to share read-only
/// between request handlers.
pub trait ModelService: Send + Sync + 'static {
    fn predict(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, ModelError>;
}
