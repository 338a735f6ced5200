//! Contracts for the face models the core delegates to.
//!
//! Detection, alignment and embedding inference live outside this crate.
//! Implementations take `&mut self` because inference sessions are usually
//! stateful and not shareable across threads.

use crate::image_input::ImageInput;
use crate::types::{Embedding, FaceAttributes};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Maps an image to a fixed-length identity embedding.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &ImageInput) -> Result<Embedding, DetectionError>;
}

/// Reports descriptive attributes (age, gender, emotion, ...) for a face.
pub trait AttributeAnalyzer: Send {
    fn analyze(&mut self, image: &ImageInput) -> Result<FaceAttributes, DetectionError>;
}

/// A single model backend that can do both jobs.
pub trait FaceModel: EmbeddingExtractor + AttributeAnalyzer {}

impl<T: EmbeddingExtractor + AttributeAnalyzer> FaceModel for T {}
