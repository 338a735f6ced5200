//! facegate-core — Face gallery matching and model contracts.
//!
//! Holds the embedding types, the cosine nearest-neighbour matcher and the
//! traits behind which the external detection/recognition models sit.

pub mod extractor;
pub mod image_input;
pub mod matcher;
pub mod types;

pub use extractor::{AttributeAnalyzer, DetectionError, EmbeddingExtractor, FaceModel};
pub use image_input::{ImageInput, ImageInputError};
pub use matcher::{CosineMatcher, Matcher};
pub use types::{Embedding, FaceAttributes, FaceRecord, MatchResult};
