use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face embedding vector. Length is fixed by the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "vgg-face").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero-length
    /// vector on either side yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Multiply every component by `factor`.
    pub fn scaled(&self, factor: f32) -> Embedding {
        Embedding {
            values: self.values.iter().map(|v| v * factor).collect(),
            model_version: self.model_version.clone(),
        }
    }
}

/// An enrolled identity as stored in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// Best gallery hit for a query embedding. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub name: String,
    /// Cosine similarity of the best match.
    pub confidence: f32,
    /// ID of the matched record.
    pub record_id: String,
}

/// Descriptive attributes reported by an attribute analyzer.
///
/// Informational only: nothing in matching or registration reads these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    #[serde(default)]
    pub age: Option<f32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub ethnicity: Option<String>,
    /// Detector confidence for the analyzed face.
    #[serde(default)]
    pub confidence: f32,
}
