//! Single image representation handed to the face models.
//!
//! Callers may hold a file path, an encoded buffer or a browser data URL.
//! All of them are decoded here, once, into an RGB8 frame.

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageInputError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded RGB8 image.
#[derive(Debug, Clone)]
pub struct ImageInput {
    rgb: RgbImage,
}

impl ImageInput {
    /// Decode an encoded image (PNG, JPEG, ...) from memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageInputError> {
        if bytes.is_empty() {
            return Err(ImageInputError::Empty);
        }
        let decoded = image::load_from_memory(bytes)?;
        Ok(Self::from_rgb(decoded.to_rgb8()))
    }

    /// Decode a `data:image/...;base64,` URL or bare base64 text.
    pub fn from_data_url(text: &str) -> Result<Self, ImageInputError> {
        let trimmed = text.trim();
        let payload = match trimmed.split_once(',') {
            Some((header, data)) if header.starts_with("data:") => data,
            _ => trimmed,
        };
        if payload.is_empty() {
            return Err(ImageInputError::Empty);
        }
        let bytes = general_purpose::STANDARD
            .decode(payload)
            .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(payload))?;
        Self::from_bytes(&bytes)
    }

    /// Read and decode an image file.
    pub fn from_path(path: &Path) -> Result<Self, ImageInputError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self { rgb }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// Lossless PNG encoding, used when handing the frame to another process.
    pub fn to_png(&self) -> Result<Vec<u8>, ImageInputError> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(self.rgb.clone())
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(ImageInputError::Encode)?;
        Ok(buf)
    }
}
