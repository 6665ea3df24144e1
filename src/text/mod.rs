//! On-device text recognition, behind a narrow async interface.

use std::sync::Arc;
use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info};
use crate::image::ImageStore;

pub mod utf8;

pub use utf8::Utf8TextRecognizer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextElement {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub elements: Vec<TextElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub lines: Vec<TextLine>,
}

/// Recognized text: blocks, each made of lines, each made of elements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextResult {
    pub blocks: Vec<TextBlock>,
}

impl TextResult {
    /// Whole text, blocks separated by a newline.
    pub fn text(&self) -> String {
        self.blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn elements(&self) -> impl Iterator<Item = &TextElement> {
        self.blocks.iter().flat_map(|b| b.lines.iter()).flat_map(|l| l.elements.iter())
    }
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("failed to load image: {0:#}")]
    Image(anyhow::Error),

    #[error("image could not be decoded: {0}")]
    Decode(String),

    #[error("recognizer failed: {0}")]
    Recognizer(String),
}

#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<TextResult, RecognitionError>;
}

/// Loads an image from a store and runs it through a recognizer.
pub struct TextExtractor {
    source: Arc<dyn ImageStore>,
    recognizer: Arc<dyn TextRecognizer>,
}

impl TextExtractor {
    pub fn new(source: Arc<dyn ImageStore>, recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { source, recognizer }
    }

    pub async fn extract(&self, locator: &str) -> Result<TextResult, RecognitionError> {
        let image = self.source.read(locator).await.map_err(RecognitionError::Image)?;
        let result = self.recognizer.recognize(&image).await?;

        for block in &result.blocks {
            debug!(text = %block.text, "block");
            for line in &block.lines {
                debug!(text = %line.text, "line");
                for element in &line.elements {
                    debug!(text = %element.text, "element");
                }
            }
        }
        info!(locator, blocks = result.blocks.len(), "Text recognized");
        Ok(result)
    }
}
