use async_trait::async_trait;
use crate::text::{RecognitionError, TextBlock, TextElement, TextLine, TextRecognizer, TextResult};

/// Recognizer for payloads that already carry text. Blocks are separated by
/// blank lines, elements by whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8TextRecognizer;

impl Utf8TextRecognizer {
    pub fn parse(text: &str) -> TextResult {
        let mut blocks = Vec::new();
        let mut lines: Vec<TextLine> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                if !lines.is_empty() {
                    blocks.push(Self::block(std::mem::take(&mut lines)));
                }
                continue;
            }
            lines.push(TextLine {
                text: line.to_string(),
                elements: line
                    .split_whitespace()
                    .map(|w| TextElement { text: w.to_string() })
                    .collect(),
            });
        }
        if !lines.is_empty() {
            blocks.push(Self::block(lines));
        }
        TextResult { blocks }
    }

    fn block(lines: Vec<TextLine>) -> TextBlock {
        let text = lines.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join("\n");
        TextBlock { text, lines }
    }
}

#[async_trait]
impl TextRecognizer for Utf8TextRecognizer {
    async fn recognize(&self, image: &[u8]) -> Result<TextResult, RecognitionError> {
        let text = std::str::from_utf8(image).map_err(|e| RecognitionError::Decode(e.to_string()))?;
        Ok(Self::parse(text))
    }
}
