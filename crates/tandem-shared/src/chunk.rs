//! Chunked template content transfer.
//!
//! Large template payloads are cut into fixed-size character slices so that
//! no single WebSocket frame grows unbounded. The relay forwards chunks as
//! produced; [`ContentChunker::merge`] is there for callers that need to
//! rebuild the payload on the server side.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_CHUNK_SIZE;
use crate::error::ChunkError;
use crate::types::{TemplateContent, UserId};

/// One ordered slice of a template content transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub content: String,
    pub template_id: String,
    pub from_uuid: UserId,
    pub to_uuid: UserId,
    pub path: String,
}

/// Splits and reassembles template content.
#[derive(Debug, Clone, Copy)]
pub struct ContentChunker {
    chunk_size: usize,
}

impl ContentChunker {
    /// `chunk_size` is measured in characters and clamped to at least 1.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Cut `content` into `ceil(len / chunk_size)` chunks in index order.
    ///
    /// Slices are taken on character boundaries, so multi-byte text is never
    /// split inside a code point. Empty content produces no chunks.
    pub fn split(
        &self,
        content: &TemplateContent,
        template_id: &str,
        from: UserId,
        to: UserId,
        path: &str,
    ) -> Result<Vec<ContentChunk>, ChunkError> {
        let text = content
            .to_text()
            .map_err(|e| ChunkError::Serialization(e.to_string()))?;

        let slices = char_slices(&text, self.chunk_size);
        let total = slices.len() as u32;

        Ok(slices
            .into_iter()
            .enumerate()
            .map(|(index, slice)| ContentChunk {
                chunk_index: index as u32,
                total_chunks: total,
                content: slice.to_string(),
                template_id: template_id.to_string(),
                from_uuid: from,
                to_uuid: to,
                path: path.to_string(),
            })
            .collect())
    }

    /// Reassemble a transfer. The chunks may arrive in any order but must
    /// cover exactly `0..total_chunks`.
    pub fn merge(
        &self,
        chunks: &[ContentChunk],
        parse_structured: bool,
    ) -> Result<TemplateContent, ChunkError> {
        if chunks.is_empty() {
            return Ok(if parse_structured {
                TemplateContent::Structured(serde_json::Value::Array(Vec::new()))
            } else {
                TemplateContent::Text(String::new())
            });
        }

        let mut sorted: Vec<&ContentChunk> = chunks.iter().collect();
        sorted.sort_by_key(|chunk| chunk.chunk_index);

        let total = sorted[0].total_chunks;
        if let Some(chunk) = sorted.iter().find(|c| c.total_chunks != total) {
            return Err(ChunkError::InconsistentChunks(format!(
                "chunk {} reports {} total chunks, expected {}",
                chunk.chunk_index, chunk.total_chunks, total
            )));
        }
        if let Some(chunk) = sorted.iter().find(|c| c.chunk_index >= total) {
            return Err(ChunkError::InconsistentChunks(format!(
                "chunk index {} out of range for {} chunks",
                chunk.chunk_index, total
            )));
        }
        if let Some(pair) = sorted.windows(2).find(|w| w[0].chunk_index == w[1].chunk_index) {
            return Err(ChunkError::InconsistentChunks(format!(
                "duplicate chunk index {}",
                pair[0].chunk_index
            )));
        }

        let missing: Vec<u32> = (0..total)
            .filter(|index| sorted.binary_search_by_key(index, |c| c.chunk_index).is_err())
            .collect();
        if !missing.is_empty() {
            return Err(ChunkError::IncompleteTransfer { missing });
        }

        let merged: String = sorted.iter().map(|chunk| chunk.content.as_str()).collect();

        if parse_structured {
            serde_json::from_str(&merged)
                .map(TemplateContent::Structured)
                .map_err(|e| ChunkError::Deserialization(e.to_string()))
        } else {
            Ok(TemplateContent::Text(merged))
        }
    }
}

impl Default for ContentChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Character count of the content's serialized form (0 if it cannot be
/// serialized).
pub fn content_size(content: &TemplateContent) -> usize {
    content
        .to_text()
        .map(|text| text.chars().count())
        .unwrap_or(0)
}

pub fn is_valid_json(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}

fn char_slices(text: &str, size: usize) -> Vec<&str> {
    let mut slices = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (offset, _) in text.char_indices() {
        if count == size {
            slices.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        slices.push(&text[start..]);
    }

    slices
}
