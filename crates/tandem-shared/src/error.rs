use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Decode(String),

    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Content serialization failed, expected a valid JSON structure: {0}")]
    Serialization(String),

    #[error("Merged content is not valid JSON: {0}")]
    Deserialization(String),

    #[error("Incomplete transfer, missing chunk indices: {}", format_indices(.missing))]
    IncompleteTransfer { missing: Vec<u32> },

    #[error("Inconsistent chunk set: {0}")]
    InconsistentChunks(String),
}

fn format_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
