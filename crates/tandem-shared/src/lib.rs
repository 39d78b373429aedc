// Wire protocol, identifiers and content chunking shared by the Tandem relay.

pub mod chunk;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use chunk::{ContentChunk, ContentChunker};
pub use error::{ChunkError, ProtocolError};
pub use protocol::{InboundEvent, OutboundEvent};
pub use types::{ConnectionId, TemplateContent, UserId};
