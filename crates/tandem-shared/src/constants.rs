/// Application name
pub const APP_NAME: &str = "Tandem";

/// Default slice size for template content transfers, in characters
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Default number of chat messages returned by a history lookup
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default outbound queue depth per connection, in frames
pub const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3000;

/// Maximum stored file size in bytes (50 MiB)
pub const MAX_FILE_SIZE: usize = 50 * 1024 * 1024;

/// Files older than this are purged by the cleanup task (24 h)
pub const DEFAULT_FILE_MAX_AGE_SECS: u64 = 24 * 60 * 60;
