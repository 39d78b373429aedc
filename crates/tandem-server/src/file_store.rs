use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let relative = target
        .strip_prefix(base)
        .or_else(|_| target.strip_prefix(&canonical_base))
        .unwrap_or(target);

    let mut resolved = canonical_base.clone();
    for component in relative.components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// A single path segment supplied by a client (file name, chunk id).
fn check_segment(segment: &str) -> Result<(), ServerError> {
    if segment.is_empty()
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains("..")
    {
        return Err(ServerError::BadRequest(format!(
            "Invalid name: {segment:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Js,
    Css,
    Html,
}

impl FileType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "js" => Some(FileType::Js),
            "css" => Some(FileType::Css),
            "html" => Some(FileType::Html),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Js => "js",
            FileType::Css => "css",
            FileType::Html => "html",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileType::Js => "application/javascript",
            FileType::Css => "text/css",
            FileType::Html => "text/html",
        }
    }
}

/// A stored file registered in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: Uuid,
    pub filename: String,
    pub path: PathBuf,
    pub file_type: FileType,
    pub created_at: DateTime<Utc>,
}

impl FileInfo {
    pub fn content_type(&self) -> &'static str {
        self.file_type.content_type()
    }

    pub fn download_url(&self) -> String {
        format!("/api/files/{}/download", self.id)
    }
}

/// One slice of a chunked upload, waiting on disk for a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub file_chunk_id: String,
    pub order: u32,
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
    max_size: usize,
    files: RwLock<HashMap<Uuid, FileInfo>>,
}

impl FileStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::FileStorage(format!(
                "Failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "File store initialized");

        Ok(Self {
            base_path,
            max_size,
            files: RwLock::new(HashMap::new()),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn save(
        &self,
        content: &str,
        file_type: FileType,
        name: Option<&str>,
    ) -> Result<FileInfo, ServerError> {
        self.check_content(content)?;
        let filename = final_filename(name, file_type)?;
        let id = Uuid::new_v4();
        self.register(id, filename, file_type, content).await
    }

    pub async fn info(&self, id: Uuid) -> Option<FileInfo> {
        self.files.read().await.get(&id).cloned()
    }

    pub async fn read(&self, id: Uuid) -> Result<(FileInfo, String), ServerError> {
        let info = self.info(id).await.ok_or_else(|| ServerError::not_found(id))?;

        let content = match fs::read_to_string(&info.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::not_found(id));
            }
            Err(e) => {
                return Err(ServerError::FileStorage(format!(
                    "Failed to read file {id}: {e}"
                )))
            }
        };

        debug!(id = %id, size = content.len(), "Read file");
        Ok((info, content))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ServerError> {
        let info = self
            .files
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| ServerError::not_found(id))?;

        match fs::remove_file(&info.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(id = %id, path = %info.path.display(), "File already gone from disk");
            }
            Err(e) => {
                return Err(ServerError::FileStorage(format!(
                    "Failed to delete file {id}: {e}"
                )))
            }
        }

        info!(id = %id, filename = %info.filename, "Deleted file");
        Ok(())
    }

    /// Write one slice of a chunked upload to `<base>/<file_chunk_id>/<order>_<name>`.
    pub async fn save_chunk(
        &self,
        content: &str,
        file_type: FileType,
        file_chunk_id: &str,
        order: u32,
        name: Option<&str>,
    ) -> Result<StoredChunk, ServerError> {
        self.check_content(content)?;
        check_segment(file_chunk_id)?;
        let filename = final_filename(name, file_type)?;

        let dir = ensure_within(&self.base_path, &self.base_path.join(file_chunk_id))?;
        fs::create_dir_all(&dir).await.map_err(|e| {
            ServerError::FileStorage(format!("Failed to create chunk directory: {e}"))
        })?;

        let path = dir.join(format!("{order}_{filename}"));
        fs::write(&path, content).await.map_err(|e| {
            ServerError::FileStorage(format!("Failed to write chunk {order} of {file_chunk_id}: {e}"))
        })?;

        debug!(chunk = %file_chunk_id, order, size = content.len(), "Stored chunk");
        Ok(StoredChunk {
            file_chunk_id: file_chunk_id.to_string(),
            order,
            filename,
            path,
        })
    }

    /// Concatenate the chunks of `file_chunk_id` by ascending order into a new
    /// html file, then drop the chunk directory.
    pub async fn merge_chunks(&self, file_chunk_id: &str) -> Result<FileInfo, ServerError> {
        check_segment(file_chunk_id)?;
        let dir = ensure_within(&self.base_path, &self.base_path.join(file_chunk_id))?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServerError::FileNotFound(file_chunk_id.to_string()));
            }
            Err(e) => {
                return Err(ServerError::FileStorage(format!(
                    "Failed to list chunks of {file_chunk_id}: {e}"
                )))
            }
        };

        let mut chunks: Vec<(u32, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ServerError::FileStorage(format!("Failed to read directory entry: {e}"))
        })? {
            let name = entry.file_name();
            let order = name
                .to_str()
                .and_then(|n| n.split_once('_'))
                .and_then(|(order, _)| order.parse::<u32>().ok());
            match order {
                Some(order) => chunks.push((order, entry.path())),
                None => debug!(entry = ?name, "Skipping unrecognised chunk entry"),
            }
        }

        if chunks.is_empty() {
            return Err(ServerError::BadRequest(format!(
                "No chunks uploaded for {file_chunk_id}"
            )));
        }
        chunks.sort_by_key(|(order, _)| *order);

        let mut merged = String::new();
        for (order, path) in &chunks {
            let part = fs::read_to_string(path).await.map_err(|e| {
                ServerError::FileStorage(format!("Failed to read chunk {order}: {e}"))
            })?;
            merged.push_str(&part);
        }
        if merged.len() > self.max_size {
            return Err(ServerError::FileTooLarge {
                size: merged.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let info = self
            .register(id, format!("{id}.html"), FileType::Html, &merged)
            .await?;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!(chunk = %file_chunk_id, error = %e, "Failed to remove chunk directory");
        }

        info!(chunk = %file_chunk_id, id = %id, parts = chunks.len(), "Merged chunked upload");
        Ok(info)
    }

    /// Delete every registered file created more than `max_age` ago.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .files
            .read()
            .await
            .values()
            .filter(|info| (now - info.created_at).to_std().unwrap_or_default() > max_age)
            .map(|info| info.id)
            .collect();

        let mut cleaned = 0;
        for id in expired {
            match self.delete(id).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(id = %id, error = %e, "Failed to clean up expired file"),
            }
        }

        if cleaned > 0 {
            info!(count = cleaned, "Cleaned up expired files");
        }
        cleaned
    }

    fn check_content(&self, content: &str) -> Result<(), ServerError> {
        if content.is_empty() {
            return Err(ServerError::BadRequest("Content must not be empty".to_string()));
        }
        if content.len() > self.max_size {
            return Err(ServerError::FileTooLarge {
                size: content.len(),
                max: self.max_size,
            });
        }
        Ok(())
    }

    async fn register(
        &self,
        id: Uuid,
        filename: String,
        file_type: FileType,
        content: &str,
    ) -> Result<FileInfo, ServerError> {
        let raw = self.base_path.join(format!("{id}_{filename}"));
        let path = ensure_within(&self.base_path, &raw)?;

        fs::write(&path, content)
            .await
            .map_err(|e| ServerError::FileStorage(format!("Failed to write file {id}: {e}")))?;

        let info = FileInfo {
            id,
            filename,
            path,
            file_type,
            created_at: Utc::now(),
        };
        self.files.write().await.insert(id, info.clone());

        info!(id = %id, filename = %info.filename, size = content.len(), "Stored file");
        Ok(info)
    }
}

/// Client name (or `file_<millis>`) with the type extension appended when missing.
fn final_filename(name: Option<&str>, file_type: FileType) -> Result<String, ServerError> {
    let extension = file_type.extension();
    let base = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => {
            check_segment(name)?;
            name.to_string()
        }
        None => format!("file_{}", Utc::now().timestamp_millis()),
    };

    if base.ends_with(&format!(".{extension}")) {
        Ok(base)
    } else {
        Ok(format!("{base}.{extension}"))
    }
}
