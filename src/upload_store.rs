use crate::config::UploadConfig;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

const FALLBACK_NAME: &str = "upload";
/// Keeps `<uuid>-<name>` within the 255-byte file name limit.
const MAX_NAME_BYTES: usize = 200;
const MAX_EXTENSION_BYTES: usize = 16;

/// Directory that receives uploaded files before they are processed.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    retain: bool,
}

impl UploadStore {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            retain: config.retain,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `bytes` under a unique name derived from the client filename.
    /// The directory is created on first use.
    pub async fn persist(&self, filename: &str, bytes: &[u8]) -> io::Result<StoredUpload> {
        self.persist_from(filename, bytes).await
    }

    /// Streams `reader` into a new upload file. A partially written file is
    /// removed when the copy fails, whatever the retention policy.
    pub async fn persist_from<R>(&self, filename: &str, mut reader: R) -> io::Result<StoredUpload>
    where
        R: AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut stored = StoredUpload {
            path: self
                .dir
                .join(format!("{}-{}", Uuid::new_v4(), sanitize_filename(filename))),
            retain: false,
        };

        let mut file = tokio::fs::File::create(&stored.path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);
        tracing::debug!("Stored upload {:?} ({} bytes)", stored.path, written);

        stored.retain = self.retain;
        Ok(stored)
    }
}

/// A file written by [`UploadStore::persist`]. Removed on drop unless the
/// store retains uploads. Removal is blocking, so drop it off the async
/// workers.
#[derive(Debug)]
pub struct StoredUpload {
    path: PathBuf,
    retain: bool,
}

impl StoredUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        if self.retain {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove upload {:?}: {}", self.path, e),
        }
    }
}

/// Keeps only the last path component and replaces anything outside
/// `[A-Za-z0-9._-]` so the result can never leave the upload directory.
/// Long names are shortened, keeping a short extension.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        truncate_name(cleaned)
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }

    let extension = name
        .rfind('.')
        .map(|dot| &name[dot..])
        .filter(|ext| ext.len() <= MAX_EXTENSION_BYTES)
        .unwrap_or_default();
    let stem = &name[..name.len() - extension.len()];

    let mut end = MAX_NAME_BYTES - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], extension)
}
