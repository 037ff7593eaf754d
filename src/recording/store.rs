//! Recording persistence.
//!
//! One pretty-printed JSON document per interaction. Timestamps are already
//! offsets from request start (see [`crate::recording::clock`]), bodies are
//! base64 and headers are ordered `[name, value]` pairs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

use crate::recording::interaction::Interaction;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid recording document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported recording format version {0}")]
    UnsupportedVersion(u32),

    #[error("Refusing to persist an unsealed interaction")]
    Unsealed,
}

/// Top-level document written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingDocument {
    pub format_version: u32,
    /// Wall-clock time the file was written, for humans only.
    pub recorded_at_unix_ms: u64,
    pub interaction: Interaction,
}

/// A flat directory of recording files.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    directory: PathBuf,
}

impl RecordingStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// `<temp>/llm-replay-proxy/recordings`.
    pub fn default_directory() -> PathBuf {
        std::env::temp_dir().join("llm-replay-proxy").join("recordings")
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Collision-resistant file name derived from the wall clock.
    pub fn file_name(unix_ms: u64) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("interaction-{}-{}.json", unix_ms, &suffix[..8])
    }

    /// Persist a sealed interaction. Returns the written path.
    pub async fn save(&self, interaction: &Interaction) -> Result<PathBuf, StoreError> {
        if !interaction.is_sealed() {
            return Err(StoreError::Unsealed);
        }

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| StoreError::Io {
                path: self.directory.clone(),
                source,
            })?;

        let recorded_at_unix_ms = unix_millis();
        let document = RecordingDocument {
            format_version: FORMAT_VERSION,
            recorded_at_unix_ms,
            interaction: interaction.clone(),
        };
        let json = serde_json::to_vec_pretty(&document)?;

        let path = self.directory.join(Self::file_name(recorded_at_unix_ms));
        let partial = path.with_extension("json.partial");
        tokio::fs::write(&partial, &json)
            .await
            .map_err(|source| StoreError::Io {
                path: partial.clone(),
                source,
            })?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), bytes = json.len(), "Recording written");
        Ok(path)
    }

    /// Read a recording file.
    pub async fn load(path: &Path) -> Result<Arc<Interaction>, StoreError> {
        let raw = tokio::fs::read(path).await.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(&raw)
    }

    /// Decode a recording document from bytes.
    pub fn decode(raw: &[u8]) -> Result<Arc<Interaction>, StoreError> {
        let document: RecordingDocument = serde_json::from_slice(raw)?;
        if document.format_version != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(document.format_version));
        }
        Ok(Arc::new(document.interaction))
    }

    /// Recording files in this directory, oldest first.
    pub async fn list(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.directory.clone(),
                    source,
                })
            }
        };

        let mut paths = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: self.directory.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            let is_recording = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("interaction-") && n.ends_with(".json"));
            if is_recording {
                paths.push(path);
            }
        }
        // Names embed the write time, so lexical order is close to
        // chronological within the same digit count.
        paths.sort();
        Ok(paths)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
