//! Lazy sidecar metadata cache for printable files.
//!
//! Extraction itself is pluggable; the cache only decides when a stored
//! record is still valid and where the sidecar lives. A record is keyed by
//! `(path, m_timestamp, size)` so any touch of the file invalidates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::backend::BoxedBackend;

/// Extracted print metadata. All fields optional; an all-empty record is
/// treated as "nothing extracted" and never cached.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_print_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer_height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filament_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printer_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bed_temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nozzle_temperature: Option<i64>,
    /// Thumbnails keyed by dimensions (`"220x124"`), base64 PNG payloads.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub thumbnails: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn is_empty(&self) -> bool {
        self == &MetadataRecord::default()
    }

    /// The thumbnail with the largest payload, for `FILE_INFO` previews.
    pub fn biggest_thumbnail(&self) -> Option<&str> {
        self.thumbnails
            .values()
            .max_by_key(|data| data.len())
            .map(String::as_str)
    }

    /// Decode one thumbnail back into raw image bytes.
    pub fn thumbnail_bytes(&self, dimensions: &str) -> Option<Vec<u8>> {
        let data = self.thumbnails.get(dimensions)?;
        BASE64.decode(data).ok()
    }
}

/// Pluggable parser for printer-type-specific file formats.
pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> anyhow::Result<MetadataRecord>;
}

/// Extractor that never finds anything. Default until the embedder plugs in
/// a real slicer-format parser.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopExtractor;

impl MetadataExtractor for NoopExtractor {
    fn extract(&self, _path: &Path) -> anyhow::Result<MetadataRecord> {
        Ok(MetadataRecord::default())
    }
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    path: String,
    m_timestamp: i64,
    size: u64,
    record: MetadataRecord,
}

pub struct MetadataCache {
    extractor: Box<dyn MetadataExtractor>,
}

impl MetadataCache {
    pub fn new(extractor: Box<dyn MetadataExtractor>) -> Self {
        Self { extractor }
    }

    /// `.<basename>.cache` next to the file itself.
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{base}.cache"))
    }

    /// Fetch the record for `path`, re-extracting when the sidecar is absent
    /// or stale. Returns `None` when extraction yields nothing.
    pub async fn lookup(
        &self,
        backend: &BoxedBackend,
        path: &Path,
        m_timestamp: i64,
        size: u64,
    ) -> Option<MetadataRecord> {
        if let Some(cached) = self.read_sidecar(backend, path).await {
            if cached.m_timestamp == m_timestamp
                && cached.size == size
                && cached.path == path.to_string_lossy()
            {
                return Some(cached.record);
            }
        }
        let record = match self.extractor.extract(path) {
            Ok(record) => record,
            Err(err) => {
                // Extraction failures are logged, never surfaced.
                debug!("metadata extraction failed for {}: {err}", path.display());
                return None;
            }
        };
        if record.is_empty() {
            return None;
        }
        self.write_sidecar(backend, path, m_timestamp, size, &record)
            .await;
        Some(record)
    }

    pub async fn invalidate(&self, backend: &BoxedBackend, path: &Path) {
        let sidecar = Self::sidecar_path(path);
        let _ = backend.unlink(&sidecar).await;
    }

    async fn read_sidecar(&self, backend: &BoxedBackend, path: &Path) -> Option<Sidecar> {
        let sidecar = Self::sidecar_path(path);
        let mut reader = backend.open_read(&sidecar).await.ok()?;
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    async fn write_sidecar(
        &self,
        backend: &BoxedBackend,
        path: &Path,
        m_timestamp: i64,
        size: u64,
        record: &MetadataRecord,
    ) {
        let sidecar = Sidecar {
            path: path.to_string_lossy().into_owned(),
            m_timestamp,
            size,
            record: record.clone(),
        };
        let raw = match serde_json::to_vec(&sidecar) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let target = Self::sidecar_path(path);
        match backend.open_write(&target).await {
            Ok(mut writer) => {
                if writer.write_all(&raw).await.is_err() {
                    let _ = backend.unlink(&target).await;
                } else {
                    let _ = writer.shutdown().await;
                }
            }
            Err(err) => debug!("cannot write metadata sidecar {}: {err}", target.display()),
        }
    }
}
