// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Local chunk directory: naming, time-range lookup and retention

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// A finalized chunk found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub path: PathBuf,
    pub filename: String,
    pub device: String,
    pub source: String,
    /// Chunk start, milliseconds since the Unix epoch
    pub started_at_ms: i64,
    pub size_bytes: u64,
}

/// Answer to a retention query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub chunk_count: usize,
}

/// Parsed `<device>_<source>_<unixMicros>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub device: String,
    pub source: String,
    pub started_at_us: i64,
    pub extension: String,
}

/// Whether a chunk covering `[started_at, started_at + duration)` overlaps
/// `[start, end)`. Touching intervals do not overlap.
pub fn overlaps(started_at_ms: i64, duration_ms: i64, start_ms: i64, end_ms: i64) -> bool {
    started_at_ms < end_ms && started_at_ms.saturating_add(duration_ms) > start_ms
}

// Underscores separate name fields
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '_' | '/' | '\\' | '.' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect()
}

impl ChunkName {
    pub fn new(device: &str, source: &str, started_at_us: i64, extension: &str) -> Self {
        Self {
            device: sanitize(device),
            source: sanitize(source),
            started_at_us,
            extension: extension.to_string(),
        }
    }

    pub fn parse(filename: &str) -> Option<Self> {
        let (stem, extension) = filename.rsplit_once('.')?;
        let mut parts = stem.splitn(3, '_');
        let device = parts.next()?;
        let source = parts.next()?;
        let started_at_us = parts.next()?.parse::<i64>().ok()?;
        if device.is_empty() || source.is_empty() {
            return None;
        }
        Some(Self {
            device: device.to_string(),
            source: source.to_string(),
            started_at_us,
            extension: extension.to_string(),
        })
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_us.div_euclid(1000)
    }

    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}.{}",
            self.device, self.source, self.started_at_us, self.extension
        )
    }
}

/// Directory of recorded chunks for one device
pub struct ChunkStore {
    base_path: PathBuf,
    device_id: String,
}

impl ChunkStore {
    pub fn new(base_path: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        let base_path = base_path.into();
        info!("Chunk store at: {}", base_path.display());
        Self {
            base_path,
            device_id: device_id.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Ensure base directory exists
    pub async fn initialize(&self) -> Result<()> {
        if !self.base_path.exists() {
            info!("Creating chunk directory: {}", self.base_path.display());
            fs::create_dir_all(&self.base_path)
                .await
                .context("Failed to create chunk directory")?;
        }
        Ok(())
    }

    /// Path for a new chunk. Does not touch the filesystem.
    pub fn chunk_path(&self, source: &str, started_at_us: i64, extension: &str) -> PathBuf {
        let name = ChunkName::new(&self.device_id, source, started_at_us, extension);
        self.base_path.join(name.filename())
    }

    /// All chunks on disk, oldest first. Files that don't follow the
    /// naming scheme are ignored.
    pub async fn list(&self) -> Result<Vec<StoredChunk>> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to list {}", self.base_path.display())
                })
            }
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("Failed to read entry")? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = ChunkName::parse(&filename) else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Skipping {}: {}", filename, e);
                    continue;
                }
            };
            chunks.push(StoredChunk {
                path: entry.path(),
                filename,
                started_at_ms: name.started_at_ms(),
                device: name.device,
                source: name.source,
                size_bytes: metadata.len(),
            });
        }

        chunks.sort_by(|a, b| {
            a.started_at_ms
                .cmp(&b.started_at_ms)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(chunks)
    }

    /// Chunks overlapping `[start_ms, end_ms)` given the chunk duration
    pub async fn chunks_in_range(
        &self,
        start_ms: i64,
        end_ms: i64,
        chunk_duration: Duration,
    ) -> Result<Vec<StoredChunk>> {
        let duration_ms = i64::try_from(chunk_duration.as_millis()).unwrap_or(i64::MAX);
        let chunks = self.list().await?;
        Ok(chunks
            .into_iter()
            .filter(|c| overlaps(c.started_at_ms, duration_ms, start_ms, end_ms))
            .collect())
    }

    pub async fn usage(&self, max_bytes: u64) -> Result<StorageUsage> {
        let chunks = self.list().await?;
        Ok(StorageUsage {
            used_bytes: chunks.iter().map(|c| c.size_bytes).sum(),
            max_bytes,
            chunk_count: chunks.len(),
        })
    }

    /// Delete the oldest chunks until the total is within `max_bytes`.
    /// Chunks for which `keep` holds (files still being written, queued
    /// uploads) are never removed. `keep` is asked after listing.
    pub async fn enforce_ceiling<F>(&self, max_bytes: u64, keep: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&Path) -> bool,
    {
        let chunks = self.list().await?;
        let mut used: u64 = chunks.iter().map(|c| c.size_bytes).sum();
        let mut removed = Vec::new();

        for chunk in chunks {
            if used <= max_bytes {
                break;
            }
            if keep(&chunk.path) {
                continue;
            }
            match fs::remove_file(&chunk.path).await {
                Ok(()) => {
                    used = used.saturating_sub(chunk.size_bytes);
                    info!(
                        "Retention removed {} ({} bytes), {} bytes in use",
                        chunk.filename, chunk.size_bytes, used
                    );
                    removed.push(chunk.path);
                }
                Err(e) => warn!("Failed to remove {}: {}", chunk.path.display(), e),
            }
        }

        if used > max_bytes {
            warn!(
                "Storage still above ceiling: {} > {} bytes",
                used, max_bytes
            );
        }
        Ok(removed)
    }

    pub async fn health_check(&self) -> Result<bool> {
        // Check if base directory is accessible and writable
        match fs::metadata(&self.base_path).await {
            Ok(metadata) if metadata.is_dir() => {
                let test_file = self.base_path.join(".health_check_test");
                match fs::File::create(&test_file).await {
                    Ok(mut f) => {
                        if let Err(e) = f.write_all(b"test").await {
                            warn!("Health check failed - cannot write: {}", e);
                            return Ok(false);
                        }
                        let _ = fs::remove_file(&test_file).await;
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Health check failed - cannot create file: {}", e);
                        Ok(false)
                    }
                }
            }
            Ok(_) => {
                warn!(
                    "Health check failed - not a directory: {}",
                    self.base_path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access {}: {}",
                    self.base_path.display(),
                    e
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_name_roundtrip_keeps_fields() {
        let name = ChunkName::new("pixel_7", "front", 1_700_000_000_123_456, "mcap");
        let filename = name.filename();
        assert_eq!(filename, "pixel-7_front_1700000000123456.mcap");

        let parsed = ChunkName::parse(&filename).unwrap();
        assert_eq!(parsed, name);
        assert_eq!(parsed.started_at_ms(), 1_700_000_000_123);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(ChunkName::parse(".health_check_test").is_none());
        assert!(ChunkName::parse("notes.txt").is_none());
        assert!(ChunkName::parse("dev_src_abc.mcap").is_none());
    }

    #[test]
    fn test_overlap_boundaries() {
        // chunk covers [100, 130)
        assert!(overlaps(100, 30, 120, 200));
        assert!(overlaps(100, 30, 0, 101));
        assert!(!overlaps(100, 30, 130, 200));
        assert!(!overlaps(100, 30, 0, 100));
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path(), "dev");
        store.initialize().await.unwrap();
        assert!(store.health_check().await.unwrap());

        let missing = ChunkStore::new(dir.path().join("missing"), "dev");
        assert!(!missing.health_check().await.unwrap());
    }
}
