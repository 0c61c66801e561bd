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

use allspark_agent::storage::{overlaps, ChunkName, ChunkStore};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

const D: Duration = Duration::from_millis(30_000);

fn put(store: &ChunkStore, source: &str, started_at_ms: i64, len: usize) -> PathBuf {
    let path = store.chunk_path(source, started_at_ms * 1000, "mp4");
    std::fs::write(&path, vec![0u8; len]).unwrap();
    path
}

#[test]
fn test_chunk_name_layout() {
    let name = ChunkName::new("cam 01", "front/left", 1_700_000_000_123_456, "mp4");
    assert_eq!(name.filename(), "cam-01_front-left_1700000000123456.mp4");
    assert_eq!(name.started_at_ms(), 1_700_000_000_123);

    let parsed = ChunkName::parse(&name.filename()).unwrap();
    assert_eq!(parsed, name);
}

#[test]
fn test_overlap_rule() {
    // [start, start + d) against [s, e)
    assert!(overlaps(0, 30_000, 29_999, 40_000));
    assert!(!overlaps(0, 30_000, 30_000, 40_000));
    assert!(overlaps(10_000, 30_000, 0, 10_001));
    assert!(!overlaps(10_000, 30_000, 0, 10_000));
    assert!(overlaps(0, 30_000, 5_000, 6_000));
}

#[tokio::test]
async fn test_time_range_boundaries() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path(), "cam01");
    store.initialize().await.unwrap();

    let a = put(&store, "front", 1_000_000, 10);
    let b = put(&store, "front", 1_030_000, 10);
    let c = put(&store, "front", 1_060_000, 10);

    let names = |chunks: Vec<allspark_agent::storage::StoredChunk>| -> Vec<PathBuf> {
        chunks.into_iter().map(|c| c.path).collect()
    };

    // Exactly at a chunk end: that chunk is excluded
    let hits = store.chunks_in_range(1_030_000, 1_040_000, D).await.unwrap();
    assert_eq!(names(hits), vec![b.clone()]);

    // End is exclusive
    let hits = store.chunks_in_range(990_000, 1_000_000, D).await.unwrap();
    assert!(hits.is_empty());

    let hits = store.chunks_in_range(1_029_999, 1_060_001, D).await.unwrap();
    assert_eq!(names(hits), vec![a, b, c]);

    let hits = store.chunks_in_range(2_000_000, 3_000_000, D).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_list_ignores_foreign_files() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path(), "cam01");
    store.initialize().await.unwrap();

    put(&store, "front", 2_000, 1);
    put(&store, "rear", 1_000, 1);
    std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
    std::fs::write(dir.path().join("cam01_front_abc.mp4"), b"x").unwrap();
    std::fs::create_dir(dir.path().join("cam01_front_5.mp4")).unwrap();

    let chunks = store.list().await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].source, "rear");
    assert_eq!(chunks[0].started_at_ms, 1_000);
    assert_eq!(chunks[1].source, "front");
}

#[tokio::test]
async fn test_list_of_missing_directory_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path().join("not-yet"), "cam01");
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ceiling_removes_oldest_first() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path(), "cam01");
    store.initialize().await.unwrap();

    let oldest = put(&store, "front", 1_000, 100);
    let middle = put(&store, "front", 2_000, 100);
    let newest = put(&store, "front", 3_000, 100);

    let removed = store.enforce_ceiling(200, |_| false).await.unwrap();
    assert_eq!(removed, vec![oldest.clone()]);
    assert!(!oldest.exists());
    assert!(middle.exists());
    assert!(newest.exists());

    let usage = store.usage(200).await.unwrap();
    assert_eq!(usage.used_bytes, 200);
    assert_eq!(usage.chunk_count, 2);
    assert_eq!(usage.max_bytes, 200);
}

#[tokio::test]
async fn test_ceiling_skips_kept_chunks() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path(), "cam01");
    store.initialize().await.unwrap();

    let open = put(&store, "front", 1_000, 100);
    let queued = put(&store, "front", 2_000, 100);
    let old = put(&store, "front", 3_000, 100);

    let removed = store
        .enforce_ceiling(50, |path| path == open || path == queued)
        .await
        .unwrap();

    assert_eq!(removed, vec![old.clone()]);
    assert!(open.exists());
    assert!(queued.exists());
    assert!(!old.exists());
}

#[tokio::test]
async fn test_health_check() {
    let dir = TempDir::new().unwrap();
    let store = ChunkStore::new(dir.path(), "cam01");
    assert!(store.health_check().await.unwrap());

    let missing = ChunkStore::new(dir.path().join("missing"), "cam01");
    assert!(!missing.health_check().await.unwrap());
}
