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

/// Recorder state machine, rotation and sample admission tests
///
mod common;

use allspark_agent::buffer::{AudioBuffer, VideoFrame};
use allspark_agent::config_sync::{ClientConfig, ClientConfigPatch, ConfigSync, VideoFormat};
use allspark_agent::recorder::{
    ChunkEvent, ChunkRecorder, FinishedChunk, RecorderOptions, RecorderState,
};
use allspark_agent::storage::ChunkStore;
use bytes::Bytes;
use common::MockWriterFactory;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Harness {
    recorder: ChunkRecorder,
    events: mpsc::UnboundedReceiver<ChunkEvent>,
    factory: Arc<MockWriterFactory>,
    config: Arc<ConfigSync>,
    finalized: Vec<FinishedChunk>,
    lost: usize,
    _dir: TempDir,
}

impl Harness {
    fn new(chunk_duration_ms: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::new(dir.path(), "cam01"));
        let factory = MockWriterFactory::new();
        let config = Arc::new(ConfigSync::new(ClientConfig {
            video_format: VideoFormat::Mp4,
            chunk_duration_ms,
            storage_max_bytes: u64::MAX,
        }));
        let (tx, events) = mpsc::unbounded_channel();
        let recorder = ChunkRecorder::spawn(
            RecorderOptions {
                source: "front".to_string(),
                sample_queue_capacity: 64,
            },
            store,
            factory.clone(),
            config.clone(),
            tx,
        );
        Self {
            recorder,
            events,
            factory,
            config,
            finalized: Vec::new(),
            lost: 0,
            _dir: dir,
        }
    }

    /// Let the actor and background finalizers run, then collect events
    async fn settle(&mut self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        while let Ok(event) = self.events.try_recv() {
            match event {
                ChunkEvent::Finalized(chunk) => self.finalized.push(chunk),
                ChunkEvent::Lost { .. } => self.lost += 1,
            }
        }
    }
}

fn video(timestamp_ns: u64) -> VideoFrame {
    VideoFrame {
        timestamp_ns,
        width: 2,
        height: 1,
        data: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
    }
}

fn audio(timestamp_ns: u64) -> AudioBuffer {
    AudioBuffer {
        timestamp_ns,
        sample_rate: 48_000,
        channels: 1,
        data: Bytes::from_static(&[0, 1, 0, 1]),
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_recorder_drops_samples() {
    let mut h = Harness::new(1_000);

    assert!(h.recorder.sink().submit_video(video(1)));
    h.settle().await;

    let status = h.recorder.status();
    assert_eq!(status.state, RecorderState::Idle);
    assert!(status.open_chunk.is_none());
    assert_eq!(h.recorder.counters().dropped_idle, 1);
    assert!(h.factory.log.opened().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rotation_count_matches_elapsed_time() {
    let mut h = Harness::new(1_000);

    h.recorder.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3_010)).await;
    h.settle().await;

    assert_eq!(h.finalized.len(), 3);
    let status = h.recorder.status();
    assert!(status.is_recording());
    assert_eq!(status.chunk_index, 3);
    assert_eq!(status.chunks_finalized, 3);

    let indices: Vec<u64> = h.finalized.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    // Every rotation produced a distinct file
    let opened = h.factory.log.opened();
    assert_eq!(opened.len(), 4);
    let unique: HashSet<_> = opened.iter().collect();
    assert_eq!(unique.len(), opened.len());
}

#[tokio::test(start_paused = true)]
async fn test_duration_change_applies_to_next_chunk() {
    let mut h = Harness::new(30_000);

    h.recorder.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.config
        .apply(&ClientConfigPatch::from_value(&json!({ "chunkDurationMs": 15000 })));

    // First chunk keeps its 30s deadline
    tokio::time::sleep(Duration::from_secs(21)).await;
    h.settle().await;
    assert_eq!(h.finalized.len(), 1);

    // Second chunk runs 30s..45s
    tokio::time::sleep(Duration::from_secs(13)).await;
    h.settle().await;
    assert_eq!(h.finalized.len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.settle().await;
    assert_eq!(h.finalized.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_first_sample_anchors_chunk_timeline() {
    let mut h = Harness::new(30_000);
    let sink = h.recorder.sink();

    h.recorder.start().await.unwrap();
    sink.submit_video(video(1_000));
    sink.submit_audio(audio(500));
    sink.submit_video(video(2_000));
    sink.submit_audio(audio(1_000));
    h.settle().await;

    let counters = h.recorder.counters();
    assert_eq!(counters.accepted, 3);
    assert_eq!(counters.dropped_before_anchor, 1);

    let finished = h.recorder.stop().await.unwrap().unwrap();
    assert_eq!(finished.samples, 3);
    assert_eq!(h.factory.log.anchor_of(&finished.path), Some(1_000));
    assert_eq!(
        h.factory.log.samples_of(&finished.path),
        vec![1_000, 2_000, 1_000]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_wins_over_queued_samples() {
    let mut h = Harness::new(30_000);
    let sink = h.recorder.sink();

    h.recorder.start().await.unwrap();
    sink.submit_video(video(10));
    let finished = h.recorder.stop().await.unwrap();
    h.settle().await;

    // Empty chunks are still finalized
    let finished = finished.unwrap();
    assert_eq!(finished.samples, 0);
    assert!(finished.path.exists());

    let status = h.recorder.status();
    assert_eq!(status.state, RecorderState::Idle);
    assert!(status.open_chunk.is_none());
    assert_eq!(h.recorder.counters().dropped_idle, 1);
    assert_eq!(h.recorder.counters().accepted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_when_idle_is_noop() {
    let mut h = Harness::new(1_000);

    assert!(h.recorder.stop().await.unwrap().is_none());
    h.settle().await;
    assert!(h.finalized.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_opens_one_chunk() {
    let mut h = Harness::new(30_000);

    h.recorder.start().await.unwrap();
    h.recorder.start().await.unwrap();
    h.settle().await;

    assert_eq!(h.factory.log.opened().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_drops_samples() {
    let mut h = Harness::new(30_000);
    let sink = h.recorder.sink();

    h.recorder.start().await.unwrap();
    h.factory.ready.store(false, Ordering::SeqCst);
    sink.submit_video(video(1));
    sink.submit_video(video(2));
    h.settle().await;
    assert_eq!(h.recorder.counters().dropped_backpressure, 2);

    h.factory.ready.store(true, Ordering::SeqCst);
    sink.submit_video(video(3));
    h.settle().await;

    let finished = h.recorder.stop().await.unwrap().unwrap();
    assert_eq!(h.factory.log.samples_of(&finished.path), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_keeps_recording() {
    let mut h = Harness::new(1_000);
    h.factory.fail_open.store(true, Ordering::SeqCst);

    h.recorder.start().await.unwrap();
    h.settle().await;

    let status = h.recorder.status();
    assert!(status.is_recording());
    assert!(status.open_chunk.is_none());
    assert_eq!(status.chunks_lost, 1);
    assert_eq!(h.lost, 1);

    // Recording without a chunk is not the same as idle
    h.recorder.sink().submit_video(video(1));
    h.settle().await;
    let counters = h.recorder.counters();
    assert_eq!(counters.dropped_no_chunk, 1);
    assert_eq!(counters.dropped_idle, 0);

    // Next rotation retries with a fresh chunk
    h.factory.fail_open.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_010)).await;
    h.settle().await;

    let status = h.recorder.status();
    assert!(status.open_chunk.is_some());
    assert_eq!(h.factory.log.opened().len(), 1);
    assert!(h.finalized.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_switch_source_closes_chunk() {
    let mut h = Harness::new(30_000);
    let sink = h.recorder.sink();

    h.recorder.start().await.unwrap();
    sink.submit_video(video(5));
    h.settle().await;

    h.recorder.switch_source("rear").await.unwrap();
    h.settle().await;

    assert_eq!(h.finalized.len(), 1);
    assert_eq!(h.finalized[0].source, "front");
    assert_eq!(h.finalized[0].samples, 1);
    assert!(h.finalized[0].filename.starts_with("cam01_front_"));

    let status = h.recorder.status();
    assert_eq!(status.source, "rear");
    let open = status.open_chunk.unwrap();
    assert!(open
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("cam01_rear_"));
}

#[tokio::test(start_paused = true)]
async fn test_switch_source_while_idle_only_changes_selector() {
    let mut h = Harness::new(30_000);

    h.recorder.switch_source("side").await.unwrap();
    h.settle().await;

    assert_eq!(h.recorder.status().source, "side");
    assert!(h.factory.log.opened().is_empty());
    assert!(h.finalized.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handles_finalizes_open_chunk() {
    let mut h = Harness::new(30_000);

    h.recorder.start().await.unwrap();
    let recorder = h.recorder.clone();
    drop(recorder);
    let Harness {
        recorder,
        mut events,
        _dir,
        ..
    } = h;
    drop(recorder);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap();
    assert!(matches!(event, Some(ChunkEvent::Finalized(_))));
}
