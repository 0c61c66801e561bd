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

//! Rotating chunk recorder.
//!
//! A single actor task owns the open writer. Producers hand samples over a
//! bounded queue ([`SampleSink`]) and never touch writer state; start, stop,
//! source switches and the rotation timer are all serialized through the
//! same task, so a sample is either written to the chunk that was open when
//! the actor dequeued it or dropped.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{sample_channel, MediaSample, SampleSink};
use crate::config_sync::ConfigSync;
use crate::storage::{ChunkStore, ChunkWriter, ChunkWriterFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// Observable recorder state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderStatus {
    pub state: RecorderState,
    /// Path of the chunk currently accepting samples
    pub open_chunk: Option<PathBuf>,
    /// Closed chunks whose writer has not finished yet
    pub finalizing: Vec<PathBuf>,
    /// Index of the open (or last opened) chunk within the session
    pub chunk_index: u64,
    pub source: String,
    pub chunks_finalized: u64,
    pub chunks_lost: u64,
}

impl RecorderStatus {
    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    /// Whether the file at `path` is still being written
    pub fn is_writing(&self, path: &Path) -> bool {
        self.open_chunk.as_deref() == Some(path) || self.finalizing.iter().any(|p| p == path)
    }
}

/// Actor-side sample counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounters {
    pub accepted: u64,
    pub dropped_idle: u64,
    /// Recording, but the chunk failed to open or was abandoned
    pub dropped_no_chunk: u64,
    pub dropped_backpressure: u64,
    pub dropped_before_anchor: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped_idle: AtomicU64,
    dropped_no_chunk: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_before_anchor: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SampleCounters {
        SampleCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped_idle: self.dropped_idle.load(Ordering::Relaxed),
            dropped_no_chunk: self.dropped_no_chunk.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            dropped_before_anchor: self.dropped_before_anchor.load(Ordering::Relaxed),
        }
    }
}

/// A chunk that was closed and flushed to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedChunk {
    pub path: PathBuf,
    pub filename: String,
    pub size_bytes: u64,
    /// Wall-clock open time, milliseconds since the Unix epoch
    pub started_at_ms: i64,
    pub source: String,
    pub index: u64,
    pub samples: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    Finalized(FinishedChunk),
    /// Open, append or finalize failed; the chunk is abandoned
    Lost { path: PathBuf, reason: String },
}

/// Static recorder parameters
#[derive(Debug, Clone)]
pub struct RecorderOptions {
    pub source: String,
    pub sample_queue_capacity: usize,
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<Option<FinishedChunk>>),
    SwitchSource(String, oneshot::Sender<()>),
}

/// Handle to the recorder actor
#[derive(Clone)]
pub struct ChunkRecorder {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<RecorderStatus>,
    counters: Arc<Counters>,
    sink: SampleSink,
}

impl ChunkRecorder {
    /// Spawn the actor. Chunk events are delivered on `events`.
    pub fn spawn(
        options: RecorderOptions,
        store: Arc<ChunkStore>,
        factory: Arc<dyn ChunkWriterFactory>,
        config: Arc<ConfigSync>,
        events: mpsc::UnboundedSender<ChunkEvent>,
    ) -> Self {
        let (sink, samples) = sample_channel(options.sample_queue_capacity);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(RecorderStatus {
            state: RecorderState::Idle,
            open_chunk: None,
            finalizing: Vec::new(),
            chunk_index: 0,
            source: options.source.clone(),
            chunks_finalized: 0,
            chunks_lost: 0,
        });
        let counters = Arc::new(Counters::default());

        let actor = RecorderActor {
            store,
            factory,
            config,
            events,
            status: Arc::new(status_tx),
            counters: counters.clone(),
            state: RecorderState::Idle,
            source: options.source,
            chunk: None,
            deadline: None,
            next_index: 0,
            last_started_us: 0,
        };
        tokio::spawn(actor.run(command_rx, samples));

        Self {
            commands: command_tx,
            status: status_rx,
            counters,
            sink,
        }
    }

    /// Producer handle for capture threads
    pub fn sink(&self) -> SampleSink {
        self.sink.clone()
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecorderStatus> {
        self.status.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.status.borrow().is_recording()
    }

    /// Whether `path` is the open chunk or one still being finalized
    pub fn is_writing(&self, path: &Path) -> bool {
        self.status.borrow().is_writing(path)
    }

    pub fn counters(&self) -> SampleCounters {
        self.counters.snapshot()
    }

    /// Begin a session. No-op while already recording.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx)).await?;
        rx.await.map_err(|_| anyhow!("Recorder stopped"))
    }

    /// End the session, returning the last chunk if it finalized
    pub async fn stop(&self) -> Result<Option<FinishedChunk>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stop(tx)).await?;
        rx.await.map_err(|_| anyhow!("Recorder stopped"))
    }

    /// Change the source selector. While recording this closes the open
    /// chunk and continues in a fresh one so sources never share a file.
    pub async fn switch_source(&self, source: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SwitchSource(source.into(), tx)).await?;
        rx.await.map_err(|_| anyhow!("Recorder stopped"))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("Recorder stopped"))
    }
}

struct OpenChunk {
    path: PathBuf,
    filename: String,
    index: u64,
    started_at_ms: i64,
    source: String,
    writer: Box<dyn ChunkWriter>,
    anchor_ns: Option<u64>,
    samples: u64,
}

struct RecorderActor {
    store: Arc<ChunkStore>,
    factory: Arc<dyn ChunkWriterFactory>,
    config: Arc<ConfigSync>,
    events: mpsc::UnboundedSender<ChunkEvent>,
    status: Arc<watch::Sender<RecorderStatus>>,
    counters: Arc<Counters>,
    state: RecorderState,
    source: String,
    chunk: Option<OpenChunk>,
    deadline: Option<Instant>,
    next_index: u64,
    last_started_us: i64,
}

impl RecorderActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut samples: mpsc::Receiver<MediaSample>,
    ) {
        let mut samples_open = true;
        loop {
            let rotation_armed = self.state == RecorderState::Recording && self.deadline.is_some();
            let deadline = self.deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sleep_until(deadline), if rotation_armed => {
                    self.rotate();
                }
                sample = samples.recv(), if samples_open => match sample {
                    Some(sample) => self.accept(sample),
                    None => samples_open = false,
                },
            }
        }

        // All handles dropped
        if let Some(chunk) = self.chunk.take() {
            info!("Recorder shutting down, finalizing chunk {}", chunk.index);
            self.mark_finalizing(&chunk.path);
            finalize(chunk, self.events.clone(), self.status.clone()).await;
        }
        debug!("Recorder actor exited");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                self.start();
                let _ = reply.send(());
            }
            Command::Stop(reply) => {
                let finished = self.stop().await;
                let _ = reply.send(finished);
            }
            Command::SwitchSource(source, reply) => {
                self.switch_source(source);
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self) {
        if self.state == RecorderState::Recording {
            debug!("start() ignored, already recording");
            return;
        }
        self.state = RecorderState::Recording;
        self.next_index = 0;
        info!("Recording started (source '{}')", self.source);
        self.open_chunk();
        self.arm_timer();
        self.publish();
    }

    async fn stop(&mut self) -> Option<FinishedChunk> {
        if self.state == RecorderState::Idle {
            debug!("stop() ignored, not recording");
            return None;
        }
        self.state = RecorderState::Idle;
        self.deadline = None;
        let chunk = self.chunk.take();
        if let Some(chunk) = &chunk {
            self.mark_finalizing(&chunk.path);
        }
        self.publish();
        info!("Recording stopped");

        match chunk {
            Some(chunk) => finalize(chunk, self.events.clone(), self.status.clone()).await,
            None => None,
        }
    }

    fn switch_source(&mut self, source: String) {
        if source == self.source {
            return;
        }
        info!("Switching source '{}' -> '{}'", self.source, source);
        self.source = source;

        if self.state == RecorderState::Recording {
            if let Some(chunk) = self.chunk.take() {
                self.finalize_in_background(chunk);
            }
            self.open_chunk();
            self.arm_timer();
        }
        self.publish();
    }

    /// Close the current chunk to new samples, finalize it in the
    /// background and continue in a fresh one.
    fn rotate(&mut self) {
        if self.state != RecorderState::Recording {
            self.deadline = None;
            return;
        }
        if let Some(chunk) = self.chunk.take() {
            debug!("Rotating chunk {}", chunk.index);
            self.finalize_in_background(chunk);
        }
        self.open_chunk();
        self.arm_timer();
        self.publish();
    }

    /// Read at arm time, so a config update only affects the next chunk
    fn arm_timer(&mut self) {
        let duration = self.config.chunk_duration();
        self.deadline = Some(Instant::now() + duration);
        trace!("Rotation in {:?}", duration);
    }

    fn open_chunk(&mut self) {
        let format = self.config.current().video_format;
        let index = self.next_index;
        self.next_index += 1;

        // Strictly increasing so back-to-back chunks never share a name
        let started_at_us = chrono::Utc::now()
            .timestamp_micros()
            .max(self.last_started_us + 1);
        self.last_started_us = started_at_us;
        let extension = self.factory.file_extension(format);
        let path = self.store.chunk_path(&self.source, started_at_us, extension);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match self.factory.open(&path, format) {
            Ok(writer) => {
                info!("Opened chunk {} ({})", index, filename);
                self.chunk = Some(OpenChunk {
                    started_at_ms: started_at_us.div_euclid(1000),
                    path,
                    filename,
                    index,
                    source: self.source.clone(),
                    writer,
                    anchor_ns: None,
                    samples: 0,
                });
            }
            Err(e) => {
                error!("Failed to open chunk {}: {:#}", filename, e);
                self.chunk = None;
                self.record_loss(path, format!("{:#}", e));
            }
        }
    }

    fn accept(&mut self, sample: MediaSample) {
        let Some(chunk) = self.chunk.as_mut() else {
            let counter = match self.state {
                RecorderState::Idle => &self.counters.dropped_idle,
                RecorderState::Recording => &self.counters.dropped_no_chunk,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if !chunk.writer.is_ready_for_more_data() {
            self.counters
                .dropped_backpressure
                .fetch_add(1, Ordering::Relaxed);
            trace!("Writer busy, dropping {:?} sample", sample.kind());
            return;
        }

        let timestamp = sample.timestamp_ns();
        let anchor = chunk.anchor_ns;
        match anchor {
            None => {
                if let Err(e) = chunk.writer.start_session(timestamp) {
                    self.abandon_chunk(format!("start_session failed: {:#}", e));
                    return;
                }
                chunk.anchor_ns = Some(timestamp);
                debug!("Chunk {} anchored at {}", chunk.index, timestamp);
            }
            Some(anchor) if timestamp < anchor => {
                self.counters
                    .dropped_before_anchor
                    .fetch_add(1, Ordering::Relaxed);
                trace!("Dropping sample {} older than anchor {}", timestamp, anchor);
                return;
            }
            Some(_) => {}
        }

        match chunk.writer.append(&sample) {
            Ok(()) => {
                chunk.samples += 1;
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.abandon_chunk(format!("append failed: {:#}", e)),
        }
    }

    /// Give up on the open chunk; the next rotation opens a fresh one
    fn abandon_chunk(&mut self, reason: String) {
        let Some(chunk) = self.chunk.take() else {
            return;
        };
        error!("Abandoning chunk {}: {}", chunk.filename, reason);
        let path = chunk.path.clone();
        self.mark_finalizing(&path);
        // Close the file handle off the actor
        let status = self.status.clone();
        tokio::spawn(async move {
            if let Err(e) = chunk.writer.finish().await {
                debug!("Abandoned chunk close failed: {:#}", e);
            }
            unmark_finalizing(&status, &chunk.path);
        });
        self.record_loss(path, reason);
        self.publish();
    }

    fn record_loss(&self, path: PathBuf, reason: String) {
        self.status.send_modify(|s| s.chunks_lost += 1);
        let _ = self.events.send(ChunkEvent::Lost { path, reason });
    }

    /// Called before `publish()` clears `open_chunk`, so the path is always
    /// visible in one of the two.
    fn mark_finalizing(&self, path: &Path) {
        let path = path.to_path_buf();
        self.status.send_modify(|s| s.finalizing.push(path));
    }

    fn finalize_in_background(&self, chunk: OpenChunk) {
        self.mark_finalizing(&chunk.path);
        let events = self.events.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            finalize(chunk, events, status).await;
        });
    }

    fn publish(&self) {
        let state = self.state;
        let open_chunk = self.chunk.as_ref().map(|c| c.path.clone());
        let chunk_index = self.next_index.saturating_sub(1);
        let source = self.source.clone();
        self.status.send_modify(|s| {
            s.state = state;
            s.open_chunk = open_chunk;
            s.chunk_index = chunk_index;
            s.source = source;
        });
    }
}

fn unmark_finalizing(status: &watch::Sender<RecorderStatus>, path: &Path) {
    status.send_modify(|s| s.finalizing.retain(|p| p != path));
}

/// Finish the writer, then drop the chunk from the finalizing set and
/// report it.
async fn finalize(
    chunk: OpenChunk,
    events: mpsc::UnboundedSender<ChunkEvent>,
    status: Arc<watch::Sender<RecorderStatus>>,
) -> Option<FinishedChunk> {
    let OpenChunk {
        path,
        filename,
        index,
        started_at_ms,
        source,
        writer,
        samples,
        ..
    } = chunk;

    let result = writer.finish().await;
    unmark_finalizing(&status, &path);

    match result {
        Ok(size_bytes) => {
            info!(
                "Finalized chunk {} ({} samples, {} bytes)",
                filename, samples, size_bytes
            );
            let finished = FinishedChunk {
                path,
                filename,
                size_bytes,
                started_at_ms,
                source,
                index,
                samples,
            };
            status.send_modify(|s| s.chunks_finalized += 1);
            let _ = events.send(ChunkEvent::Finalized(finished.clone()));
            Some(finished)
        }
        Err(e) => {
            warn!("Failed to finalize chunk {}: {:#}", filename, e);
            status.send_modify(|s| s.chunks_lost += 1);
            let _ = events.send(ChunkEvent::Lost {
                path,
                reason: format!("{:#}", e),
            });
            None
        }
    }
}
