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

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config_sync::ConfigSync;
use crate::protocol::RemoteCommand;
use crate::recorder::{ChunkEvent, ChunkRecorder, FinishedChunk};
use crate::storage::{ChunkStore, StorageUsage};
use crate::upload::{PendingTransfer, UploadQueue};

/// Glue between the recorder, the upload queue and coordinator commands
#[derive(Clone)]
pub struct ControlInterface {
    recorder: ChunkRecorder,
    uploads: UploadQueue,
    store: Arc<ChunkStore>,
    config: Arc<ConfigSync>,
    auto_upload: bool,
    record_timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ControlInterface {
    pub fn new(
        recorder: ChunkRecorder,
        uploads: UploadQueue,
        store: Arc<ChunkStore>,
        config: Arc<ConfigSync>,
        auto_upload: bool,
    ) -> Self {
        Self {
            recorder,
            uploads,
            store,
            config,
            auto_upload,
            record_timer: Arc::new(Mutex::new(None)),
        }
    }

    /// Run until the chunk event stream ends
    pub async fn run(
        &self,
        mut events: mpsc::UnboundedReceiver<ChunkEvent>,
        mut commands: mpsc::UnboundedReceiver<RemoteCommand>,
    ) -> Result<()> {
        info!(
            "Control interface running (auto_upload={})",
            self.auto_upload
        );
        let mut commands_open = true;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_chunk_event(event).await,
                    None => break,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Remote command stream closed");
                        commands_open = false;
                    }
                },
            }
        }

        info!("Chunk event stream closed");
        Ok(())
    }

    pub async fn handle_chunk_event(&self, event: ChunkEvent) {
        match event {
            ChunkEvent::Finalized(chunk) => {
                if self.auto_upload {
                    let pending = self.uploads.enqueue(&chunk.path);
                    self.observe(pending, chunk.filename.clone());
                } else {
                    debug!("Keeping {} for later retrieval", chunk.filename);
                }
                self.enforce_retention(Some(&chunk)).await;
            }
            ChunkEvent::Lost { path, reason } => {
                warn!("Chunk {} lost: {}", path.display(), reason);
            }
        }
    }

    pub async fn handle_command(&self, command: RemoteCommand) {
        match command {
            RemoteCommand::UploadTimeRange { start_ms, end_ms } => {
                match self.upload_time_range(start_ms, end_ms).await {
                    Ok(count) => info!(
                        "uploadTimeRange [{}, {}) queued {} chunk(s)",
                        start_ms, end_ms, count
                    ),
                    Err(e) => error!("uploadTimeRange failed: {:#}", e),
                }
            }
            RemoteCommand::Record { duration } => self.record_for(duration).await,
        }
    }

    /// Enqueue every stored chunk overlapping `[start_ms, end_ms)`.
    /// The open chunk and chunks still being finalized are skipped.
    pub async fn upload_time_range(&self, start_ms: i64, end_ms: i64) -> Result<usize> {
        if end_ms <= start_ms {
            warn!("Empty time range [{}, {})", start_ms, end_ms);
            return Ok(0);
        }

        let chunks = self
            .store
            .chunks_in_range(start_ms, end_ms, self.config.chunk_duration())
            .await?;

        // Checked after listing: a chunk opened since then is not listed
        let mut queued = 0;
        for chunk in chunks {
            if self.recorder.is_writing(&chunk.path) {
                debug!("Skipping {}, still being written", chunk.filename);
                continue;
            }
            let pending = self.uploads.enqueue(&chunk.path);
            self.observe(pending, chunk.filename);
            queued += 1;
        }
        Ok(queued)
    }

    /// Start recording and stop after `duration`, unless already recording
    pub async fn record_for(&self, duration: Duration) {
        if self.recorder.is_recording() {
            info!("record command ignored, already recording");
            return;
        }
        if let Err(e) = self.recorder.start().await {
            error!("Failed to start timed recording: {:#}", e);
            return;
        }
        info!("Timed recording for {:?}", duration);

        let recorder = self.recorder.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            match recorder.stop().await {
                Ok(_) => info!("Timed recording finished"),
                Err(e) => error!("Failed to stop timed recording: {:#}", e),
            }
        });

        let previous = self
            .record_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Current disk usage against the coordinator's storage ceiling
    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        self.store.usage(self.config.storage_ceiling()).await
    }

    async fn enforce_retention(&self, just_finished: Option<&FinishedChunk>) {
        let mut queued: Vec<PathBuf> = self.uploads.active_paths();
        if let Some(chunk) = just_finished.filter(|_| self.auto_upload) {
            queued.push(chunk.path.clone());
        }
        let keep = |path: &Path| {
            self.recorder.is_writing(path) || queued.iter().any(|p| p == path)
        };

        match self
            .store
            .enforce_ceiling(self.config.storage_ceiling(), keep)
            .await
        {
            Ok(removed) if !removed.is_empty() => {
                info!("Retention removed {} chunk(s)", removed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Retention pass failed: {:#}", e),
        }
        self.uploads.prune_finished();
    }

    fn observe(&self, pending: PendingTransfer, filename: String) {
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(receipt) => debug!("Transfer {} of {} done", receipt.id, filename),
                Err(e) => warn!("{} stays on disk: {}", filename, e),
            }
        });
    }
}
