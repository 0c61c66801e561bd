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

//! Serialized chunk uploads over the control channel.
//!
//! Every transfer is an `upload` metadata frame followed by one binary
//! frame. A single worker task runs transfers one at a time and holds the
//! channel for the whole pair, so frames of two transfers never interleave.
//! A transfer succeeds once its binary frame has been sent; the
//! coordinator's `status` reply is only logged. Failed transfers are not
//! retried and the file stays on disk.

use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::error::{TransportError, UploadError};
use crate::protocol::{mime_type_for, Frame, OutboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    SendingMetadata,
    SendingPayload,
    /// Payload fully handed to the transport
    Acked,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Acked | TransferState::Failed)
    }
}

/// Book-keeping for one chunk upload
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: Uuid,
    pub path: PathBuf,
    pub filename: String,
    /// Known once the file has been read
    pub size_bytes: Option<u64>,
    pub mime_type: String,
    pub state: TransferState,
    pub error: Option<String>,
}

/// Successful transfer outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub id: Uuid,
    pub filename: String,
    pub size_bytes: u64,
}

/// Caller side of an enqueued transfer
pub struct PendingTransfer {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<TransferReceipt, UploadError>>,
}

impl PendingTransfer {
    /// Wait for the transfer to reach a terminal state
    pub async fn wait(self) -> Result<TransferReceipt, UploadError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(UploadError::QueueClosed),
        }
    }
}

struct Job {
    id: Uuid,
    path: PathBuf,
    reply: oneshot::Sender<Result<TransferReceipt, UploadError>>,
}

/// Handle to the upload worker
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::UnboundedSender<Job>,
    transfers: Arc<DashMap<Uuid, Transfer>>,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

impl UploadQueue {
    /// Start the worker. It exits once every handle is dropped.
    pub fn spawn(connection: ConnectionManager) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let transfers = Arc::new(DashMap::new());
        tokio::spawn(Self::worker(connection, transfers.clone(), rx));
        Self { tx, transfers }
    }

    /// Queue a file for upload. Never blocks.
    pub fn enqueue(&self, path: impl Into<PathBuf>) -> PendingTransfer {
        let path = path.into();
        let id = Uuid::new_v4();
        let filename = file_name_of(&path);
        let (reply, rx) = oneshot::channel();

        self.transfers.insert(
            id,
            Transfer {
                id,
                path: path.clone(),
                mime_type: mime_type_for(&filename).to_string(),
                filename,
                size_bytes: None,
                state: TransferState::Pending,
                error: None,
            },
        );

        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job { id, path, reply }) {
            self.set_failed(id, &UploadError::QueueClosed);
            let _ = job.reply.send(Err(UploadError::QueueClosed));
        }
        PendingTransfer { id, rx }
    }

    pub fn transfer(&self, id: &Uuid) -> Option<Transfer> {
        self.transfers.get(id).map(|t| t.value().clone())
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.iter().map(|t| t.value().clone()).collect()
    }

    /// Paths of transfers that have not finished yet
    pub fn active_paths(&self) -> Vec<PathBuf> {
        self.transfers
            .iter()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.path.clone())
            .collect()
    }

    /// Forget transfers in a terminal state
    pub fn prune_finished(&self) -> usize {
        let before = self.transfers.len();
        self.transfers.retain(|_, t| !t.state.is_terminal());
        before - self.transfers.len()
    }

    fn set_failed(&self, id: Uuid, error: &UploadError) {
        if let Some(mut t) = self.transfers.get_mut(&id) {
            t.state = TransferState::Failed;
            t.error = Some(error.to_string());
        }
    }

    async fn worker(
        connection: ConnectionManager,
        transfers: Arc<DashMap<Uuid, Transfer>>,
        mut rx: mpsc::UnboundedReceiver<Job>,
    ) {
        while let Some(job) = rx.recv().await {
            let result = run_transfer(&connection, &transfers, job.id, &job.path).await;
            if let Some(mut t) = transfers.get_mut(&job.id) {
                match &result {
                    Ok(_) => t.state = TransferState::Acked,
                    Err(e) => {
                        t.state = TransferState::Failed;
                        t.error = Some(e.to_string());
                    }
                }
            }
            match &result {
                Ok(receipt) => info!(
                    "Uploaded {} ({} bytes)",
                    receipt.filename, receipt.size_bytes
                ),
                Err(e) => warn!("Upload of {} failed: {}", job.path.display(), e),
            }
            let _ = job.reply.send(result);
        }
        debug!("Upload worker exited");
    }
}

fn set_state(transfers: &DashMap<Uuid, Transfer>, id: Uuid, state: TransferState) {
    if let Some(mut t) = transfers.get_mut(&id) {
        t.state = state;
    }
}

async fn run_transfer(
    connection: &ConnectionManager,
    transfers: &DashMap<Uuid, Transfer>,
    id: Uuid,
    path: &Path,
) -> Result<TransferReceipt, UploadError> {
    if !connection.is_connected() {
        return Err(UploadError::NotConnected);
    }

    let data = tokio::fs::read(path).await.map_err(|source| UploadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let filename = file_name_of(path);
    let size_bytes = data.len() as u64;
    if let Some(mut t) = transfers.get_mut(&id) {
        t.size_bytes = Some(size_bytes);
    }

    let metadata = OutboundMessage::Upload {
        filename: filename.clone(),
        filesize: size_bytes,
        mimetype: mime_type_for(&filename).to_string(),
    }
    .to_frame()
    .map_err(|e| TransportError::Protocol(e.to_string()))?;

    let mut channel = connection
        .lock_channel()
        .await
        .map_err(|_| UploadError::NotConnected)?;

    set_state(transfers, id, TransferState::SendingMetadata);
    channel.send(metadata).await?;

    set_state(transfers, id, TransferState::SendingPayload);
    channel.send(Frame::Binary(Bytes::from(data))).await?;
    drop(channel);

    Ok(TransferReceipt {
        id,
        filename,
        size_bytes,
    })
}
