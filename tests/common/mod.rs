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

//! Scripted transport and in-memory chunk writers shared by the integration tests
#![allow(dead_code)]

use allspark_agent::buffer::MediaSample;
use allspark_agent::config_sync::VideoFormat;
use allspark_agent::error::TransportError;
use allspark_agent::protocol::Frame;
use allspark_agent::storage::{ChunkWriter, ChunkWriterFactory};
use allspark_agent::transport::{Channel, Connector, Endpoint, FrameSink, FrameStream, TrustPolicy};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Connector whose secure/insecure outcomes are set by the test.
/// Every frame sent on any channel it opened lands in `frames`.
#[derive(Default)]
pub struct MockConnector {
    pub fail_secure: AtomicBool,
    pub fail_insecure: AtomicBool,
    pub attempts: Mutex<Vec<Endpoint>>,
    pub frames: Arc<Mutex<Vec<Frame>>>,
    pub send_delay: Arc<Mutex<Duration>>,
    // Sends are numbered across all channels, clientInfo included
    sends: Arc<AtomicUsize>,
    failing_sends: Arc<Mutex<HashSet<usize>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> Vec<Endpoint> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    /// Applies to every later send, on open channels too
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    /// Make the `index`-th send (0 is the first clientInfo) fail with an
    /// I/O error. The frame is not recorded.
    pub fn fail_send(&self, index: usize) {
        self.failing_sends.lock().unwrap().insert(index);
    }

    /// Deliver a text frame to the most recently opened channel
    pub fn push_text(&self, text: &str) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(Frame::Text(text.to_string()));
        }
    }

    /// Close the most recently opened channel from the coordinator side
    pub fn drop_channel(&self) {
        self.inbound.lock().unwrap().take();
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _trust: TrustPolicy,
    ) -> Result<Channel, TransportError> {
        self.attempts.lock().unwrap().push(endpoint.clone());

        let fail = if endpoint.secure {
            self.fail_secure.load(Ordering::SeqCst)
        } else {
            self.fail_insecure.load(Ordering::SeqCst)
        };
        if fail {
            return Err(TransportError::Refused(endpoint.url()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(Channel {
            sink: Box::new(MockSink {
                frames: self.frames.clone(),
                delay: self.send_delay.clone(),
                sends: self.sends.clone(),
                failing: self.failing_sends.clone(),
            }),
            stream: Box::new(MockStream { rx }),
        })
    }
}

struct MockSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    delay: Arc<Mutex<Duration>>,
    sends: Arc<AtomicUsize>,
    failing: Arc<Mutex<HashSet<usize>>>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let index = self.sends.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&index) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "send failed",
            )));
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Short description of a frame for order assertions
pub fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text).unwrap();
            match value["type"].as_str() {
                Some("upload") => format!("meta:{}", value["filename"].as_str().unwrap()),
                Some(kind) => kind.to_string(),
                None => text.clone(),
            }
        }
        Frame::Binary(data) => format!("bin:{}", data.len()),
    }
}

// ---------------------------------------------------------------------------
// Chunk writers
// ---------------------------------------------------------------------------

/// What the mock writers saw, keyed by chunk path
#[derive(Default)]
pub struct WriterLog {
    pub opened: Mutex<Vec<PathBuf>>,
    pub anchors: Mutex<HashMap<PathBuf, u64>>,
    pub samples: Mutex<HashMap<PathBuf, Vec<u64>>>,
    pub finished: Mutex<Vec<PathBuf>>,
}

impl WriterLog {
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }

    pub fn samples_of(&self, path: &Path) -> Vec<u64> {
        self.samples
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn anchor_of(&self, path: &Path) -> Option<u64> {
        self.anchors.lock().unwrap().get(path).copied()
    }
}

/// Factory producing writers that create an empty file on open, keep
/// samples in memory and write the payload bytes on finish.
#[derive(Default)]
pub struct MockWriterFactory {
    pub log: Arc<WriterLog>,
    pub fail_open: AtomicBool,
    pub ready: Arc<AtomicBool>,
    pub opens: AtomicUsize,
    pub finish_delay: Arc<Mutex<Duration>>,
}

impl MockWriterFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        })
    }
}

impl ChunkWriterFactory for MockWriterFactory {
    fn file_extension(&self, format: VideoFormat) -> &'static str {
        format.extension()
    }

    fn open(&self, path: &Path, _format: VideoFormat) -> Result<Box<dyn ChunkWriter>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        std::fs::File::create(path)?;
        self.log.opened.lock().unwrap().push(path.to_path_buf());
        Ok(Box::new(MockWriter {
            path: path.to_path_buf(),
            log: self.log.clone(),
            ready: self.ready.clone(),
            finish_delay: self.finish_delay.clone(),
            bytes: Vec::new(),
        }))
    }

    fn writer_type(&self) -> &str {
        "mock"
    }
}

struct MockWriter {
    path: PathBuf,
    log: Arc<WriterLog>,
    ready: Arc<AtomicBool>,
    finish_delay: Arc<Mutex<Duration>>,
    bytes: Vec<u8>,
}

#[async_trait]
impl ChunkWriter for MockWriter {
    fn is_ready_for_more_data(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn start_session(&mut self, timestamp_ns: u64) -> Result<()> {
        self.log
            .anchors
            .lock()
            .unwrap()
            .insert(self.path.clone(), timestamp_ns);
        Ok(())
    }

    fn append(&mut self, sample: &MediaSample) -> Result<()> {
        self.bytes.extend_from_slice(sample.payload());
        self.log
            .samples
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .push(sample.timestamp_ns());
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let delay = *self.finish_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        // No blocking-pool hop under a paused clock
        std::fs::write(&self.path, &self.bytes)?;
        self.log.finished.lock().unwrap().push(self.path.clone());
        Ok(self.bytes.len() as u64)
    }
}
