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

/// Chunk writers for recorded media
///
/// Two on-disk containers are provided:
///
/// - [`McapChunkWriter`]: an MCAP file with one `/video` and one `/audio`
///   channel. Each message is a small little-endian header followed by the
///   raw sample bytes.
/// - [`RawChunkWriter`]: a text header line followed by length-prefixed
///   records, for consumers without an MCAP reader.
///
/// # Timeline
///
/// Both writers anchor their timeline at the first accepted sample. Message
/// log times are `session_wall_clock + (sample_ts - anchor_ts)`, so a chunk
/// whose first frame arrives late does not start with an empty gap.
///
/// # Backpressure
///
/// `append` only encodes the sample and hands it to a per-chunk writer
/// thread, which writes whatever is queued and then flushes. Bytes count as
/// pending from `append` until their flush completes; while
/// `max_pending_bytes` or more are pending the writer reports itself as not
/// ready. A write or flush failure makes it not ready for the rest of its
/// life.
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::buffer::{MediaKind, MediaSample};
use crate::config::CompressionType;
use crate::config_sync::VideoFormat;
use crate::storage::ChunkWriter;

/// MCAP profile written into every chunk header
pub const MCAP_PROFILE: &str = "allspark";

const VIDEO_TOPIC: &str = "/video";
const AUDIO_TOPIC: &str = "/audio";
const VIDEO_ENCODING: &str = "allspark.bgra";
const AUDIO_ENCODING: &str = "allspark.pcm16";

fn wall_clock_ns() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns.max(0) as u64)
        .unwrap_or_default()
}

/// Per-message header, little-endian
///
/// Video: `width:u32 height:u32`; audio: `sample_rate:u32 channels:u16`.
fn encode_message(sample: &MediaSample) -> Vec<u8> {
    match sample {
        MediaSample::Video(frame) => {
            let mut buf = Vec::with_capacity(8 + frame.data.len());
            buf.extend_from_slice(&frame.width.to_le_bytes());
            buf.extend_from_slice(&frame.height.to_le_bytes());
            buf.extend_from_slice(&frame.data);
            buf
        }
        MediaSample::Audio(audio) => {
            let mut buf = Vec::with_capacity(6 + audio.data.len());
            buf.extend_from_slice(&audio.sample_rate.to_le_bytes());
            buf.extend_from_slice(&audio.channels.to_le_bytes());
            buf.extend_from_slice(&audio.data);
            buf
        }
    }
}

/// Anchored timeline shared by both writers
#[derive(Debug, Clone, Copy)]
struct Timeline {
    anchor_ns: u64,
    wall_start_ns: u64,
}

impl Timeline {
    fn log_time(&self, timestamp_ns: u64) -> u64 {
        self.wall_start_ns
            .saturating_add(timestamp_ns.saturating_sub(self.anchor_ns))
    }
}

/// One encoded sample on its way to disk
struct Record {
    kind: MediaKind,
    sequence: u32,
    log_time: u64,
    publish_time: u64,
    message: Vec<u8>,
}

/// What the chunk saw, written as trailing metadata where supported
struct SessionSummary {
    format: VideoFormat,
    message_count: u64,
    timeline: Option<Timeline>,
}

/// Blocking half of a chunk writer; owned by the writer thread
trait RecordSink: Send + 'static {
    fn write(&mut self, record: &Record) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Write any trailer, close the file and return its size
    fn close(self: Box<Self>, summary: SessionSummary) -> Result<u64>;
}

enum WriterOp {
    Record(Record),
    Finish(SessionSummary, oneshot::Sender<Result<u64>>),
}

/// Async-side handle to a chunk's writer thread
struct WriterThread {
    ops: mpsc::UnboundedSender<WriterOp>,
    pending: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    max_pending_bytes: u64,
}

impl WriterThread {
    fn spawn(path: &Path, sink: Box<dyn RecordSink>, max_pending_bytes: u64) -> Result<Self> {
        let (ops, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicBool::new(false));

        let name = path.display().to_string();
        let thread_pending = pending.clone();
        let thread_failed = failed.clone();
        std::thread::Builder::new()
            .name("chunk-writer".to_string())
            .spawn(move || run_writer(sink, rx, thread_pending, thread_failed, name))
            .context("Failed to spawn chunk writer thread")?;

        Ok(Self {
            ops,
            pending,
            failed,
            max_pending_bytes,
        })
    }

    fn is_ready(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
            && self.pending.load(Ordering::Acquire) < self.max_pending_bytes
    }

    fn submit(&self, record: Record) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            bail!("chunk writer failed");
        }
        self.pending
            .fetch_add(record.message.len() as u64, Ordering::AcqRel);
        self.ops.send(WriterOp::Record(record)).map_err(|_| {
            self.failed.store(true, Ordering::Release);
            anyhow!("chunk writer thread exited")
        })
    }

    async fn finish(self, summary: SessionSummary) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(WriterOp::Finish(summary, reply))
            .map_err(|_| anyhow!("chunk writer thread exited"))?;
        rx.await
            .map_err(|_| anyhow!("chunk writer thread exited"))?
    }
}

/// Writer thread body. Writes every queued record, then flushes once and
/// releases the flushed bytes from `pending`.
fn run_writer(
    mut sink: Box<dyn RecordSink>,
    mut ops: mpsc::UnboundedReceiver<WriterOp>,
    pending: Arc<AtomicU64>,
    failed: Arc<AtomicBool>,
    name: String,
) {
    let mut error: Option<String> = None;

    while let Some(op) = ops.blocking_recv() {
        let mut next = Some(op);
        let mut written = 0u64;

        while let Some(op) = next.take() {
            match op {
                WriterOp::Record(record) => {
                    written += record.message.len() as u64;
                    if error.is_none() {
                        if let Err(e) = sink.write(&record) {
                            warn!("Write to {} failed: {:#}", name, e);
                            error = Some(format!("{:#}", e));
                            failed.store(true, Ordering::Release);
                        }
                    }
                }
                WriterOp::Finish(summary, reply) => {
                    let result = match error.take() {
                        Some(e) => Err(anyhow!("Chunk {} had a write failure: {}", name, e)),
                        None => sink.close(summary),
                    };
                    let _ = reply.send(result);
                    return;
                }
            }
            next = ops.try_recv().ok();
        }

        if error.is_none() {
            if let Err(e) = sink.flush() {
                warn!("Flush of {} failed: {:#}", name, e);
                error = Some(format!("{:#}", e));
                failed.store(true, Ordering::Release);
            }
        }
        pending.fetch_sub(written, Ordering::AcqRel);
    }

    debug!("Chunk writer for {} dropped without finish", name);
}

struct McapSink {
    path: PathBuf,
    writer: mcap::Writer<BufWriter<File>>,
    video_channel: u16,
    audio_channel: u16,
}

fn session_metadata(summary: &SessionSummary) -> mcap::records::Metadata {
    let mut metadata = BTreeMap::new();
    metadata.insert("video_format".to_string(), summary.format.to_string());
    metadata.insert(
        "message_count".to_string(),
        summary.message_count.to_string(),
    );
    if let Some(timeline) = summary.timeline {
        metadata.insert("anchor_ns".to_string(), timeline.anchor_ns.to_string());
        metadata.insert(
            "session_start_ns".to_string(),
            timeline.wall_start_ns.to_string(),
        );
    }
    mcap::records::Metadata {
        name: "allspark.session".to_string(),
        metadata,
    }
}

impl RecordSink for McapSink {
    fn write(&mut self, record: &Record) -> Result<()> {
        let channel_id = match record.kind {
            MediaKind::Video => self.video_channel,
            MediaKind::Audio => self.audio_channel,
        };
        let header = mcap::records::MessageHeader {
            channel_id,
            sequence: record.sequence,
            log_time: record.log_time,
            publish_time: record.publish_time,
        };
        self.writer
            .write_to_known_channel(&header, &record.message)
            .context("Failed to write MCAP message")
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush MCAP chunk")
    }

    fn close(self: Box<Self>, summary: SessionSummary) -> Result<u64> {
        let McapSink {
            path, mut writer, ..
        } = *self;
        if let Err(e) = writer.write_metadata(&session_metadata(&summary)) {
            warn!("Failed to write session metadata to {}: {}", path.display(), e);
        }
        writer
            .finish()
            .with_context(|| format!("Failed to finish MCAP chunk {}", path.display()))?;
        drop(writer);
        let size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        Ok(size)
    }
}

/// MCAP-backed chunk writer
pub struct McapChunkWriter {
    format: VideoFormat,
    thread: WriterThread,
    sequence: u32,
    timeline: Option<Timeline>,
    message_count: u64,
}

impl McapChunkWriter {
    /// Create the file and declare its channels
    ///
    /// # Arguments
    ///
    /// * `path` - Chunk file to create (truncated if present)
    /// * `format` - Container requested by the coordinator, recorded as metadata
    /// * `compression` - MCAP chunk compression
    /// * `max_pending_bytes` - Backpressure threshold
    pub fn create(
        path: &Path,
        format: VideoFormat,
        compression: CompressionType,
        max_pending_bytes: u64,
    ) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create chunk file: {}", path.display()))?;

        let compression = match compression {
            CompressionType::None => None,
            CompressionType::Lz4 => Some(mcap::Compression::Lz4),
            CompressionType::Zstd => Some(mcap::Compression::Zstd),
        };

        let mut writer = mcap::WriteOptions::new()
            .compression(compression)
            .profile(MCAP_PROFILE)
            .create(BufWriter::new(file))
            .context("Failed to start MCAP file")?;

        let video_channel = writer
            .add_channel(0, VIDEO_TOPIC, VIDEO_ENCODING, &BTreeMap::new())
            .context("Failed to declare video channel")?;
        let audio_channel = writer
            .add_channel(0, AUDIO_TOPIC, AUDIO_ENCODING, &BTreeMap::new())
            .context("Failed to declare audio channel")?;

        let sink = McapSink {
            path: path.to_path_buf(),
            writer,
            video_channel,
            audio_channel,
        };
        let thread = WriterThread::spawn(path, Box::new(sink), max_pending_bytes)?;
        debug!("Opened MCAP chunk {}", path.display());

        Ok(Self {
            format,
            thread,
            sequence: 0,
            timeline: None,
            message_count: 0,
        })
    }
}

#[async_trait]
impl ChunkWriter for McapChunkWriter {
    fn is_ready_for_more_data(&self) -> bool {
        self.thread.is_ready()
    }

    fn start_session(&mut self, timestamp_ns: u64) -> Result<()> {
        self.timeline = Some(Timeline {
            anchor_ns: timestamp_ns,
            wall_start_ns: wall_clock_ns(),
        });
        Ok(())
    }

    fn append(&mut self, sample: &MediaSample) -> Result<()> {
        let timeline = self
            .timeline
            .ok_or_else(|| anyhow!("append before start_session"))?;

        self.thread.submit(Record {
            kind: sample.kind(),
            sequence: self.sequence,
            log_time: timeline.log_time(sample.timestamp_ns()),
            publish_time: sample.timestamp_ns(),
            message: encode_message(sample),
        })?;
        self.sequence = self.sequence.wrapping_add(1);
        self.message_count += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let this = *self;
        let summary = SessionSummary {
            format: this.format,
            message_count: this.message_count,
            timeline: this.timeline,
        };
        this.thread.finish(summary).await
    }
}

struct RawSink {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RecordSink for RawSink {
    fn write(&mut self, record: &Record) -> Result<()> {
        let kind = match record.kind {
            MediaKind::Video => b'V',
            MediaKind::Audio => b'A',
        };
        let message = &record.message;
        self.out.write_all(&[kind])?;
        self.out.write_all(&record.log_time.to_le_bytes())?;
        self.out.write_all(&(message.len() as u32).to_le_bytes())?;
        self.out.write_all(message).context("Failed to write record")
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush chunk")
    }

    fn close(self: Box<Self>, _summary: SessionSummary) -> Result<u64> {
        let RawSink { path, out } = *self;
        let file = out
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush {}: {}", path.display(), e.error()))?;
        file.sync_all().context("Failed to sync chunk")?;
        Ok(file.metadata().context("Failed to stat chunk")?.len())
    }
}

/// Length-prefixed fallback writer
///
/// Layout:
/// ```text
/// ALLSPARK_RAW|format={mp4|mov}|file={name}\n
/// ( kind:u8 'V'|'A', log_time:u64, len:u32, message[len] )*
/// ```
pub struct RawChunkWriter {
    format: VideoFormat,
    thread: WriterThread,
    timeline: Option<Timeline>,
}

impl RawChunkWriter {
    pub fn create(path: &Path, format: VideoFormat, max_pending_bytes: u64) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create chunk file: {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(out, "ALLSPARK_RAW|format={}|file={}", format, name)
            .context("Failed to write header")?;

        let sink = RawSink {
            path: path.to_path_buf(),
            out,
        };
        Ok(Self {
            format,
            thread: WriterThread::spawn(path, Box::new(sink), max_pending_bytes)?,
            timeline: None,
        })
    }
}

#[async_trait]
impl ChunkWriter for RawChunkWriter {
    fn is_ready_for_more_data(&self) -> bool {
        self.thread.is_ready()
    }

    fn start_session(&mut self, timestamp_ns: u64) -> Result<()> {
        self.timeline = Some(Timeline {
            anchor_ns: timestamp_ns,
            wall_start_ns: wall_clock_ns(),
        });
        Ok(())
    }

    fn append(&mut self, sample: &MediaSample) -> Result<()> {
        let timeline = self
            .timeline
            .ok_or_else(|| anyhow!("append before start_session"))?;
        self.thread.submit(Record {
            kind: sample.kind(),
            sequence: 0,
            log_time: timeline.log_time(sample.timestamp_ns()),
            publish_time: sample.timestamp_ns(),
            message: encode_message(sample),
        })
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let this = *self;
        this.thread
            .finish(SessionSummary {
                format: this.format,
                message_count: 0,
                timeline: this.timeline,
            })
            .await
    }
}
