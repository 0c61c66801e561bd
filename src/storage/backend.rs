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

// Chunk writer traits

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::buffer::MediaSample;
use crate::config_sync::VideoFormat;

/// A single open chunk file
///
/// The recorder owns exactly one of these at a time and is the only caller;
/// implementations need not be thread-safe beyond `Send`.
#[async_trait]
pub trait ChunkWriter: Send {
    /// Backpressure signal. Samples offered while this is `false` are
    /// dropped by the recorder.
    fn is_ready_for_more_data(&self) -> bool;

    /// Anchor the chunk timeline at the first accepted sample
    ///
    /// # Arguments
    /// * `timestamp_ns` - Timestamp of that sample on the producer clock
    fn start_session(&mut self, timestamp_ns: u64) -> Result<()>;

    /// Append one sample. Never called before `start_session`.
    fn append(&mut self, sample: &MediaSample) -> Result<()>;

    /// Flush and close the file, returning its size in bytes
    async fn finish(self: Box<Self>) -> Result<u64>;
}

/// Opens chunk writers
pub trait ChunkWriterFactory: Send + Sync {
    /// Extension (without dot) of the files this factory produces
    fn file_extension(&self, format: VideoFormat) -> &'static str;

    /// Create a writer for `path`. This is the only place a chunk file is created.
    fn open(&self, path: &Path, format: VideoFormat) -> Result<Box<dyn ChunkWriter>>;

    /// Get writer type identifier
    fn writer_type(&self) -> &str;
}
