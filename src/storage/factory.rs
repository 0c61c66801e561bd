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

// Writer factory for creating chunk writers from configuration

use super::backend::{ChunkWriter, ChunkWriterFactory};
use crate::config::{CompressionType, ContainerKind, RecorderSettings};
use crate::config_sync::VideoFormat;
use crate::mcap_writer::{McapChunkWriter, RawChunkWriter};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// Opens MCAP or raw chunk writers depending on `recorder.container`
pub struct WriterFactory {
    container: ContainerKind,
    compression: CompressionType,
    max_pending_bytes: u64,
}

impl WriterFactory {
    pub fn new(container: ContainerKind, compression: CompressionType, max_pending_bytes: u64) -> Self {
        Self {
            container,
            compression,
            max_pending_bytes,
        }
    }

    /// Create writer factory from configuration
    pub fn create(settings: &RecorderSettings) -> Arc<dyn ChunkWriterFactory> {
        Arc::new(Self::new(
            settings.container,
            settings.compression,
            settings.max_pending_bytes,
        ))
    }
}

impl ChunkWriterFactory for WriterFactory {
    fn file_extension(&self, _format: VideoFormat) -> &'static str {
        match self.container {
            ContainerKind::Mcap => "mcap",
            ContainerKind::Raw => "bin",
        }
    }

    fn open(&self, path: &Path, format: VideoFormat) -> Result<Box<dyn ChunkWriter>> {
        Ok(match self.container {
            ContainerKind::Mcap => Box::new(McapChunkWriter::create(
                path,
                format,
                self.compression,
                self.max_pending_bytes,
            )?),
            ContainerKind::Raw => Box::new(RawChunkWriter::create(
                path,
                format,
                self.max_pending_bytes,
            )?),
        })
    }

    fn writer_type(&self) -> &str {
        match self.container {
            ContainerKind::Mcap => "mcap",
            ContainerKind::Raw => "raw",
        }
    }
}
