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

// Device-side agent for an allspark coordinator
//
// This agent:
// - Records captured video/audio into fixed-duration chunks on local storage
// - Keeps a WebSocket control channel to the coordinator, falling back to ws://
// - Uploads finalized chunks one at a time as metadata + binary frame pairs
// - Applies coordinator-pushed recording configuration at runtime
// - Answers uploadTimeRange and record commands

pub mod buffer;
pub mod config;
pub mod config_sync;
pub mod connection;
pub mod control;
pub mod discovery;
pub mod error;
pub mod mcap_writer;
pub mod protocol;
pub mod recorder;
pub mod source;
pub mod storage;
pub mod transport;
pub mod upload;

// Re-export main types
pub use buffer::{sample_channel, AudioBuffer, MediaKind, MediaSample, SampleSink, VideoFrame};
pub use config::{load_config, load_config_with_env, AgentConfig};
pub use config_sync::{ClientConfig, ClientConfigPatch, ConfigSync, VideoFormat};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use control::ControlInterface;
pub use discovery::{DiscoveredServer, Discovery};
pub use error::{ProtocolError, TransportError, UploadError};
pub use mcap_writer::{McapChunkWriter, RawChunkWriter};
pub use protocol::{parse_inbound, Frame, InboundMessage, OutboundMessage, RemoteCommand};
pub use recorder::{ChunkEvent, ChunkRecorder, FinishedChunk, RecorderOptions, RecorderStatus};
pub use storage::{ChunkStore, ChunkWriter, ChunkWriterFactory, WriterFactory};
pub use transport::{Endpoint, TrustPolicy, WebSocketConnector};
pub use upload::{PendingTransfer, Transfer, TransferState, UploadQueue};
