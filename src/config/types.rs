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

// Configuration types for allspark-agent

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config_sync::{ClientConfig, VideoFormat};
use crate::transport::TrustPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub recorder: RecorderSettings,
    #[serde(default)]
    pub client_defaults: ClientDefaults,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_true")]
    pub verify_certificate: bool,

    /// Optional label shown by the coordinator next to the device name
    #[serde(default)]
    pub client_name: Option<String>,

    /// Defaults to the device id
    #[serde(default)]
    pub device_name: Option<String>,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_seconds: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            verify_certificate: true,
            client_name: None,
            device_name: None,
            reconnect_delay_seconds: default_reconnect_delay(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy::from_verify_flag(self.verify_certificate)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Chunk container written to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    #[default]
    Mcap,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Lz4,
    #[default]
    Zstd,
}

/// Recorder-specific settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderSettings {
    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Initial source selector, e.g. which camera
    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default = "default_true")]
    pub auto_upload: bool,

    #[serde(default = "default_queue_capacity")]
    pub sample_queue_capacity: usize,

    #[serde(default)]
    pub container: ContainerKind,

    #[serde(default)]
    pub compression: CompressionType,

    /// Buffered bytes above which a writer reports it is not ready
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            storage_dir: default_storage_dir(),
            source: default_source(),
            auto_upload: true,
            sample_queue_capacity: default_queue_capacity(),
            container: ContainerKind::default(),
            compression: CompressionType::default(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

/// Client configuration in effect before the coordinator sends one
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientDefaults {
    #[serde(default)]
    pub video_format: VideoFormat,

    #[serde(default = "default_chunk_duration_ms")]
    pub chunk_duration_ms: u64,

    #[serde(default = "default_storage_max_bytes")]
    pub storage_max_bytes: u64,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        let config = ClientConfig::default();
        Self {
            video_format: config.video_format,
            chunk_duration_ms: config.chunk_duration_ms,
            storage_max_bytes: config.storage_max_bytes,
        }
    }
}

impl ClientDefaults {
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            video_format: self.video_format,
            chunk_duration_ms: self.chunk_duration_ms,
            storage_max_bytes: self.storage_max_bytes,
        }
    }
}

/// mDNS coordinator discovery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_service_type")]
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_type: default_service_type(),
        }
    }
}

/// Synthetic capture producers used by the binary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_video_fps")]
    pub video_fps: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,

    #[serde(default = "default_audio_channels")]
    pub audio_channels: u16,

    #[serde(default = "default_audio_buffer_ms")]
    pub audio_buffer_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            video_fps: default_video_fps(),
            width: default_width(),
            height: default_height(),
            audio_sample_rate: default_audio_sample_rate(),
            audio_channels: default_audio_channels(),
            audio_buffer_ms: default_audio_buffer_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_host() -> String { "localhost:8080".to_string() }
fn default_reconnect_delay() -> u64 { 5 }
fn default_connect_timeout() -> u64 { 10 }
fn default_device_id() -> String { "device-001".to_string() }
fn default_storage_dir() -> PathBuf { PathBuf::from("/data/chunks") }
fn default_source() -> String { "front".to_string() }
fn default_queue_capacity() -> usize { 256 }
fn default_max_pending_bytes() -> u64 { 64 * 1024 * 1024 }
fn default_chunk_duration_ms() -> u64 { ClientConfig::default().chunk_duration_ms }
fn default_storage_max_bytes() -> u64 { ClientConfig::default().storage_max_bytes }
fn default_service_type() -> String { "_allspark._tcp.local.".to_string() }
fn default_video_fps() -> u32 { 15 }
fn default_width() -> u32 { 320 }
fn default_height() -> u32 { 240 }
fn default_audio_sample_rate() -> u32 { 48_000 }
fn default_audio_channels() -> u16 { 1 }
fn default_audio_buffer_ms() -> u64 { 20 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
