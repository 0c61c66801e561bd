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

// Coordinator-pushed client configuration

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::transport::{Endpoint, TrustPolicy};

const MIB: u64 = 1024 * 1024;

/// Container format requested by the coordinator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mp4,
    Mov,
}

impl VideoFormat {
    pub fn extension(self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "mp4",
            VideoFormat::Mov => "mov",
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for VideoFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(VideoFormat::Mp4),
            "mov" | "quicktime" => Ok(VideoFormat::Mov),
            other => bail!("unsupported video format '{}'", other),
        }
    }
}

/// Recording parameters owned by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub video_format: VideoFormat,
    pub chunk_duration_ms: u64,
    pub storage_max_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            video_format: VideoFormat::Mp4,
            chunk_duration_ms: 30_000,
            storage_max_bytes: 16_000 * MIB,
        }
    }
}

impl ClientConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }
}

/// Partial configuration as received in a `clientConfig` frame.
///
/// Missing or invalid keys keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientConfigPatch {
    pub video_format: Option<VideoFormat>,
    pub chunk_duration_ms: Option<u64>,
    pub storage_max_bytes: Option<u64>,
}

impl ClientConfigPatch {
    /// Extract known keys from a JSON object, ignoring everything else.
    pub fn from_value(value: &Value) -> Self {
        let mut patch = Self::default();
        let Some(obj) = value.as_object() else {
            warn!("clientConfig payload is not an object, ignoring");
            return patch;
        };

        if let Some(raw) = obj.get("videoFormat") {
            match raw.as_str().map(VideoFormat::from_str) {
                Some(Ok(format)) => patch.video_format = Some(format),
                _ => warn!("Ignoring invalid videoFormat {}", raw),
            }
        }

        let duration = obj
            .get("chunkDurationMs")
            .or_else(|| obj.get("videoChunkDurationMs"));
        if let Some(raw) = duration {
            match raw.as_u64().filter(|ms| *ms > 0) {
                Some(ms) => patch.chunk_duration_ms = Some(ms),
                None => warn!("Ignoring invalid chunk duration {}", raw),
            }
        }

        if let Some(raw) = obj.get("storageMaxBytes") {
            match raw.as_u64() {
                Some(bytes) => patch.storage_max_bytes = Some(bytes),
                None => warn!("Ignoring invalid storageMaxBytes {}", raw),
            }
        } else if let Some(raw) = obj.get("videoBufferMaxMB") {
            match raw.as_u64() {
                Some(mb) => patch.storage_max_bytes = Some(mb.saturating_mul(MIB)),
                None => warn!("Ignoring invalid videoBufferMaxMB {}", raw),
            }
        }

        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge_into(&self, base: ClientConfig) -> ClientConfig {
        ClientConfig {
            video_format: self.video_format.unwrap_or(base.video_format),
            chunk_duration_ms: self.chunk_duration_ms.unwrap_or(base.chunk_duration_ms),
            storage_max_bytes: self.storage_max_bytes.unwrap_or(base.storage_max_bytes),
        }
    }
}

/// Shared, replace-only holder of the current [`ClientConfig`].
///
/// Readers never block writers; each update swaps in a complete value.
pub struct ConfigSync {
    tx: watch::Sender<ClientConfig>,
}

impl ConfigSync {
    pub fn new(initial: ClientConfig) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> ClientConfig {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientConfig> {
        self.tx.subscribe()
    }

    /// Merge a patch onto the current value and publish the result.
    pub fn apply(&self, patch: &ClientConfigPatch) -> ClientConfig {
        let mut updated = self.current();
        self.tx.send_modify(|current| {
            *current = patch.merge_into(*current);
            updated = *current;
        });
        info!(
            "Client config updated: format={}, chunk={}ms, storage_max={} bytes",
            updated.video_format, updated.chunk_duration_ms, updated.storage_max_bytes
        );
        updated
    }

    pub fn replace(&self, config: ClientConfig) {
        self.tx.send_replace(config);
    }

    pub fn chunk_duration(&self) -> Duration {
        self.current().chunk_duration()
    }

    pub fn storage_ceiling(&self) -> u64 {
        self.current().storage_max_bytes
    }
}

impl Default for ConfigSync {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

// HTTP side-channel exposed by the coordinator

/// `GET /api/health` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub uptime: Option<f64>,
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Scheme that answered ("https" or "http")
    #[serde(skip)]
    pub scheme: String,
}

fn http_client(trust: TrustPolicy, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .timeout(timeout)
        .danger_accept_invalid_certs(trust == TrustPolicy::TrustAll)
        .build()
        .context("Failed to build HTTP client")
}

/// GET `path` over https first, then plain http.
async fn get_json<T: serde::de::DeserializeOwned>(
    host: &str,
    path: &str,
    trust: TrustPolicy,
    timeout: Duration,
) -> Result<(T, &'static str)> {
    let endpoint = Endpoint::parse(host)?;
    let client = http_client(trust, timeout)?;
    let mut last_error = None;

    for scheme in ["https", "http"] {
        let url = format!("{}://{}{}", scheme, endpoint.authority(), path);
        debug!("GET {}", url);
        let outcome = async {
            let response = client.get(&url).send().await?.error_for_status()?;
            response.json::<T>().await
        }
        .await;
        match outcome {
            Ok(body) => return Ok((body, scheme)),
            Err(e) => {
                warn!("GET {} failed: {}", url, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e).with_context(|| format!("GET {} failed on {}", path, host)),
        None => bail!("GET {} failed on {}", path, host),
    }
}

/// Query the coordinator's health endpoint.
pub async fn check_health(host: &str, trust: TrustPolicy, timeout: Duration) -> Result<HealthReport> {
    let (mut report, scheme): (HealthReport, _) =
        get_json(host, "/api/health", trust, timeout).await?;
    report.scheme = scheme.to_string();
    Ok(report)
}

/// Fetch the coordinator's client configuration ahead of the control channel.
pub async fn fetch_remote_config(
    host: &str,
    trust: TrustPolicy,
    timeout: Duration,
) -> Result<ClientConfigPatch> {
    let (value, _): (Value, _) = get_json(host, "/api/config", trust, timeout).await?;
    Ok(ClientConfigPatch::from_value(&value))
}
