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

//! Control channel framing.
//!
//! Text frames carry one JSON object each, discriminated by a `type` or
//! `command` field. Binary frames carry raw chunk bytes and always follow
//! the `upload` metadata frame describing them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::config_sync::ClientConfigPatch;
use crate::error::ProtocolError;

/// Duration used by `record` commands that do not carry one.
pub const DEFAULT_RECORD_DURATION: Duration = Duration::from_millis(30_000);

/// A single frame on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn is_text(&self) -> bool {
        matches!(self, Frame::Text(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Device → coordinator messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// Sent once, right after the channel opens.
    ClientInfo {
        #[serde(rename = "clientName")]
        client_name: String,
    },
    /// Metadata frame that must immediately precede the binary payload.
    Upload {
        filename: String,
        filesize: u64,
        mimetype: String,
    },
    /// Liveness check answered by a `status` frame.
    Test,
}

impl OutboundMessage {
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::Text)
    }
}

/// Coordinator acknowledgement or protocol-level error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub success: bool,
    pub message: String,
}

/// Commands the coordinator can push to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Upload every stored chunk overlapping `[start_ms, end_ms)`.
    UploadTimeRange { start_ms: i64, end_ms: i64 },
    /// Record for a bounded duration.
    Record { duration: Duration },
}

/// Parsed inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ClientConfig(ClientConfigPatch),
    Status(CoordinatorStatus),
    Command(RemoteCommand),
    /// Well-formed JSON with a shape we do not handle; logged and dropped.
    Unrecognized(String),
}

/// Parse a text frame received from the coordinator.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(obj) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if let Some(kind) = obj.get("type").and_then(Value::as_str) {
        return Ok(match kind {
            "clientConfig" => match obj.get("config") {
                Some(config) => InboundMessage::ClientConfig(ClientConfigPatch::from_value(config)),
                None => InboundMessage::Unrecognized("clientConfig without config".into()),
            },
            other => InboundMessage::Unrecognized(format!("type={other}")),
        });
    }

    if let Some(command) = obj.get("command").and_then(Value::as_str) {
        return Ok(parse_command(command, &obj));
    }

    if let Some(status) = obj.get("status").and_then(Value::as_str) {
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(match status {
            "success" => InboundMessage::Status(CoordinatorStatus {
                success: true,
                message,
            }),
            "error" => InboundMessage::Status(CoordinatorStatus {
                success: false,
                message,
            }),
            other => InboundMessage::Unrecognized(format!("status={other}")),
        });
    }

    Ok(InboundMessage::Unrecognized(summarize(&obj)))
}

fn parse_command(command: &str, obj: &Map<String, Value>) -> InboundMessage {
    match command {
        "uploadTimeRange" => {
            let start = obj.get("startTime").and_then(as_millis);
            let end = obj.get("endTime").and_then(as_millis);
            match (start, end) {
                (Some(start_ms), Some(end_ms)) => {
                    InboundMessage::Command(RemoteCommand::UploadTimeRange { start_ms, end_ms })
                }
                _ => InboundMessage::Unrecognized(
                    "uploadTimeRange without numeric startTime/endTime".into(),
                ),
            }
        }
        "record" => {
            let duration = obj
                .get("durationMs")
                .or_else(|| obj.get("duration"))
                .and_then(as_millis)
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(DEFAULT_RECORD_DURATION);
            InboundMessage::Command(RemoteCommand::Record { duration })
        }
        other => InboundMessage::Unrecognized(format!("command={other}")),
    }
}

/// Accept integral or fractional JSON numbers, and numeric strings.
fn as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn summarize(obj: &Map<String, Value>) -> String {
    let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
    format!("keys=[{}]", keys.join(","))
}

/// MIME type reported in the `upload` frame, derived from the file extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mcap" => "application/x-mcap",
        _ => "application/octet-stream",
    }
}
