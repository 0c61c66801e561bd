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

// Error types shared across the control channel and upload pipeline

use std::io;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Classified transport failure.
///
/// The connection manager decides whether to downgrade from `wss://` to
/// `ws://` by looking at the variant, never at the error text.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("upgrade handshake rejected: {0}")]
    Handshake(String),

    #[error("channel closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether a failed secure attempt may be retried once over plain `ws://`.
    pub fn permits_fallback(&self) -> bool {
        !matches!(self, TransportError::InvalidEndpoint(_))
    }

    /// Map a tungstenite error onto the transport taxonomy.
    pub fn classify(err: tungstenite::Error) -> Self {
        use tungstenite::Error;

        match err {
            Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
            Error::Tls(e) => TransportError::Tls(e.to_string()),
            Error::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => TransportError::Refused(e.to_string()),
                io::ErrorKind::TimedOut => TransportError::Timeout(Duration::ZERO),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                    TransportError::Closed
                }
                _ => TransportError::Io(e),
            },
            Error::Http(response) => {
                TransportError::Handshake(format!("HTTP {}", response.status()))
            }
            Error::HttpFormat(e) => TransportError::Handshake(e.to_string()),
            Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// Malformed inbound control frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Failure of a single chunk transfer.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("control channel not connected")]
    NotConnected,

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[from] TransportError),

    #[error("upload queue closed")]
    QueueClosed,
}
