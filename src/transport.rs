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

//! Transport abstraction for the control channel.
//!
//! The connection manager only talks to [`Connector`], [`FrameSink`] and
//! [`FrameStream`]; [`WebSocketConnector`] is the production implementation
//! on top of tokio-tungstenite.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::fmt;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::protocol::Frame;

/// Port used when the configured host carries none.
pub const DEFAULT_PORT: u16 = 8080;

/// Certificate policy for secure connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    Verify,
    TrustAll,
}

impl TrustPolicy {
    pub fn from_verify_flag(verify: bool) -> Self {
        if verify {
            TrustPolicy::Verify
        } else {
            TrustPolicy::TrustAll
        }
    }
}

/// Where to connect. A fallback attempt builds a new value instead of
/// mutating the one in use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// Parse a user-supplied host string, stripping any protocol prefix.
    /// The result defaults to `secure = true`.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();
        let mut rest = trimmed;
        for prefix in ["https://", "http://", "wss://", "ws://"] {
            if lower.starts_with(prefix) {
                rest = &trimmed[prefix.len()..];
                break;
            }
        }
        let authority = rest.split('/').next().unwrap_or_default();

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| TransportError::InvalidEndpoint(input.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, input)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(TransportError::InvalidEndpoint(input.to_string())),
            };
            (host.to_string(), port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(port, input)?),
                None => (authority.to_string(), DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(input.to_string()));
        }

        Ok(Self {
            host,
            port,
            secure: true,
        })
    }

    /// Same host/port over plain `ws://`.
    pub fn insecure(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            secure: false,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

fn parse_port(raw: &str, input: &str) -> Result<u16, TransportError> {
    raw.parse()
        .map_err(|_| TransportError::InvalidEndpoint(input.to_string()))
}

/// Outbound half of an open channel.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Best-effort close; errors are swallowed.
    async fn close(&mut self);
}

/// Inbound half of an open channel.
#[async_trait]
pub trait FrameStream: Send {
    /// Next data frame, or `None` once the peer closed the channel.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// An opened channel, split into its two halves.
pub struct Channel {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens channels to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        trust: TrustPolicy,
    ) -> Result<Channel, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite backed [`Connector`].
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        ensure_crypto_provider();
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        trust: TrustPolicy,
    ) -> Result<Channel, TransportError> {
        let url = endpoint.url();
        let tls = match (endpoint.secure, trust) {
            (true, TrustPolicy::TrustAll) => Some(tokio_tungstenite::Connector::Rustls(Arc::new(
                trust_all_config(),
            ))),
            _ => None,
        };

        debug!("Opening WebSocket to {}", url);
        let handshake = connect_async_tls_with_config(url.as_str(), None, false, tls);
        let (ws, response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(TransportError::classify)?;
        debug!("WebSocket upgrade to {} answered {}", url, response.status());

        let (write, read) = ws.split();
        Ok(Channel {
            sink: Box::new(WsSink { inner: write }),
            stream: Box::new(WsFrames { inner: read }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.inner
            .send(message)
            .await
            .map_err(TransportError::classify)
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            trace!("Ignoring close error: {}", e);
        }
    }
}

struct WsFrames {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.to_string()))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(data))),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Coordinator closed channel: {:?}", frame);
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::classify(e)),
                None => return Ok(None),
            }
        }
    }
}

static CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

fn trust_all_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

/// Verifier used when certificate verification is switched off.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
        ]
    }
}
