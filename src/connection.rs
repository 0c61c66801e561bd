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

//! Control channel connection manager.
//!
//! Owns the transport and the `Disconnected → Connecting → Connected` state
//! machine. A secure attempt that fails is retried exactly once over plain
//! `ws://`; a channel that drops after being established is retried on a
//! fixed delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config_sync::ConfigSync;
use crate::error::TransportError;
use crate::protocol::{parse_inbound, Frame, InboundMessage, OutboundMessage, RemoteCommand};
use crate::transport::{Channel, Connector, Endpoint, FrameSink, FrameStream, TrustPolicy};

/// Delay before reconnecting after an established channel drops.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connectivity as observed by the rest of the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting(Endpoint),
    Connected { endpoint: Endpoint, secure: bool },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

/// User-controlled settings that shape the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub trust: TrustPolicy,
    pub client_name: String,
}

/// Name announced in the `clientInfo` frame.
pub fn client_display_name(client_name: Option<&str>, device_name: &str) -> String {
    match client_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("{} ({})", name, device_name),
        None => device_name.to_string(),
    }
}

/// Outbound half plus the receive loop of one established channel
struct Installed {
    epoch: u64,
    sink: Box<dyn FrameSink>,
    receiver: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    settings: RwLock<ConnectionSettings>,
    state: watch::Sender<ConnectionState>,
    sink: tokio::sync::Mutex<Option<Installed>>,
    // Bumped on every teardown; attempts, receive loops and channel guards
    // from an older epoch must not touch state or the transport.
    epoch: watch::Sender<u64>,
    reconnect_pending: AtomicBool,
    resolving: AtomicBool,
    reconnect_delay: Duration,
    config: Arc<ConfigSync>,
    commands: mpsc::UnboundedSender<RemoteCommand>,
}

/// Process-wide owner of the control channel.
///
/// Cheap to clone; every clone drives the same state machine.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Exclusive access to the outbound half of the channel.
///
/// Frames sent through one guard are never interleaved with frames from
/// another sender.
///
/// A teardown (`disconnect()` or a dropped channel) aborts a pending send
/// with [`TransportError::Closed`].
pub struct ChannelGuard<'a> {
    slot: MutexGuard<'a, Option<Installed>>,
    epoch: u64,
    teardown: watch::Receiver<u64>,
}

impl ChannelGuard<'_> {
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let epoch = self.epoch;
        let Some(installed) = self.slot.as_mut() else {
            return Err(TransportError::Closed);
        };
        if *self.teardown.borrow_and_update() != epoch {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;

            _ = self.teardown.wait_for(|current| *current != epoch) => {
                debug!("Send aborted by teardown");
                Err(TransportError::Closed)
            }
            result = installed.sink.send(frame) => result,
        }
    }
}

impl ConnectionManager {
    /// Build the manager. Remote commands arrive on the returned receiver.
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
        config: Arc<ConfigSync>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RemoteCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (epoch, _) = watch::channel(0);
        let inner = Inner {
            connector,
            settings: RwLock::new(settings),
            state,
            sink: tokio::sync::Mutex::new(None),
            epoch,
            reconnect_pending: AtomicBool::new(false),
            resolving: AtomicBool::new(false),
            reconnect_delay,
            config,
            commands,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            command_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().is_connected()
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> &Arc<ConfigSync> {
        &self.inner.config
    }

    /// Open the channel unless an attempt is already running or succeeded.
    pub async fn connect(&self) {
        let settings = self.settings();
        let endpoint = match Endpoint::parse(&settings.host) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Cannot connect to '{}': {}", settings.host, e);
                return;
            }
        };

        let mut epoch = 0;
        let claimed = self.inner.state.send_if_modified(|state| {
            if state.is_disconnected() {
                epoch = self.current_epoch();
                *state = ConnectionState::Connecting(endpoint.clone());
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("connect() ignored while {:?}", self.state());
            return;
        }

        info!("Connecting to {}", endpoint);
        let err = match self.attempt(&endpoint, &settings, epoch).await {
            Ok(()) => return,
            Err(err) => err,
        };

        if !(endpoint.secure && err.permits_fallback()) {
            warn!("Connection to {} failed: {}", endpoint, err);
            self.transition(epoch, ConnectionState::Disconnected);
            return;
        }

        let fallback = endpoint.insecure();
        warn!(
            "Secure connection to {} failed ({}), retrying with {}",
            endpoint, err, fallback
        );
        if !self.transition(epoch, ConnectionState::Connecting(fallback.clone())) {
            return;
        }
        if let Err(err) = self.attempt(&fallback, &settings, epoch).await {
            warn!("Connection to {} failed: {}", fallback, err);
            self.transition(epoch, ConnectionState::Disconnected);
        }
    }

    /// Tear the channel down. Idempotent.
    ///
    /// The state is `Disconnected` before this awaits anything; a transfer
    /// holding the channel has its pending send aborted.
    pub async fn disconnect(&self) {
        let Some((epoch, previous)) = self.retire(None) else {
            return;
        };
        if !previous.is_disconnected() {
            info!("Disconnected (was {:?})", previous);
        }

        let stale = {
            let mut slot = self.inner.sink.lock().await;
            if slot.as_ref().is_some_and(|installed| installed.epoch < epoch) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(mut installed) = stale {
            installed.receiver.abort();
            installed.sink.close().await;
        }
    }

    /// Replace the settings; a host or trust change reconnects.
    pub async fn update_settings(&self, settings: ConnectionSettings) {
        let previous = {
            let mut current = self
                .inner
                .settings
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, settings.clone())
        };
        if previous.host != settings.host || previous.trust != settings.trust {
            info!("Connection settings changed, reconnecting");
            self.disconnect().await;
            self.connect().await;
        }
    }

    pub async fn set_host(&self, host: String) {
        let mut settings = self.settings();
        settings.host = host;
        self.update_settings(settings).await;
    }

    /// Feed a host:port resolved by service discovery.
    ///
    /// Returns `false` when the candidate was ignored because the channel is
    /// already up or another resolution is being applied.
    pub async fn offer_discovered_host(&self, host: String) -> bool {
        if self.is_connected() {
            return false;
        }
        if self
            .inner
            .resolving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Discovery result for {} ignored, resolution in progress", host);
            return false;
        }

        let configured = self.settings().host;
        let unchanged = match (Endpoint::parse(&configured), Endpoint::parse(&host)) {
            (Ok(a), Ok(b)) => a == b,
            _ => configured == host,
        };
        if unchanged {
            if self.state().is_disconnected() {
                self.connect().await;
            }
        } else {
            info!("Discovered coordinator at {}, replacing {}", host, configured);
            self.set_host(host).await;
        }

        self.inner.resolving.store(false, Ordering::Release);
        true
    }

    /// Lock the outbound half for a sequence of frames.
    pub async fn lock_channel(&self) -> Result<ChannelGuard<'_>, TransportError> {
        let slot = self.inner.sink.lock().await;
        let current = self.current_epoch();
        match slot.as_ref() {
            Some(installed) if installed.epoch == current => {}
            _ => return Err(TransportError::Closed),
        }
        Ok(ChannelGuard {
            slot,
            epoch: current,
            teardown: self.inner.epoch.subscribe(),
        })
    }

    /// Send a single frame outside of any transfer.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let frame = message
            .to_frame()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.lock_channel().await?.send(frame).await
    }

    fn current_epoch(&self) -> u64 {
        *self.inner.epoch.borrow()
    }

    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if self.current_epoch() == epoch {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Bump the epoch and mark the channel down in one step, so no attempt
    /// can claim `Connecting` in between. With `expected`, only when the
    /// epoch still matches. Returns the new epoch and the replaced state.
    fn retire(&self, expected: Option<u64>) -> Option<(u64, ConnectionState)> {
        let mut retired = None;
        self.inner.state.send_if_modified(|state| {
            let current = self.current_epoch();
            if expected.is_some_and(|epoch| epoch != current) {
                return false;
            }
            let next = current + 1;
            self.inner.epoch.send_replace(next);
            let previous = std::mem::replace(state, ConnectionState::Disconnected);
            let changed = !previous.is_disconnected();
            retired = Some((next, previous));
            changed
        });
        retired
    }

    /// One connect + clientInfo exchange. `Ok` also covers attempts that were
    /// abandoned because a disconnect happened meanwhile.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        settings: &ConnectionSettings,
        epoch: u64,
    ) -> Result<(), TransportError> {
        let Channel { mut sink, stream } =
            self.inner.connector.connect(endpoint, settings.trust).await?;

        let hello = OutboundMessage::ClientInfo {
            client_name: settings.client_name.clone(),
        }
        .to_frame()
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Err(e) = sink.send(hello).await {
            sink.close().await;
            return Err(e);
        }
        debug!("Client info sent as '{}'", settings.client_name);

        let mut slot = self.inner.sink.lock().await;
        let connected = ConnectionState::Connected {
            endpoint: endpoint.clone(),
            secure: endpoint.secure,
        };
        if !self.transition(epoch, connected) {
            drop(slot);
            debug!("Connection to {} superseded, closing", endpoint);
            sink.close().await;
            return Ok(());
        }
        let receiver = tokio::spawn(self.clone().receive_loop(stream, epoch));
        let replaced = slot.replace(Installed {
            epoch,
            sink,
            receiver,
        });
        drop(slot);

        if let Some(mut old) = replaced {
            old.receiver.abort();
            old.sink.close().await;
        }
        info!("Connected to {}", endpoint);
        Ok(())
    }

    async fn receive_loop(self, mut stream: Box<dyn FrameStream>, epoch: u64) {
        loop {
            match stream.recv().await {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => {
                    self.handle_drop(epoch, "closed by coordinator".to_string())
                        .await;
                    break;
                }
                Err(e) => {
                    self.handle_drop(epoch, e.to_string()).await;
                    break;
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => {
                debug!("Ignoring {} bytes of inbound binary data", data.len());
                return;
            }
        };

        match parse_inbound(&text) {
            Ok(InboundMessage::ClientConfig(patch)) => {
                self.inner.config.apply(&patch);
            }
            Ok(InboundMessage::Status(status)) if status.success => {
                info!("Coordinator: {}", status.message);
            }
            Ok(InboundMessage::Status(status)) => {
                warn!("Coordinator reported error: {}", status.message);
            }
            Ok(InboundMessage::Command(command)) => {
                info!("Remote command: {:?}", command);
                if self.inner.commands.send(command).is_err() {
                    warn!("No command handler running, dropping remote command");
                }
            }
            Ok(InboundMessage::Unrecognized(summary)) => {
                info!("Dropping unrecognized message ({})", summary);
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
            }
        }
    }

    async fn handle_drop(&self, epoch: u64, reason: String) {
        if self.retire(Some(epoch)).is_none() {
            return;
        }
        warn!("Connection lost: {}", reason);

        let ours = {
            let mut slot = self.inner.sink.lock().await;
            if slot.as_ref().is_some_and(|installed| installed.epoch == epoch) {
                slot.take()
            } else {
                None
            }
        };
        // The receiver handle is this task; dropping it detaches.
        if let Some(mut installed) = ours {
            installed.sink.close().await;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        if self
            .inner
            .reconnect_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconnect already scheduled");
            return;
        }

        let delay = self.inner.reconnect_delay;
        info!("Reconnecting in {:?}", delay);
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager
                .inner
                .reconnect_pending
                .store(false, Ordering::Release);
            if manager.state().is_disconnected() {
                info!("Attempting auto-reconnect");
                manager.connect().await;
            }
        });
    }
}
