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

// mDNS discovery of the coordinator

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::IpAddr;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;

/// A coordinator advertisement. Consumed once, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub service_id: String,
    /// `(host, port)` once the record resolved to an address
    pub resolved_endpoint: Option<(String, u16)>,
}

impl DiscoveredServer {
    fn from_record(fullname: &str, addresses: &[IpAddr], port: u16) -> Self {
        Self {
            service_id: fullname.to_string(),
            resolved_endpoint: pick_address(addresses).map(|ip| (ip.to_string(), port)),
        }
    }

    /// Host string in the form the connection settings expect
    pub fn host_string(&self) -> Option<String> {
        self.resolved_endpoint.as_ref().map(|(host, port)| {
            if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            }
        })
    }
}

/// Prefer IPv4, then any non-loopback address
fn pick_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|a| a.is_ipv4() && !a.is_loopback())
        .or_else(|| addresses.iter().find(|a| !a.is_loopback()))
        .or_else(|| addresses.first())
        .copied()
}

/// Running browse; dropping it does not stop the daemon, call [`shutdown`](Self::shutdown).
pub struct Discovery {
    daemon: ServiceDaemon,
    service_type: String,
    task: JoinHandle<()>,
}

impl Discovery {
    /// Browse for `service_type` and feed every resolved coordinator to
    /// the connection manager.
    pub fn start(service_type: &str, connection: ConnectionManager) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("Cannot start mDNS daemon")?;
        let receiver = daemon
            .browse(service_type)
            .with_context(|| format!("Cannot browse mDNS for {}", service_type))?;
        info!("mDNS: browsing for {}", service_type);

        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let addresses: Vec<IpAddr> =
                            info.get_addresses().iter().map(|a| a.to_ip_addr()).collect();
                        let server = DiscoveredServer::from_record(
                            info.get_fullname(),
                            &addresses,
                            info.get_port(),
                        );
                        let Some(host) = server.host_string() else {
                            debug!("mDNS: {} resolved without address", server.service_id);
                            continue;
                        };
                        info!("mDNS: coordinator {} at {}", server.service_id, host);
                        if !connection.offer_discovered_host(host).await {
                            debug!("mDNS: ignoring {}", server.service_id);
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, name) => {
                        debug!("mDNS: {} went away", name);
                    }
                    _ => {}
                }
            }
            debug!("mDNS: browse channel closed");
        });

        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            task,
        })
    }

    pub fn shutdown(self) {
        self.task.abort();
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            warn!("mDNS: stop_browse failed: {}", e);
        }
        let _ = self.daemon.shutdown();
    }
}
