//! Relay manager
//!
//! Supervises a named set of relays for a daemon or CLI: starting and
//! stopping them, reporting status and live connections, and force-closing
//! connections by relay or client address.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

use crate::common::{RelayError, Result};
use crate::endpoint::Protocol;
use crate::metrics::MetricsSnapshot;
use crate::relay::Relay;

/// Status of one managed relay
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    /// Relay name
    pub name: String,
    /// Listen endpoint
    pub listener: String,
    /// Whether the listener is open
    pub running: bool,
    /// Bound address while running
    pub local_addr: Option<SocketAddr>,
    /// Counters at the time of the call
    pub metrics: MetricsSnapshot,
}

/// One live connection across all relays
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Relay that accepted the connection
    pub relay: String,
    /// Relay's listen endpoint
    pub listener: String,
    /// Client address
    pub peer: SocketAddr,
    /// Address the client connected to
    pub local: SocketAddr,
    /// Transport of the accepted connection
    pub network: Protocol,
    /// Destination address once dialed
    pub forwarded: Option<String>,
    /// When the connection was accepted
    pub opened_at: DateTime<Utc>,
}

struct ManagedRelay {
    relay: Arc<Relay>,
    task: JoinHandle<Result<()>>,
}

/// Named set of running relays
#[derive(Default)]
pub struct RelayManager {
    relays: Mutex<BTreeMap<String, ManagedRelay>>,
}

impl RelayManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    fn relays(&self) -> MutexGuard<'_, BTreeMap<String, ManagedRelay>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a relay's listener and serve it in the background
    ///
    /// Bind errors are returned here rather than from the background task.
    pub async fn start(&self, relay: Relay) -> Result<Arc<Relay>> {
        let name = relay.name().to_string();
        if self.relays().contains_key(&name) {
            return Err(RelayError::Config(format!("relay {:?} is already managed", name)));
        }

        let relay = Arc::new(relay);
        let bound = relay.bind().await?;

        let task = tokio::spawn({
            let relay = Arc::clone(&relay);
            async move {
                let result = Arc::clone(&relay).run(bound).await;
                if let Err(e) = &result {
                    error!("[{}] Relay stopped with error: {}", relay.name(), e);
                }
                result
            }
        });

        let previous = self.relays().insert(
            name.clone(),
            ManagedRelay {
                relay: Arc::clone(&relay),
                task,
            },
        );
        if let Some(previous) = previous {
            // Lost a race with another start of the same name
            warn!("[{}] Replacing relay started concurrently", name);
            let _ = previous.relay.close();
        }

        info!("[{}] Started", name);
        Ok(relay)
    }

    /// Look up a managed relay
    pub fn get(&self, name: &str) -> Option<Arc<Relay>> {
        self.relays().get(name).map(|managed| Arc::clone(&managed.relay))
    }

    /// Names of the managed relays
    pub fn names(&self) -> Vec<String> {
        self.relays().keys().cloned().collect()
    }

    /// Close a relay's listener and wait for its accept loop to finish
    ///
    /// Live connections are left running.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let managed = self
            .relays()
            .remove(name)
            .ok_or_else(|| RelayError::UnknownRelay(name.to_string()))?;

        match managed.relay.close() {
            Ok(()) | Err(RelayError::NotRunning) => {}
            Err(e) => return Err(e),
        }

        match managed.task.await {
            Ok(result) => result,
            Err(e) => Err(RelayError::Config(format!("relay task for {:?} failed: {}", name, e))),
        }
    }

    /// Stop every relay, logging failures
    pub async fn stop_all(&self) {
        for name in self.names() {
            if let Err(e) = self.stop(&name).await {
                warn!("[{}] Stop failed: {}", name, e);
            }
        }
    }

    /// Status of every managed relay, ordered by name
    pub fn status(&self) -> Vec<RelayStatus> {
        self.relays()
            .values()
            .map(|managed| {
                let relay = &managed.relay;
                RelayStatus {
                    name: relay.name().to_string(),
                    listener: relay.listener().to_string(),
                    running: relay.running(),
                    local_addr: relay.local_addr(),
                    metrics: relay.metrics().snapshot(),
                }
            })
            .collect()
    }

    /// Every live connection on every relay
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.all()
            .iter()
            .flat_map(|relay| {
                let listener = relay.listener().to_string();
                relay.connections().into_iter().map(move |entry| ConnectionInfo {
                    relay: relay.name().to_string(),
                    listener: listener.clone(),
                    peer: entry.conn.peer_addr(),
                    local: entry.conn.local_addr(),
                    network: entry.conn.network(),
                    forwarded: entry.remote_addr,
                    opened_at: entry.opened_at,
                })
            })
            .collect()
    }

    fn all(&self) -> Vec<Arc<Relay>> {
        self.relays()
            .values()
            .map(|managed| Arc::clone(&managed.relay))
            .collect()
    }

    /// Close every live connection on every relay
    pub fn drop_all(&self) -> usize {
        self.all().iter().map(|relay| relay.drop_all()).sum()
    }

    /// Close every live connection from `ip`
    pub fn drop_ip(&self, ip: IpAddr) -> usize {
        self.all().iter().map(|relay| relay.drop_ip(ip)).sum()
    }

    /// Close every live connection on one relay
    pub fn drop_relay(&self, name: &str) -> Result<usize> {
        let relay = self.get(name).ok_or_else(|| RelayError::UnknownRelay(name.to_string()))?;
        Ok(relay.drop_all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    fn relay(name: &str) -> Relay {
        Relay::new(
            name,
            Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
            vec![Endpoint::parse("tcp://127.0.0.1:9").unwrap()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let manager = RelayManager::new();
        let started = manager.start(relay("alpha")).await.unwrap();
        manager.start(relay("beta")).await.unwrap();
        assert!(started.running());

        let status = manager.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "alpha");
        assert!(status.iter().all(|s| s.running && s.local_addr.is_some()));

        let json = serde_json::to_string(&status[0]).unwrap();
        assert!(json.contains("\"name\":\"alpha\""));
        assert!(json.contains("\"total_connections\":0"));

        assert!(manager.start(relay("alpha")).await.is_err());

        manager.stop("alpha").await.unwrap();
        assert!(!started.running());
        assert_eq!(manager.names(), vec!["beta".to_string()]);
        assert!(matches!(
            manager.stop("alpha").await,
            Err(RelayError::UnknownRelay(_))
        ));

        manager.stop_all().await;
        assert!(manager.names().is_empty());
    }

    #[tokio::test]
    async fn test_drop_unknown_relay() {
        let manager = RelayManager::new();
        assert!(matches!(
            manager.drop_relay("nope"),
            Err(RelayError::UnknownRelay(_))
        ));
        assert_eq!(manager.drop_all(), 0);
        assert!(manager.connections().is_empty());
    }
}
