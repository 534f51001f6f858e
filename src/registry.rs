//! Backend registry and live-session table.
//!
//! The registry is populated once at startup and never mutated after:
//! an ordered list of backend supervisors plus a map from lowercased
//! profile id to the supervisor serving it. The session table is the
//! one mutable piece, tracking the outbound channel of every connected
//! client so backend replies can be routed by client id.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, RwLock};

use crate::backend::BackendSupervisor;
use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Outbound channel of one client session. The payload buffer is owned
/// by the channel message until the session's writer task has written
/// it to the client pipe.
pub type ReplySender = mpsc::UnboundedSender<Vec<u8>>;

/// Live client sessions, keyed by client id.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: RwLock<HashMap<String, ReplySender>>,
}

impl SessionTable {
    pub async fn insert(&self, client_id: &str, sender: ReplySender) {
        self.inner
            .write()
            .await
            .insert(client_id.to_string(), sender);
    }

    pub async fn remove(&self, client_id: &str) {
        self.inner.write().await.remove(client_id);
    }

    /// Deliver one backend reply to the client it is addressed to. A
    /// reply for a client that already disconnected is dropped; that is
    /// an ordinary race, not an error.
    pub async fn route_reply(&self, client_id: &str, payload: Vec<u8>) {
        let sender = self.inner.read().await.get(client_id).cloned();
        match sender {
            Some(sender) => {
                if sender.send(payload).is_err() {
                    debug!("client '{}' went away mid-reply", client_id);
                }
            }
            None => debug!(
                "dropping reply: {}",
                BrokerError::UnknownClient(client_id.to_string())
            ),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Process-wide catalogue of backends and profile mappings.
pub struct Registry {
    backends: Vec<Arc<BackendSupervisor>>,
    profiles: HashMap<String, Arc<BackendSupervisor>>,
    sessions: Arc<SessionTable>,
}

impl Registry {
    /// Build the registry from discovered backend definitions. The
    /// supervisors share the registry's session table so their stdout
    /// read loops can route replies.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let sessions = Arc::new(SessionTable::default());

        let backends: Vec<Arc<BackendSupervisor>> = config
            .backends
            .iter()
            .map(|descriptor| {
                Arc::new(BackendSupervisor::new(
                    descriptor.clone(),
                    &config.broker_dir,
                    Arc::clone(&sessions),
                ))
            })
            .collect();

        let mut profiles = HashMap::new();
        for (guid, name) in &config.profiles {
            match backends.iter().find(|backend| backend.name() == name) {
                Some(backend) => {
                    profiles.insert(guid.clone(), Arc::clone(backend));
                }
                None => warn!("profile {} references unknown backend '{}'", guid, name),
            }
        }

        Self {
            backends,
            profiles,
            sessions,
        }
    }

    /// Look up a backend by name. The list is tiny, so a linear scan
    /// beats a map here.
    pub fn by_name(&self, name: &str) -> Option<&Arc<BackendSupervisor>> {
        self.backends.iter().find(|backend| backend.name() == name)
    }

    /// Look up a backend by profile id, case-insensitively.
    pub fn by_profile_id(&self, profile_id: &str) -> Option<Arc<BackendSupervisor>> {
        self.profiles.get(&profile_id.to_lowercase()).cloned()
    }

    /// Route one backend reply by client id; see [`SessionTable::route_reply`].
    pub async fn route_reply(&self, client_id: &str, payload: Vec<u8>) {
        self.sessions.route_reply(client_id, payload).await;
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn backends(&self) -> &[Arc<BackendSupervisor>] {
        &self.backends
    }

    /// Signal every supervisor to terminate its child. Fire-and-forget.
    pub async fn terminate_all(&self) {
        for backend in &self.backends {
            backend.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDescriptor;
    use std::path::PathBuf;

    fn test_config() -> BrokerConfig {
        let mut profiles = HashMap::new();
        profiles.insert("{aaaa-bbbb}".to_string(), "python".to_string());
        profiles.insert("{cccc-dddd}".to_string(), "missing".to_string());
        BrokerConfig {
            broker_dir: PathBuf::from("/nonexistent"),
            backends: vec![BackendDescriptor {
                name: "python".to_string(),
                command: "python.exe".to_string(),
                working_dir: ".".to_string(),
                params: String::new(),
            }],
            profiles,
        }
    }

    #[test]
    fn lookup_by_name_and_profile() {
        let registry = Registry::from_config(&test_config());

        assert!(registry.by_name("python").is_some());
        assert!(registry.by_name("ruby").is_none());

        // Profile lookup is case-insensitive.
        assert!(registry.by_profile_id("{AAAA-BBBB}").is_some());
        assert!(registry.by_profile_id("{aaaa-bbbb}").is_some());
        assert!(registry.by_profile_id("{eeee-ffff}").is_none());
    }

    #[test]
    fn profile_for_unknown_backend_is_dropped() {
        let registry = Registry::from_config(&test_config());
        assert!(registry.by_profile_id("{cccc-dddd}").is_none());
    }

    #[tokio::test]
    async fn route_reply_reaches_the_matching_session() {
        let registry = Registry::from_config(&test_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.sessions().insert("c1", tx).await;

        registry.route_reply("c1", b"payload".to_vec()).await;
        assert_eq!(rx.recv().await.unwrap(), b"payload");

        // Unknown clients are dropped silently.
        registry.route_reply("c2", b"lost".to_vec()).await;

        registry.sessions().remove("c1").await;
        assert!(registry.sessions().is_empty().await);
    }
}
