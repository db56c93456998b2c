use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// One executor server in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Base address, e.g. "http://exec-1:9090".
    pub address: String,
    /// Node-type prefixes this server accepts; empty means everything.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub gpu_available: bool,
    /// Load in [0, 1] as last reported.
    #[serde(default)]
    pub current_load: f64,
    /// Models currently warm on this server, for session affinity.
    #[serde(default)]
    pub loaded_models: Vec<String>,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

impl ServerInfo {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            capabilities: Vec::new(),
            gpu_available: false,
            current_load: 0.0,
            loaded_models: Vec::new(),
            healthy: true,
        }
    }

    pub fn supports(&self, node_type: &str) -> bool {
        self.capabilities.is_empty()
            || self.capabilities.iter().any(|c| node_type.starts_with(c))
    }

    pub fn has_model(&self, model_id: &str) -> bool {
        self.loaded_models.iter().any(|m| m == model_id)
    }
}

/// Fleet membership, keyed by address. The round-robin counter lives
/// here so tie-breaking spreads load across all callers.
pub struct ServerFleet {
    servers: RwLock<HashMap<String, ServerInfo>>,
    rr: AtomicUsize,
}

impl ServerFleet {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            rr: AtomicUsize::new(0),
        }
    }

    pub fn upsert(&self, server: ServerInfo) {
        self.servers
            .write()
            .expect("fleet lock poisoned")
            .insert(server.address.clone(), server);
    }

    pub fn remove(&self, address: &str) -> Option<ServerInfo> {
        self.servers
            .write()
            .expect("fleet lock poisoned")
            .remove(address)
    }

    pub fn get(&self, address: &str) -> Option<ServerInfo> {
        self.servers
            .read()
            .expect("fleet lock poisoned")
            .get(address)
            .cloned()
    }

    pub fn list(&self) -> Vec<ServerInfo> {
        let mut servers: Vec<ServerInfo> = self
            .servers
            .read()
            .expect("fleet lock poisoned")
            .values()
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.address.cmp(&b.address));
        servers
    }

    /// Healthy servers in stable (address) order.
    pub fn healthy(&self) -> Vec<ServerInfo> {
        self.list().into_iter().filter(|s| s.healthy).collect()
    }

    pub fn set_health(&self, address: &str, healthy: bool) -> bool {
        let mut servers = self.servers.write().expect("fleet lock poisoned");
        match servers.get_mut(address) {
            Some(server) => {
                server.healthy = healthy;
                true
            }
            None => false,
        }
    }

    pub fn set_load(&self, address: &str, load: f64) -> bool {
        let mut servers = self.servers.write().expect("fleet lock poisoned");
        match servers.get_mut(address) {
            Some(server) => {
                server.current_load = load;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.servers.read().expect("fleet lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next value of the round-robin tie-break counter.
    pub fn next_rr(&self) -> usize {
        self.rr.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ServerFleet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let fleet = ServerFleet::new();
        fleet.upsert(ServerInfo::new("http://a:9090"));
        fleet.upsert(ServerInfo::new("http://b:9090"));
        assert_eq!(fleet.len(), 2);

        fleet.remove("http://a:9090");
        assert_eq!(fleet.len(), 1);
        assert!(fleet.get("http://b:9090").is_some());
    }

    #[test]
    fn health_filtering() {
        let fleet = ServerFleet::new();
        fleet.upsert(ServerInfo::new("http://a:9090"));
        fleet.upsert(ServerInfo::new("http://b:9090"));
        fleet.set_health("http://a:9090", false);

        let healthy = fleet.healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].address, "http://b:9090");
    }

    #[test]
    fn capability_prefixes() {
        let mut server = ServerInfo::new("http://a:9090");
        server.capabilities = vec!["ai.".to_string(), "code.".to_string()];
        assert!(server.supports("ai.chat"));
        assert!(server.supports("code.python"));
        assert!(!server.supports("http.request"));

        let open = ServerInfo::new("http://b:9090");
        assert!(open.supports("anything.at.all"));
    }

    #[test]
    fn round_robin_counter_advances() {
        let fleet = ServerFleet::new();
        assert_eq!(fleet.next_rr(), 0);
        assert_eq!(fleet.next_rr(), 1);
        assert_eq!(fleet.next_rr(), 2);
    }
}
