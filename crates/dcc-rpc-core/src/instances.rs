//! File-backed instance registry for cross-process discovery.
//!
//! Every running server registers itself in a shared JSON document under
//! the user config dir, keyed by host type then instance name:
//!
//! ```json
//! {"maya": {"maya-1": {"uri": "RPC:rpc.service@127.0.0.1:9001",
//!                      "last_heartbeat": "2026-08-25T12:00:00Z"}}}
//! ```
//!
//! Writes are read-modify-write with an atomic temp-file rename, so readers
//! never observe a torn document. There is no cross-process lock: two
//! processes writing at the same instant can lose one update, which the
//! heartbeat refresher repairs on its next tick.
//!
//! Entries left behind by crashed processes are pruned by [`cleanup`]
//! (InstanceRegistry::cleanup), which probes each registered address with a
//! short TCP connect.

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::paths::{registry_file_path, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// A parsed `RPC:rpc.service@host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

impl InstanceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let prefix = format!(
            "{}:{}@",
            RpcConfig::ADDRESS_SCHEME,
            RpcConfig::SERVICE_NAME
        );
        let rest = uri
            .strip_prefix(&prefix)
            .ok_or_else(|| RpcError::InvalidAddress(uri.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| RpcError::InvalidAddress(uri.to_string()))?;
        if host.is_empty() {
            return Err(RpcError::InvalidAddress(uri.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| RpcError::InvalidAddress(uri.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// Socket address string suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}:{}",
            RpcConfig::ADDRESS_SCHEME,
            RpcConfig::SERVICE_NAME,
            self.host,
            self.port
        )
    }
}

/// One registered instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceEntry {
    pub uri: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// `host_type -> instance_name -> entry`, ordered for stable listings.
pub type InstanceMap = BTreeMap<String, BTreeMap<String, InstanceEntry>>;

/// Handle to the shared registry document.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    path: PathBuf,
}

impl InstanceRegistry {
    /// Registry at the default per-user location.
    pub fn open_default() -> Result<Self> {
        Ok(Self {
            path: registry_file_path()?,
        })
    }

    /// Registry at an explicit path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the current document. Missing or unreadable documents are an
    /// empty registry; re-registration and heartbeats rebuild them.
    pub fn load(&self) -> InstanceMap {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return InstanceMap::new(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return InstanceMap::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(map) => map,
            Err(e) => {
                warn!(
                    "Registry document {} is corrupt ({}); treating as empty",
                    self.path.display(),
                    e
                );
                InstanceMap::new()
            }
        }
    }

    fn save(&self, map: &InstanceMap) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(map)?;
        write_atomic(&self.path, &bytes)
    }

    /// Register an instance and return its name.
    ///
    /// With an explicit name, any previous entry under that name is
    /// replaced. Without one, the smallest free `{host_type}-{N}` (N >= 1)
    /// is assigned, reusing gaps left by departed instances.
    pub fn register(
        &self,
        host_type: &str,
        instance_name: Option<&str>,
        address: &InstanceAddress,
    ) -> Result<String> {
        let mut map = self.load();
        let group = map.entry(host_type.to_string()).or_default();

        let name = match instance_name {
            Some(name) => name.to_string(),
            None => {
                let mut n = 1usize;
                loop {
                    let candidate = format!("{}-{}", host_type, n);
                    if !group.contains_key(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };

        group.insert(
            name.clone(),
            InstanceEntry {
                uri: address.to_string(),
                last_heartbeat: Utc::now(),
            },
        );
        self.save(&map)?;
        debug!("Registered instance {}/{} at {}", host_type, name, address);
        Ok(name)
    }

    /// Remove an instance. Empty host-type groups are dropped with it.
    /// Returns whether the instance existed.
    pub fn unregister(&self, host_type: &str, instance_name: &str) -> Result<bool> {
        let mut map = self.load();
        let Some(group) = map.get_mut(host_type) else {
            return Ok(false);
        };
        let existed = group.remove(instance_name).is_some();
        if group.is_empty() {
            map.remove(host_type);
        }
        if existed {
            self.save(&map)?;
        }
        Ok(existed)
    }

    /// Refresh an instance's heartbeat timestamp. A missing entry is left
    /// missing: re-registration is the server's job, not the heartbeat's.
    pub fn update_heartbeat(&self, host_type: &str, instance_name: &str) -> Result<()> {
        let mut map = self.load();
        let Some(entry) = map
            .get_mut(host_type)
            .and_then(|group| group.get_mut(instance_name))
        else {
            return Ok(());
        };
        entry.last_heartbeat = Utc::now();
        self.save(&map)
    }

    /// Resolve an instance to `(name, address)`.
    ///
    /// Without an explicit name the first instance of the host type wins,
    /// in lexicographic name order; callers that care which instance they
    /// reach pass the name.
    pub fn resolve(
        &self,
        host_type: &str,
        instance_name: Option<&str>,
    ) -> Result<(String, InstanceAddress)> {
        let map = self.load();
        let not_found = || RpcError::InstanceNotFound {
            host_type: host_type.to_string(),
            instance: instance_name.unwrap_or("<any>").to_string(),
        };
        let group = map.get(host_type).ok_or_else(not_found)?;
        let (name, entry) = match instance_name {
            Some(name) => (name.to_string(), group.get(name).ok_or_else(not_found)?),
            None => {
                let (name, entry) = group.iter().next().ok_or_else(not_found)?;
                (name.clone(), entry)
            }
        };
        Ok((name, InstanceAddress::parse(&entry.uri)?))
    }

    /// Probe every registered address and drop the unreachable ones.
    ///
    /// Returns the removed `(host_type, instance_name, uri)` triples.
    /// Entries whose uri does not parse are removed too.
    pub async fn cleanup(&self) -> Result<Vec<(String, String, String)>> {
        let map = self.load();
        let mut removed = Vec::new();

        for (host_type, group) in &map {
            for (name, entry) in group {
                if !probe(&entry.uri).await {
                    removed.push((host_type.clone(), name.clone(), entry.uri.clone()));
                }
            }
        }

        if !removed.is_empty() {
            // Re-read before pruning so entries registered during the
            // probes survive.
            let mut map = self.load();
            for (host_type, name, _) in &removed {
                if let Some(group) = map.get_mut(host_type) {
                    group.remove(name);
                    if group.is_empty() {
                        map.remove(host_type);
                    }
                }
            }
            self.save(&map)?;
            for (host_type, name, uri) in &removed {
                debug!("Pruned unreachable instance {}/{} ({})", host_type, name, uri);
            }
        }
        Ok(removed)
    }

    /// Current registry contents, after pruning unreachable entries.
    /// With a host type, only that group is returned.
    pub async fn list(&self, host_type: Option<&str>) -> Result<InstanceMap> {
        self.cleanup().await?;
        let mut map = self.load();
        if let Some(host_type) = host_type {
            map.retain(|key, _| key == host_type);
        }
        Ok(map)
    }
}

async fn probe(uri: &str) -> bool {
    let Ok(address) = InstanceAddress::parse(uri) else {
        return false;
    };
    matches!(
        tokio::time::timeout(
            RpcConfig::PROBE_TIMEOUT,
            TcpStream::connect(address.socket_addr()),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry(dir: &tempfile::TempDir) -> InstanceRegistry {
        InstanceRegistry::with_path(dir.path().join("instances.json"))
    }

    fn address(port: u16) -> InstanceAddress {
        InstanceAddress::new("127.0.0.1", port)
    }

    #[test]
    fn test_address_roundtrip() {
        let addr = InstanceAddress::new("127.0.0.1", 9001);
        assert_eq!(addr.to_string(), "RPC:rpc.service@127.0.0.1:9001");
        assert_eq!(InstanceAddress::parse(&addr.to_string()).unwrap(), addr);
    }

    #[test]
    fn test_address_parse_rejects_malformed() {
        for bad in [
            "127.0.0.1:9001",
            "RPC:rpc.service@127.0.0.1",
            "RPC:rpc.service@:9001",
            "RPC:rpc.service@host:notaport",
            "HTTP:rpc.service@host:80",
        ] {
            assert!(
                matches!(
                    InstanceAddress::parse(bad),
                    Err(RpcError::InvalidAddress(_))
                ),
                "{:?} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_register_auto_names_smallest_free() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        assert_eq!(reg.register("maya", None, &address(9001)).unwrap(), "maya-1");
        assert_eq!(reg.register("maya", None, &address(9002)).unwrap(), "maya-2");

        // Gap left by an unregistered instance is reused.
        assert!(reg.unregister("maya", "maya-1").unwrap());
        assert_eq!(reg.register("maya", None, &address(9003)).unwrap(), "maya-1");
    }

    #[test]
    fn test_register_explicit_name_replaces() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        reg.register("maya", Some("workstation"), &address(9001)).unwrap();
        reg.register("maya", Some("workstation"), &address(9002)).unwrap();

        let (_, addr) = reg.resolve("maya", Some("workstation")).unwrap();
        assert_eq!(addr.port, 9002);
    }

    #[test]
    fn test_unregister_drops_empty_group() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        reg.register("maya", None, &address(9001)).unwrap();
        assert!(reg.unregister("maya", "maya-1").unwrap());
        assert!(!reg.unregister("maya", "maya-1").unwrap());

        assert!(reg.load().is_empty());
    }

    #[test]
    fn test_heartbeat_refreshes_existing_only() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        reg.register("maya", None, &address(9001)).unwrap();
        let before = reg.load()["maya"]["maya-1"].last_heartbeat;

        reg.update_heartbeat("maya", "maya-1").unwrap();
        assert!(reg.load()["maya"]["maya-1"].last_heartbeat >= before);

        // Heartbeat for an absent instance must not create an entry.
        reg.update_heartbeat("houdini", "houdini-1").unwrap();
        assert!(!reg.load().contains_key("houdini"));
    }

    #[test]
    fn test_resolve_defaults_to_first_instance() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        reg.register("maya", Some("maya-2"), &address(9002)).unwrap();
        reg.register("maya", Some("maya-1"), &address(9001)).unwrap();

        let (name, addr) = reg.resolve("maya", None).unwrap();
        assert_eq!(name, "maya-1");
        assert_eq!(addr.port, 9001);
    }

    #[test]
    fn test_resolve_unknown_is_error() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        assert!(matches!(
            reg.resolve("maya", None),
            Err(RpcError::InstanceNotFound { .. })
        ));
        reg.register("maya", None, &address(9001)).unwrap();
        assert!(matches!(
            reg.resolve("maya", Some("maya-9")),
            Err(RpcError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_corrupt_document_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(&path, b"{not json").unwrap();

        let reg = InstanceRegistry::with_path(&path);
        assert!(reg.load().is_empty());
        assert_eq!(reg.register("maya", None, &address(9001)).unwrap(), "maya-1");
    }

    #[tokio::test]
    async fn test_cleanup_prunes_unreachable() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        // A live listener and a port with nothing behind it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        let dead_port = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        reg.register("maya", Some("live"), &address(live_port)).unwrap();
        reg.register("maya", Some("dead"), &address(dead_port)).unwrap();

        let removed = reg.cleanup().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].1, "dead");

        let map = reg.load();
        assert!(map["maya"].contains_key("live"));
        assert!(!map["maya"].contains_key("dead"));
    }

    #[tokio::test]
    async fn test_list_runs_cleanup_first() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        let dead_port = {
            let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        reg.register("maya", Some("dead"), &address(dead_port)).unwrap();

        assert!(reg.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_host_type() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        reg.register("maya", None, &address(live_port)).unwrap();
        reg.register("houdini", None, &address(live_port)).unwrap();

        let filtered = reg.list(Some("maya")).await.unwrap();
        assert!(filtered.contains_key("maya"));
        assert!(!filtered.contains_key("houdini"));
    }
}
