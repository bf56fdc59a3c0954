//! Downstream Connection Manager: owns the lazily-connected client for every
//! configured server, tests connectivity with retry/backoff, forwards tool
//! calls, and applies differential hot-reloads that leave unchanged servers
//! untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::McpConfig;
use crate::error::{Error, Result};
use crate::transport::{build_client, backoff_delay, DownstreamClient, ToolInfo};

/// Default timeout applied to `test_connection` and `call_tool` when the
/// caller does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
/// `test_connection` retry count when the caller does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Connectivity state for one server, surfaced by `get_gateway_status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub error: String,
}

struct ServerEntry {
    client: Arc<dyn DownstreamClient>,
    status: ConnectionStatus,
}

/// Counts of what a reload changed, for logging and for `get_gateway_status`.
#[derive(Debug, Default, PartialEq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct ConnectionManager {
    entries: RwLock<HashMap<String, ServerEntry>>,
    current_config: RwLock<McpConfig>,
}

impl ConnectionManager {
    pub fn new(config: McpConfig) -> Self {
        let mut entries = HashMap::new();
        for (name, descriptor) in &config.servers {
            let client: Arc<dyn DownstreamClient> = Arc::from(build_client(name, descriptor));
            entries.insert(
                name.clone(),
                ServerEntry {
                    client,
                    status: ConnectionStatus::default(),
                },
            );
            info!(server = %name, "initialized downstream client");
        }

        Self {
            entries: RwLock::new(entries),
            current_config: RwLock::new(config),
        }
    }

    /// Names of every server currently configured, regardless of reachability.
    pub fn all_servers(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    pub fn current_config(&self) -> McpConfig {
        self.current_config.read().unwrap().clone()
    }

    fn client_for(&self, server: &str) -> Result<Arc<dyn DownstreamClient>> {
        let entries = self.entries.read().unwrap();
        entries
            .get(server)
            .map(|e| e.client.clone())
            .ok_or_else(|| Error::ServerNotFound(server.to_string()))
    }

    /// Connection status for `server`, or a default "never attempted"
    /// status if the server isn't configured (the caller is expected to
    /// have already checked `ServerNotFound` separately).
    pub fn status(&self, server: &str) -> ConnectionStatus {
        self.entries
            .read()
            .unwrap()
            .get(server)
            .map(|e| e.status.clone())
            .unwrap_or_default()
    }

    /// Attempt to connect to `server` and list its tools, retrying with
    /// exponential backoff (`500ms * 2^attempt`) up to `max_retries` times.
    /// Records the resulting status either way.
    pub async fn test_connection(
        &self,
        server: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<bool> {
        let client = self.client_for(server)?;

        for attempt in 0..max_retries {
            debug!(server, attempt = attempt + 1, max_retries, "testing connection");

            match tokio::time::timeout(timeout, client.list_tools()).await {
                Ok(Ok(_)) => {
                    self.set_status(server, ConnectionStatus {
                        connected: true,
                        error: String::new(),
                    });
                    info!(server, "connection test succeeded");
                    return Ok(true);
                }
                Ok(Err(e)) => {
                    let delay = backoff_delay(BACKOFF_BASE, attempt);
                    warn!(server, attempt = attempt + 1, error = %e, "connection attempt failed, retrying in {delay:?}");
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(_) => {
                    let delay = backoff_delay(BACKOFF_BASE, attempt);
                    warn!(server, attempt = attempt + 1, "connection attempt timed out, retrying in {delay:?}");
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let message = format!("failed to connect after {max_retries} attempts");
        self.set_status(server, ConnectionStatus {
            connected: false,
            error: message.clone(),
        });
        error!(server, "connection test exhausted retries");
        Ok(false)
    }

    fn set_status(&self, server: &str, status: ConnectionStatus) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(server) {
            entry.status = status;
        }
    }

    /// Best-effort shutdown. Every session is already scoped to a single
    /// call, so there is nothing live to tear down; this exists to satisfy
    /// the capability surface and give shutdown a single log line.
    pub fn close_all_connections(&self) {
        let count = self.entries.read().unwrap().len();
        info!(servers = count, "closing all downstream connections");
    }

    /// List the tools a downstream server exposes. Establishes its own
    /// session; does not consult or update the cached connection status.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolInfo>> {
        let client = self.client_for(server)?;
        client.list_tools().await
    }

    /// Invoke `tool` on `server` with `arguments`, optionally bounded by
    /// `timeout`. Every call establishes a fresh session.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let client = self.client_for(server)?;

        let call = client.call_tool(tool, arguments);
        match timeout {
            Some(t) => tokio::time::timeout(t, call)
                .await
                .map_err(|_| Error::Timeout(t.as_millis() as u64))?,
            None => call.await,
        }
    }

    /// Apply a new server configuration, closing and rebuilding only the
    /// servers whose descriptor actually changed; servers absent from both
    /// configs are untouched, unchanged servers keep their existing client
    /// identity (and therefore their cached connection status).
    pub fn reload(&self, new_config: McpConfig) -> ReloadSummary {
        info!("connection manager reload initiated");

        let old_config = self.current_config.read().unwrap().clone();
        let old_names: HashSet<&String> = old_config.servers.keys().collect();
        let new_names: HashSet<&String> = new_config.servers.keys().collect();

        let mut added: Vec<String> = new_names.difference(&old_names).map(|s| s.to_string()).collect();
        added.sort();
        let mut removed: Vec<String> = old_names.difference(&new_names).map(|s| s.to_string()).collect();
        removed.sort();

        let mut updated = Vec::new();
        let mut unchanged = Vec::new();
        for name in old_names.intersection(&new_names) {
            if old_config.servers.get(*name) == new_config.servers.get(*name) {
                unchanged.push((*name).clone());
            } else {
                updated.push((*name).clone());
            }
        }
        updated.sort();
        unchanged.sort();

        info!(
            added = added.len(),
            removed = removed.len(),
            updated = updated.len(),
            unchanged = unchanged.len(),
            "server changes computed"
        );

        let mut entries = self.entries.write().unwrap();

        for name in removed.iter().chain(updated.iter()) {
            entries.remove(name);
            debug!(server = %name, "removed stale client");
        }

        for name in added.iter().chain(updated.iter()) {
            if let Some(descriptor) = new_config.servers.get(name) {
                let client: Arc<dyn DownstreamClient> = Arc::from(build_client(name, descriptor));
                entries.insert(
                    name.clone(),
                    ServerEntry {
                        client,
                        status: ConnectionStatus::default(),
                    },
                );
                debug!(server = %name, "created client");
            }
        }

        drop(entries);
        *self.current_config.write().unwrap() = new_config;

        info!("connection manager reload complete");

        ReloadSummary {
            added,
            removed,
            updated,
            unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerDescriptor;

    fn stdio(command: &str) -> ServerDescriptor {
        ServerDescriptor::Stdio {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            description: None,
        }
    }

    fn config(servers: &[(&str, ServerDescriptor)]) -> McpConfig {
        McpConfig {
            servers: servers.iter().map(|(n, d)| (n.to_string(), d.clone())).collect(),
        }
    }

    #[test]
    fn unknown_server_is_not_found() {
        let manager = ConnectionManager::new(config(&[]));
        assert!(matches!(manager.client_for("ghost"), Err(Error::ServerNotFound(_))));
    }

    #[test]
    fn reload_partitions_added_removed_updated_unchanged() {
        let manager = ConnectionManager::new(config(&[
            ("keep", stdio("npx")),
            ("change", stdio("npx")),
            ("drop", stdio("npx")),
        ]));

        let summary = manager.reload(config(&[
            ("keep", stdio("npx")),
            ("change", stdio("uvx")),
            ("new", stdio("npx")),
        ]));

        assert_eq!(summary.added, vec!["new".to_string()]);
        assert_eq!(summary.removed, vec!["drop".to_string()]);
        assert_eq!(summary.updated, vec!["change".to_string()]);
        assert_eq!(summary.unchanged, vec!["keep".to_string()]);
        assert_eq!(manager.all_servers().len(), 3);
    }

    #[test]
    fn reload_preserves_unchanged_client_identity() {
        let manager = ConnectionManager::new(config(&[("keep", stdio("npx"))]));
        let before = Arc::as_ptr(&manager.client_for("keep").unwrap()) as *const ();

        manager.reload(config(&[("keep", stdio("npx")), ("extra", stdio("npx"))]));
        let after = Arc::as_ptr(&manager.client_for("keep").unwrap()) as *const ();

        assert_eq!(before, after);
    }
}
