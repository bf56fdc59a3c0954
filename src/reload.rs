//! Reload Orchestrator: bridges the config watcher to the config loader and
//! the two subsystems that hold live state, and keeps an auditable record
//! of every reload attempt.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{self, GatewayRules, McpConfig};
use crate::connection::ConnectionManager;
use crate::policy::PolicyEngine;

/// Reload bookkeeping for a single watched file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileReloadStatus {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub attempt_count: u64,
    pub success_count: u64,
    pub last_warnings: Vec<String>,
}

/// Immutable snapshot of reload status for both watched files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadStatusSnapshot {
    pub mcp_config: FileReloadStatus,
    pub gateway_rules: FileReloadStatus,
}

struct Status {
    mcp_config: FileReloadStatus,
    gateway_rules: FileReloadStatus,
    mcp_mtime: Option<SystemTime>,
    rules_mtime: Option<SystemTime>,
}

/// Which file triggered a reload callback; both callbacks re-load and
/// cross-validate both files, but only apply the change relevant to the
/// triggering file's subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    McpConfig,
    GatewayRules,
}

pub struct ReloadOrchestrator {
    policy: Arc<PolicyEngine>,
    connections: Arc<ConnectionManager>,
    mcp_path: PathBuf,
    rules_path: PathBuf,
    status: Mutex<Status>,
}

impl ReloadOrchestrator {
    pub fn new(
        policy: Arc<PolicyEngine>,
        connections: Arc<ConnectionManager>,
        mcp_path: PathBuf,
        rules_path: PathBuf,
    ) -> Self {
        let mcp_mtime = mtime_of(&mcp_path);
        let rules_mtime = mtime_of(&rules_path);
        Self {
            policy,
            connections,
            mcp_path,
            rules_path,
            status: Mutex::new(Status {
                mcp_config: FileReloadStatus::default(),
                gateway_rules: FileReloadStatus::default(),
                mcp_mtime,
                rules_mtime,
            }),
        }
    }

    pub fn mcp_path(&self) -> &Path {
        &self.mcp_path
    }

    pub fn rules_path(&self) -> &Path {
        &self.rules_path
    }

    /// Callback for the config watcher: the MCP server config file changed.
    pub fn on_mcp_config_changed(&self, _path: &Path) {
        self.run(Trigger::McpConfig);
    }

    /// Callback for the config watcher: the gateway rules file changed.
    pub fn on_gateway_rules_changed(&self, _path: &Path) {
        self.run(Trigger::GatewayRules);
    }

    /// Opportunistic fallback for environments where the filesystem watcher
    /// doesn't work: compare stored mtimes against current ones and
    /// synthesize the matching callback if either file has grown newer.
    pub fn poll_mtimes(&self) {
        let (mcp_changed, rules_changed) = {
            let status = self.status.lock().unwrap();
            let current_mcp = mtime_of(&self.mcp_path);
            let current_rules = mtime_of(&self.rules_path);
            (
                grown(status.mcp_mtime, current_mcp),
                grown(status.rules_mtime, current_rules),
            )
        };

        if mcp_changed {
            self.on_mcp_config_changed(&self.mcp_path.clone());
        }
        if rules_changed {
            self.on_gateway_rules_changed(&self.rules_path.clone());
        }
    }

    fn run(&self, trigger: Trigger) {
        let now = Utc::now();
        {
            let mut status = self.status.lock().unwrap();
            match trigger {
                Trigger::McpConfig => {
                    status.mcp_config.last_attempt = Some(now);
                    status.mcp_config.attempt_count += 1;
                }
                Trigger::GatewayRules => {
                    status.gateway_rules.last_attempt = Some(now);
                    status.gateway_rules.attempt_count += 1;
                }
            }
        }

        match config::reload_configs(&self.mcp_path, &self.rules_path) {
            Ok((mcp_config, gateway_rules, warnings)) => {
                self.apply(trigger, mcp_config, gateway_rules, warnings, now);
            }
            Err(e) => {
                warn!(error = %e, trigger = ?trigger, "[HOT RELOAD] validation failed, keeping previous configuration");
                let mut status = self.status.lock().unwrap();
                match trigger {
                    Trigger::McpConfig => status.mcp_config.last_error = Some(e.to_string()),
                    Trigger::GatewayRules => status.gateway_rules.last_error = Some(e.to_string()),
                }
            }
        }
    }

    fn apply(
        &self,
        trigger: Trigger,
        mcp_config: McpConfig,
        gateway_rules: GatewayRules,
        warnings: Vec<String>,
        now: DateTime<Utc>,
    ) {
        for warning in &warnings {
            warn!(warning, "[HOT RELOAD] cross-validation warning");
        }

        match trigger {
            Trigger::McpConfig => {
                let summary = self.connections.reload(mcp_config);
                info!(
                    added = summary.added.len(),
                    removed = summary.removed.len(),
                    updated = summary.updated.len(),
                    "[HOT RELOAD] mcp server configuration reloaded"
                );
                let mut status = self.status.lock().unwrap();
                status.mcp_config.last_error = None;
                status.mcp_config.last_success = Some(now);
                status.mcp_config.success_count += 1;
                status.mcp_config.last_warnings = warnings;
                status.mcp_mtime = mtime_of(&self.mcp_path);
            }
            Trigger::GatewayRules => {
                self.policy.reload(gateway_rules);
                info!("[HOT RELOAD] gateway rules reloaded");
                let mut status = self.status.lock().unwrap();
                status.gateway_rules.last_error = None;
                status.gateway_rules.last_success = Some(now);
                status.gateway_rules.success_count += 1;
                status.gateway_rules.last_warnings = warnings;
                status.rules_mtime = mtime_of(&self.rules_path);
            }
        }
    }

    /// Immutable snapshot of both files' reload status.
    pub fn status_snapshot(&self) -> ReloadStatusSnapshot {
        let status = self.status.lock().unwrap();
        ReloadStatusSnapshot {
            mcp_config: status.mcp_config.clone(),
            gateway_rules: status.gateway_rules.clone(),
        }
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

fn grown(previous: Option<SystemTime>, current: Option<SystemTime>) -> bool {
    match (previous, current) {
        (Some(p), Some(c)) => c > p,
        (None, Some(_)) => true,
        _ => false,
    }
}
