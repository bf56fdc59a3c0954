//! Gateway State: the single value every virtual-tool handler closes over,
//! constructed once at startup per the design note in §9 ("prefer a single
//! gateway state value constructed at startup and threaded explicitly")
//! rather than the reference implementation's module-level globals.

use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::AuditSink;
use crate::connection::ConnectionManager;
use crate::metrics::MetricsAggregator;
use crate::policy::PolicyEngine;
use crate::reload::ReloadOrchestrator;

/// Resolved filesystem locations for the two config files and the audit log,
/// kept alongside the state for status reporting and `--init` diagnostics.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub mcp_config: PathBuf,
    pub gateway_rules: PathBuf,
    pub audit_log: PathBuf,
}

/// All long-lived gateway subsystems, wired together once at startup.
pub struct GatewayState {
    pub policy: Arc<PolicyEngine>,
    pub connections: Arc<ConnectionManager>,
    pub audit: Arc<AuditSink>,
    pub metrics: Arc<MetricsAggregator>,
    pub reload: Arc<ReloadOrchestrator>,
    pub paths: ConfigPaths,
    /// Whether `get_gateway_status` is registered, per `GATEWAY_DEBUG`/`--debug`.
    pub debug: bool,
}

impl GatewayState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Arc<PolicyEngine>,
        connections: Arc<ConnectionManager>,
        audit: Arc<AuditSink>,
        metrics: Arc<MetricsAggregator>,
        reload: Arc<ReloadOrchestrator>,
        paths: ConfigPaths,
        debug: bool,
    ) -> Self {
        Self {
            policy,
            connections,
            audit,
            metrics,
            reload,
            paths,
            debug,
        }
    }
}
