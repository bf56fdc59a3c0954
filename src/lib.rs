//! Policy-enforcing proxy gateway for the Model Context Protocol.
//!
//! Agents talk to this gateway instead of directly to downstream MCP
//! servers; it enforces per-agent allow/deny rules at server and tool
//! granularity, hot-reloads its configuration from disk, and records an
//! audit trail and latency/error metrics for every call.
#![forbid(unsafe_code)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod glob_match;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod reload;
pub mod rpc;
pub mod state;
pub mod tools;
pub mod transport;
pub mod watcher;

pub use audit::{AuditSink, Decision};
pub use config::{AgentRules, Defaults, GatewayRules, McpConfig, RuleSection, ServerDescriptor};
pub use connection::{ConnectionManager, ConnectionStatus, ReloadSummary};
pub use error::{Error, Result};
pub use metrics::{MetricsAggregator, OperationSummary};
pub use policy::PolicyEngine;
pub use reload::{FileReloadStatus, ReloadOrchestrator, ReloadStatusSnapshot};
pub use state::{ConfigPaths, GatewayState};
pub use watcher::ConfigWatcher;
