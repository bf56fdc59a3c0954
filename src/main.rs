//! Process entrypoint: parses CLI flags, loads configuration, wires up the
//! gateway's subsystems, and drives a framed newline-delimited JSON-RPC loop
//! over stdio. The tool-registration and transport-negotiation ceremony a
//! full MCP host library would provide is out of scope (see SPEC_FULL.md
//! §1 Non-goals); `rpc` implements just enough of `tools/list` and
//! `tools/call` to drive the four virtual tools end to end.

use std::sync::Arc;

use agent_mcp_gateway::cli::{self, Cli, EnvConfig};
use agent_mcp_gateway::{audit::AuditSink, config, connection::ConnectionManager, error::Error};
use agent_mcp_gateway::{logging, metrics::MetricsAggregator, policy::PolicyEngine, reload::ReloadOrchestrator};
use agent_mcp_gateway::{
    rpc,
    state::{ConfigPaths, GatewayState},
    watcher::ConfigWatcher,
};

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = Cli::parse_args();

    if args.init {
        if let Err(e) = cli::init_config_directory() {
            eprintln!("error: {}", e.user_message());
            std::process::exit(1);
        }
        return;
    }

    let env = EnvConfig::resolve(args.debug);
    logging::init(env.debug);

    if let Some(default_agent) = &env.default_agent {
        info!(default_agent, "GATEWAY_DEFAULT_AGENT set (logged only, not wired into request dispatch)");
    }

    let (state, watcher) = match startup(&env).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(1);
        }
    };

    info!(
        servers = state.connections.all_servers().len(),
        debug = state.debug,
        "agent-mcp-gateway ready, reading requests from stdin"
    );

    rpc::run_stdio_loop(&state).await;

    watcher.stop();
    state.connections.close_all_connections();
    info!("agent-mcp-gateway shut down");
}

async fn startup(env: &EnvConfig) -> Result<(GatewayState, ConfigWatcher), Error> {
    let (mcp_config, gateway_rules, warnings) =
        config::reload_configs(&env.mcp_config_path, &env.gateway_rules_path)?;

    for warning in &warnings {
        warn!(warning, "cross-validation warning at startup");
    }

    let policy = Arc::new(PolicyEngine::new(gateway_rules));
    let connections = Arc::new(ConnectionManager::new(mcp_config));
    let audit = Arc::new(AuditSink::new(&env.audit_log_path));
    let metrics = Arc::new(MetricsAggregator::new());
    let reload = Arc::new(ReloadOrchestrator::new(
        policy.clone(),
        connections.clone(),
        env.mcp_config_path.clone(),
        env.gateway_rules_path.clone(),
    ));

    let watcher = {
        let reload_for_mcp = reload.clone();
        let reload_for_rules = reload.clone();
        ConfigWatcher::new(
            env.mcp_config_path.clone(),
            env.gateway_rules_path.clone(),
            move |path| reload_for_mcp.on_mcp_config_changed(path),
            move |path| reload_for_rules.on_gateway_rules_changed(path),
        )
    };
    if let Err(e) = watcher.start() {
        warn!(error = %e, "config watcher failed to start; hot-reload disabled for this run");
    }

    let state = GatewayState::new(
        policy,
        connections,
        audit,
        metrics,
        reload,
        ConfigPaths {
            mcp_config: env.mcp_config_path.clone(),
            gateway_rules: env.gateway_rules_path.clone(),
            audit_log: env.audit_log_path.clone(),
        },
        env.debug,
    );

    Ok((state, watcher))
}
