//! Virtual-Tool Handlers: the four tools the gateway itself exposes to
//! agents. Every handler is audited and timed; response shapes and error
//! strings are grounded on `original_source/src/gateway.py`.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::Instrument;

use crate::audit::Decision;
use crate::config::ServerDescriptor;
use crate::error::{Error, Result};
use crate::glob_match::matches;
use crate::state::GatewayState;

/// `list_servers(agent_id, include_metadata?)`.
pub fn list_servers(state: &GatewayState, agent_id: Option<&str>, include_metadata: bool) -> Value {
    let start = Instant::now();
    let agent = agent_id.unwrap_or("");

    let allowed = state.policy.get_allowed_servers(agent);
    let config = state.connections.current_config();

    let names: Vec<String> = if allowed.iter().any(|s| s == "*") {
        let mut all: Vec<String> = config.servers.keys().cloned().collect();
        all.sort();
        all
    } else {
        allowed
    };

    let mut servers = Vec::new();
    for name in &names {
        let Some(descriptor) = config.servers.get(name) else {
            continue;
        };
        let mut entry = json!({
            "name": name,
            "transport": descriptor.transport_name(),
        });
        if include_metadata {
            if let Some(description) = descriptor.description() {
                entry["description"] = json!(description);
            }
            match descriptor {
                ServerDescriptor::Stdio { command, .. } => entry["command"] = json!(command),
                ServerDescriptor::Http { url, .. } => entry["url"] = json!(url),
            }
        }
        servers.push(entry);
    }

    let latency_ms = elapsed_ms(start);
    state.audit.log(agent, "list_servers", Decision::Allow, latency_ms, json!({"count": servers.len()}));
    state.metrics.record(agent, "list_servers", latency_ms, false);

    json!({ "servers": servers })
}

/// `get_server_tools(agent_id, server, names?, pattern?, max_schema_tokens?)`.
pub async fn get_server_tools(
    state: &GatewayState,
    agent_id: Option<&str>,
    server: &str,
    names: Option<&str>,
    pattern: Option<&str>,
    max_schema_tokens: Option<u64>,
) -> Value {
    let start = Instant::now();
    let agent = agent_id.unwrap_or("");

    let response = get_server_tools_inner(state, agent, server, names, pattern, max_schema_tokens).await;

    let latency_ms = elapsed_ms(start);
    let is_error = response.get("error").is_some();
    let decision = if is_error { Decision::Deny } else { Decision::Allow };
    state.audit.log(agent, "get_server_tools", decision, latency_ms, json!({"server": server}));
    state.metrics.record(agent, "get_server_tools", latency_ms, is_error);

    response
}

async fn get_server_tools_inner(
    state: &GatewayState,
    agent: &str,
    server: &str,
    names: Option<&str>,
    pattern: Option<&str>,
    max_schema_tokens: Option<u64>,
) -> Value {
    let empty = |error: String| {
        json!({
            "tools": Value::Array(vec![]),
            "server": server,
            "total_available": 0,
            "returned": 0,
            "error": error,
        })
    };

    if !state.policy.can_access_server(agent, server) {
        return empty(format!("Access denied for agent \"{agent}\" on server \"{server}\""));
    }

    let downstream = match state.connections.list_tools(server).await {
        Ok(tools) => tools,
        Err(e) => return empty(e.to_string()),
    };

    let total_available = downstream.len();

    let name_filter: Option<HashSet<String>> = names
        .map(|s| {
            s.split(',')
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .map(|n| n.to_string())
                .collect::<HashSet<_>>()
        })
        .filter(|set| !set.is_empty());

    let mut tools_out = Vec::new();
    let mut tokens_used: u64 = 0;

    for tool in &downstream {
        if let Some(set) = &name_filter {
            if !set.contains(&tool.name) {
                continue;
            }
        }
        if let Some(pat) = pattern {
            if !matches(&tool.name, pat) {
                continue;
            }
        }
        if !state.policy.can_access_tool(agent, server, &tool.name) {
            continue;
        }

        if let Some(budget) = max_schema_tokens {
            let schema_str = serde_json::to_string(&tool.input_schema).unwrap_or_default();
            let estimate = estimate_tool_tokens(&tool.name, &tool.description, &schema_str);
            if tokens_used + estimate > budget {
                break;
            }
            tokens_used += estimate;
        }

        tools_out.push(json!({
            "name": tool.name,
            "description": tool.description,
            "inputSchema": tool.input_schema,
        }));
    }

    let mut response = json!({
        "tools": &tools_out,
        "server": server,
        "total_available": total_available,
        "returned": tools_out.len(),
    });
    if max_schema_tokens.is_some() {
        response["tokens_used"] = json!(tokens_used);
    }
    response
}

/// `ceil((len(name)+len(description)+len(schema_json))/4)`, floored at 1.
fn estimate_tool_tokens(name: &str, description: &str, schema_json: &str) -> u64 {
    let total = name.len() + description.len() + schema_json.len();
    std::cmp::max(1, total.div_ceil(4) as u64)
}

/// `execute_tool(agent_id, server, tool, args, timeout_ms?)`.
pub async fn execute_tool(
    state: &GatewayState,
    agent_id: Option<&str>,
    server: &str,
    tool: &str,
    args: Value,
    timeout_ms: Option<u64>,
) -> Result<Value> {
    let start = Instant::now();
    let agent = agent_id.unwrap_or("").to_string();
    let span = tracing::info_span!("execute_tool", agent = %agent, server = %server, tool = %tool);

    let result = execute_tool_inner(state, &agent, server, tool, args, timeout_ms)
        .instrument(span)
        .await;

    let latency_ms = elapsed_ms(start);
    let (decision, metadata) = match &result {
        Ok(_) => (Decision::Allow, json!({"server": server, "tool": tool})),
        Err(Error::AccessDenied { .. }) => (Decision::Deny, json!({"server": server, "tool": tool})),
        Err(e) => (Decision::Error, json!({"server": server, "tool": tool, "error": e.to_string()})),
    };
    state.audit.log(&agent, "execute_tool", decision, latency_ms, metadata);
    state.metrics.record(&agent, "execute_tool", latency_ms, result.is_err());

    result
}

async fn execute_tool_inner(
    state: &GatewayState,
    agent: &str,
    server: &str,
    tool: &str,
    args: Value,
    timeout_ms: Option<u64>,
) -> Result<Value> {
    if !state.policy.can_access_server(agent, server) {
        return Err(Error::AccessDenied {
            agent: agent.to_string(),
            resource: format!("server \"{server}\""),
        });
    }
    if !state.policy.can_access_tool(agent, server, tool) {
        return Err(Error::AccessDenied {
            agent: agent.to_string(),
            resource: format!("tool \"{tool}\" on server \"{server}\" is not authorized"),
        });
    }

    let timeout = timeout_ms.map(Duration::from_millis);
    let raw = state.connections.call_tool(server, tool, args, timeout).await?;
    Ok(normalize_downstream_result(raw))
}

/// Normalize a downstream `call_tool` result to `{content, isError}`: pass
/// a content-bearing record through, wrap a plain value in one text block.
fn normalize_downstream_result(raw: Value) -> Value {
    if let Value::Object(ref map) = raw {
        if let Some(content) = map.get("content") {
            let is_error = map.get("isError").and_then(Value::as_bool).unwrap_or(false);
            return json!({ "content": content, "isError": is_error });
        }
    }

    let text = match &raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ "content": [{"type": "text", "text": text}], "isError": false })
}

/// `get_gateway_status(agent_id)` — registered only in debug mode.
pub fn get_gateway_status(state: &GatewayState, agent_id: Option<&str>) -> Value {
    let start = Instant::now();
    let agent = agent_id.unwrap_or("");

    let reload_status = state.reload.status_snapshot();
    let rules = state.policy.rules_snapshot();
    let mut agent_ids: Vec<String> = rules.agents.keys().cloned().collect();
    agent_ids.sort();
    let servers = state.connections.all_servers();

    let response = json!({
        "reload_status": {
            "mcp_config": reload_status.mcp_config,
            "gateway_rules": reload_status.gateway_rules,
        },
        "policy": {
            "total_agents": agent_ids.len(),
            "agent_ids": agent_ids,
            "deny_on_missing_agent": rules.defaults.deny_on_missing_agent,
        },
        "servers": servers,
        "config_paths": {
            "mcp_config": state.paths.mcp_config.display().to_string(),
            "gateway_rules": state.paths.gateway_rules.display().to_string(),
        },
        "message": format!("gateway operational with {} configured server(s)", servers.len()),
    });

    let latency_ms = elapsed_ms(start);
    state.audit.log(agent, "get_gateway_status", Decision::Allow, latency_ms, json!({}));
    state.metrics.record(agent, "get_gateway_status", latency_ms, false);

    response
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::config::{Defaults, GatewayRules, McpConfig};
    use crate::connection::ConnectionManager;
    use crate::metrics::MetricsAggregator;
    use crate::policy::PolicyEngine;
    use crate::reload::ReloadOrchestrator;
    use crate::state::ConfigPaths;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_state(dir: &TempDir, rules: GatewayRules, mcp: McpConfig) -> GatewayState {
        let mcp_path = dir.path().join("mcp-servers.json");
        let rules_path = dir.path().join("gateway-rules.json");
        std::fs::write(&mcp_path, r#"{"mcpServers": {}}"#).unwrap();
        std::fs::write(&rules_path, r#"{"agents": {}}"#).unwrap();

        let policy = Arc::new(PolicyEngine::new(rules));
        let connections = Arc::new(ConnectionManager::new(mcp));
        let audit = Arc::new(AuditSink::new(dir.path().join("audit.jsonl")));
        let metrics = Arc::new(MetricsAggregator::new());
        let reload = Arc::new(ReloadOrchestrator::new(
            policy.clone(),
            connections.clone(),
            mcp_path.clone(),
            rules_path.clone(),
        ));

        GatewayState::new(
            policy,
            connections,
            audit,
            metrics,
            reload,
            ConfigPaths {
                mcp_config: mcp_path,
                gateway_rules: rules_path,
                audit_log: dir.path().join("audit.jsonl"),
            },
            true,
        )
    }

    fn stdio(command: &str) -> ServerDescriptor {
        ServerDescriptor::Stdio {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            description: None,
        }
    }

    #[test]
    fn list_servers_expands_wildcard_allow() {
        let dir = TempDir::new().unwrap();
        let mut agents = HashMap::new();
        agents.insert(
            "backend".to_string(),
            crate::config::AgentRules {
                allow: crate::config::RuleSection {
                    servers: vec!["*".to_string()],
                    tools: HashMap::new(),
                },
                deny: Default::default(),
            },
        );
        let rules = GatewayRules { agents, defaults: Defaults::default() };
        let mcp = McpConfig {
            servers: HashMap::from([("postgres".to_string(), stdio("npx"))]),
        };
        let state = test_state(&dir, rules, mcp);

        let response = list_servers(&state, Some("backend"), false);
        let servers = response["servers"].as_array().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0]["name"], "postgres");
        assert_eq!(servers[0]["transport"], "stdio");
    }

    #[test]
    fn list_servers_unknown_agent_strict_default_is_empty() {
        let dir = TempDir::new().unwrap();
        let rules = GatewayRules { agents: HashMap::new(), defaults: Defaults::default() };
        let mcp = McpConfig { servers: HashMap::from([("postgres".to_string(), stdio("npx"))]) };
        let state = test_state(&dir, rules, mcp);

        let response = list_servers(&state, Some("ghost"), false);
        assert_eq!(response["servers"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn execute_tool_unknown_agent_is_denied() {
        let dir = TempDir::new().unwrap();
        let rules = GatewayRules { agents: HashMap::new(), defaults: Defaults::default() };
        let mcp = McpConfig { servers: HashMap::new() };
        let state = test_state(&dir, rules, mcp);

        let err = execute_tool(&state, Some("ghost"), "anything", "anything", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied { .. }));
    }

    #[test]
    fn normalize_wraps_plain_value() {
        let wrapped = normalize_downstream_result(json!("plain result"));
        assert_eq!(wrapped["isError"], false);
        assert_eq!(wrapped["content"][0]["text"], "plain result");
    }

    #[test]
    fn normalize_passes_through_content_bearing_result() {
        let downstream = json!({"content": [{"type": "text", "text": "hi"}], "isError": true});
        let normalized = normalize_downstream_result(downstream);
        assert_eq!(normalized["isError"], true);
    }

    #[test]
    fn token_estimate_is_at_least_one() {
        assert_eq!(estimate_tool_tokens("", "", ""), 1);
        assert_eq!(estimate_tool_tokens("get_user", "Get user by ID", "{}"), 6);
    }
}
