//! End-to-end scenarios exercising the gateway's request pipeline, hot
//! reload, and config loading together, the way a real agent session would
//! observe them.

use std::collections::HashMap;
use std::sync::Arc;

use agent_mcp_gateway::config::{self, McpConfig, ServerDescriptor};
use agent_mcp_gateway::error::Error;
use agent_mcp_gateway::{
    tools, AuditSink, ConfigPaths, ConnectionManager, GatewayState, MetricsAggregator,
    PolicyEngine, ReloadOrchestrator,
};
use serde_json::json;
use tempfile::TempDir;

/// A `sh -c` one-shot stdio "server": reads and discards one request line,
/// then prints a fixed JSON-RPC response. Good enough to drive the
/// connection manager's per-call session without a real MCP binary.
fn fake_stdio_server(response_json: &str) -> ServerDescriptor {
    ServerDescriptor::Stdio {
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            format!("read _line; printf '%s' '{response_json}'"),
        ],
        env: HashMap::new(),
        description: None,
    }
}

fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

struct Harness {
    state: GatewayState,
    reload: Arc<ReloadOrchestrator>,
    rules_path: std::path::PathBuf,
    audit_path: std::path::PathBuf,
}

fn build_harness(dir: &TempDir, rules_json: &str, mcp_config: McpConfig) -> Harness {
    let mcp_path = write(dir, "mcp-servers.json", &serde_json::to_string(&mcp_config).unwrap());
    let rules_path = write(dir, "gateway-rules.json", rules_json);
    let audit_path = dir.path().join("audit.jsonl");

    let (_mcp, rules, _warnings) = config::reload_configs(&mcp_path, &rules_path).unwrap();

    let policy = Arc::new(PolicyEngine::new(rules));
    let connections = Arc::new(ConnectionManager::new(mcp_config));
    let audit = Arc::new(AuditSink::new(&audit_path));
    let metrics = Arc::new(MetricsAggregator::new());
    let reload = Arc::new(ReloadOrchestrator::new(
        policy.clone(),
        connections.clone(),
        mcp_path.clone(),
        rules_path.clone(),
    ));

    let state = GatewayState::new(
        policy,
        connections,
        audit,
        metrics,
        reload.clone(),
        ConfigPaths {
            mcp_config: mcp_path,
            gateway_rules: rules_path.clone(),
            audit_log: audit_path.clone(),
        },
        true,
    );

    Harness { state, reload, rules_path, audit_path }
}

/// Scenario 1: an explicit deny on a tool overrides a wildcard allow on the
/// same server, while an unrelated tool the wildcard covers still succeeds.
#[tokio::test]
async fn deny_over_allow_precedence() {
    let dir = TempDir::new().unwrap();
    let rules = r#"{
        "agents": {
            "backend": {
                "allow": {"servers": ["postgres"], "tools": {"postgres": ["*"]}},
                "deny": {"tools": {"postgres": ["drop_table"]}}
            }
        }
    }"#;
    let mcp = McpConfig {
        servers: HashMap::from([(
            "postgres".to_string(),
            fake_stdio_server(
                r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"3 rows"}],"isError":false}}"#,
            ),
        )]),
    };
    let harness = build_harness(&dir, rules, mcp);

    let ok = tools::execute_tool(&harness.state, Some("backend"), "postgres", "query", json!({}), None)
        .await
        .unwrap();
    assert_eq!(ok["isError"], false);

    let err = tools::execute_tool(&harness.state, Some("backend"), "postgres", "drop_table", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
    assert!(err.to_string().contains("not authorized"));
}

/// Scenario 2: a wildcard-deny pattern overrides an explicit allow of the
/// same tool, while an unrelated explicitly-allowed tool is untouched.
#[test]
fn wildcard_deny_beats_explicit_allow_but_spares_other_tools() {
    let dir = TempDir::new().unwrap();
    let rules = r#"{
        "agents": {
            "t": {
                "allow": {"servers": ["db"], "tools": {"db": ["delete_user", "delete_data", "get_user"]}},
                "deny": {"tools": {"db": ["delete_*"]}}
            }
        }
    }"#;
    let mcp = McpConfig { servers: HashMap::from([("db".to_string(), fake_stdio_server("{}"))]) };
    let harness = build_harness(&dir, rules, mcp);

    assert!(!harness.state.policy.can_access_tool("t", "db", "delete_user"));
    assert!(!harness.state.policy.can_access_tool("t", "db", "delete_data"));
    assert!(harness.state.policy.can_access_tool("t", "db", "get_user"));
}

/// Scenario 3: an agent absent from the rule set, with the strict default,
/// sees no servers and every call denied.
#[tokio::test]
async fn unknown_agent_strict_default_denies_everything() {
    let dir = TempDir::new().unwrap();
    let rules = r#"{"agents": {}, "defaults": {"deny_on_missing_agent": true}}"#;
    let mcp = McpConfig { servers: HashMap::from([("anything".to_string(), fake_stdio_server("{}"))]) };
    let harness = build_harness(&dir, rules, mcp);

    let listed = tools::list_servers(&harness.state, Some("ghost"), false);
    assert_eq!(listed["servers"].as_array().unwrap().len(), 0);

    let err = tools::execute_tool(&harness.state, Some("ghost"), "anything", "anything", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
}

/// Scenario 4: after a rules file changes to lift a previously-denied tool,
/// the next `get_server_tools` call for that server reflects the new rules.
#[tokio::test]
async fn hot_reload_of_rules_lifts_a_tool_denial() {
    let dir = TempDir::new().unwrap();
    let rules = r#"{
        "agents": {
            "researcher": {
                "allow": {"servers": ["brave-search"], "tools": {"brave-search": ["*"]}},
                "deny": {"tools": {"brave-search": ["brave_video_search"]}}
            }
        }
    }"#;
    let tools_response = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[
        {"name":"brave_web_search","description":"web search","inputSchema":{}},
        {"name":"brave_video_search","description":"video search","inputSchema":{}}
    ]}}"#;
    let mcp = McpConfig {
        servers: HashMap::from([("brave-search".to_string(), fake_stdio_server(tools_response))]),
    };
    let harness = build_harness(&dir, rules, mcp);

    let before = tools::get_server_tools(&harness.state, Some("researcher"), "brave-search", None, None, None).await;
    let before_names: Vec<&str> = before["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(!before_names.contains(&"brave_video_search"));
    assert!(before_names.contains(&"brave_web_search"));

    let updated_rules = r#"{
        "agents": {
            "researcher": {
                "allow": {"servers": ["brave-search"], "tools": {"brave-search": ["*"]}}
            }
        }
    }"#;
    std::fs::write(&harness.rules_path, updated_rules).unwrap();
    harness.reload.on_gateway_rules_changed(&harness.rules_path);

    let after = tools::get_server_tools(&harness.state, Some("researcher"), "brave-search", None, None, None).await;
    let after_names: Vec<&str> = after["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(after_names.contains(&"brave_video_search"));
}

/// Scenario 5: a rules file that fails structural validation never reaches
/// the policy engine; the previous valid rules keep governing decisions, and
/// the failure is recorded in reload status.
#[tokio::test]
async fn hot_reload_with_validation_error_preserves_previous_rules() {
    let dir = TempDir::new().unwrap();
    let rules = r#"{"agents": {"backend": {"allow": {"servers": ["postgres"]}}}}"#;
    let mcp = McpConfig { servers: HashMap::from([("postgres".to_string(), fake_stdio_server("{}"))]) };
    let harness = build_harness(&dir, rules, mcp);

    assert!(harness.state.policy.can_access_server("backend", "postgres"));

    std::fs::write(&harness.rules_path, r#"{"agents": {"backend": {"allow": {"servers": "not-a-list"}}}}"#).unwrap();
    harness.reload.on_gateway_rules_changed(&harness.rules_path);

    let status = harness.reload.status_snapshot();
    assert!(status.gateway_rules.last_error.is_some());
    assert_eq!(status.gateway_rules.success_count, 0);
    assert!(harness.state.policy.can_access_server("backend", "postgres"));
}

/// Scenario 6: `${VAR}` substitution in the MCP config succeeds when the
/// environment variable is set and fails, naming the variable, when it is
/// not.
#[test]
fn env_var_substitution_succeeds_then_fails_on_missing_var() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "mcp.json",
        r#"{"mcpServers": {"x": {"command": "npx", "env": {"API_KEY": "${GATEWAY_E2E_TEST_VAR}"}}}}"#,
    );

    std::env::set_var("GATEWAY_E2E_TEST_VAR", "abc");
    let config = config::load_mcp_config(&path).unwrap();
    match &config.servers["x"] {
        ServerDescriptor::Stdio { env, .. } => assert_eq!(env["API_KEY"], "abc"),
        _ => panic!("expected stdio descriptor"),
    }
    std::env::remove_var("GATEWAY_E2E_TEST_VAR");

    let err = config::load_mcp_config(&path).unwrap_err();
    assert!(err.to_string().contains("GATEWAY_E2E_TEST_VAR"));
}

/// Every completed virtual-tool call, whether allowed or denied, appends
/// exactly one parsable JSON line to the audit log.
#[tokio::test]
async fn every_completed_call_appends_one_audit_line() {
    let dir = TempDir::new().unwrap();
    let rules = r#"{
        "agents": {
            "backend": {
                "allow": {"servers": ["postgres"], "tools": {"postgres": ["query"]}}
            }
        }
    }"#;
    let mcp = McpConfig {
        servers: HashMap::from([(
            "postgres".to_string(),
            fake_stdio_server(r#"{"jsonrpc":"2.0","id":1,"result":"ok"}"#),
        )]),
    };
    let harness = build_harness(&dir, rules, mcp);

    let _ = tools::list_servers(&harness.state, Some("backend"), false);
    let _ = tools::execute_tool(&harness.state, Some("backend"), "postgres", "query", json!({}), None).await;
    let _ = tools::execute_tool(&harness.state, Some("backend"), "postgres", "drop_table", json!({}), None).await;

    let contents = std::fs::read_to_string(&harness.audit_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert!(parsed["decision"].is_string());
    }
}
