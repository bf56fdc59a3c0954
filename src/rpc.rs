//! Framed JSON-RPC stdio loop: the minimal host-runtime substitute that
//! drives `tools/list` and `tools/call` against the four virtual tools.
//! A full MCP host/transport library is out of scope per SPEC_FULL.md §1;
//! this is just enough framing to exercise the gateway end to end over
//! newline-delimited JSON on stdin/stdout.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::middleware;
use crate::state::GatewayState;
use crate::tools;

/// Read newline-delimited JSON-RPC-shaped requests from stdin until EOF,
/// dispatch each to the matching virtual tool, and write one response line
/// per request to stdout.
pub async fn run_stdio_loop(state: &GatewayState) {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read from stdin, stopping");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(state, &line).await;
        let Ok(mut rendered) = serde_json::to_string(&response) else {
            warn!("failed to serialize response, dropping");
            continue;
        };
        rendered.push('\n');

        if stdout.write_all(rendered.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            warn!("failed to write to stdout, stopping");
            break;
        }
    }
}

async fn handle_line(state: &GatewayState, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return error_response(Value::Null, format!("invalid JSON request: {e}")),
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

    debug!(method, "dispatching request");

    match method {
        "tools/list" => ok_response(id, list_tool_descriptors(state)),
        "tools/call" => handle_tool_call(state, id, request.get("params")).await,
        other => error_response(id, format!("unknown method \"{other}\"")),
    }
}

fn list_tool_descriptors(state: &GatewayState) -> Value {
    let mut descriptors = vec![
        tool_descriptor(
            "list_servers",
            "List MCP servers this agent is permitted to see.",
            json!({"type": "object", "properties": {
                "agent_id": {"type": "string"},
                "include_metadata": {"type": "boolean"}
            }, "required": ["agent_id"]}),
        ),
        tool_descriptor(
            "get_server_tools",
            "List the tools exposed by a downstream server, filtered by policy.",
            json!({"type": "object", "properties": {
                "agent_id": {"type": "string"},
                "server": {"type": "string"},
                "names": {"type": "string"},
                "pattern": {"type": "string"},
                "max_schema_tokens": {"type": "integer"}
            }, "required": ["agent_id", "server"]}),
        ),
        tool_descriptor(
            "execute_tool",
            "Invoke a tool on a downstream server, subject to policy.",
            json!({"type": "object", "properties": {
                "agent_id": {"type": "string"},
                "server": {"type": "string"},
                "tool": {"type": "string"},
                "args": {"type": "object"},
                "timeout_ms": {"type": "integer"}
            }, "required": ["agent_id", "server", "tool"]}),
        ),
    ];

    if state.debug {
        descriptors.push(tool_descriptor(
            "get_gateway_status",
            "Debug-only snapshot of reload status, policy, and configured servers.",
            json!({"type": "object", "properties": {"agent_id": {"type": "string"}}}),
        ));
    }

    json!({ "tools": descriptors })
}

fn tool_descriptor(name: &str, description: &str, input_schema: Value) -> Value {
    json!({ "name": name, "description": description, "inputSchema": input_schema })
}

async fn handle_tool_call(state: &GatewayState, id: Value, params: Option<&Value>) -> Value {
    state.reload.poll_mtimes();

    let Some(params) = params else {
        return error_response(id, "missing params".to_string());
    };
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return error_response(id, "missing params.name".to_string());
    };
    let mut arguments = params
        .get("arguments")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let defaults = state.policy.rules_snapshot().defaults;
    let agent_id = match middleware::extract_agent_id(&defaults, &mut arguments) {
        Ok(agent) => agent,
        Err(e) => return error_response(id, e.user_message()),
    };
    let agent_id = agent_id.as_deref();

    match name {
        "list_servers" => {
            let include_metadata = arguments
                .get("include_metadata")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            ok_response(id, tools::list_servers(state, agent_id, include_metadata))
        }
        "get_server_tools" => {
            let Some(server) = arguments.get("server").and_then(Value::as_str) else {
                return error_response(id, "missing argument \"server\"".to_string());
            };
            let names = arguments.get("names").and_then(Value::as_str);
            let pattern = arguments.get("pattern").and_then(Value::as_str);
            let max_schema_tokens = arguments.get("max_schema_tokens").and_then(Value::as_u64);
            ok_response(
                id,
                tools::get_server_tools(state, agent_id, server, names, pattern, max_schema_tokens).await,
            )
        }
        "execute_tool" => {
            let Some(server) = arguments.get("server").and_then(Value::as_str) else {
                return error_response(id, "missing argument \"server\"".to_string());
            };
            let Some(tool) = arguments.get("tool").and_then(Value::as_str) else {
                return error_response(id, "missing argument \"tool\"".to_string());
            };
            let args = arguments.get("args").cloned().unwrap_or_else(|| json!({}));
            let timeout_ms = arguments.get("timeout_ms").and_then(Value::as_u64);

            match tools::execute_tool(state, agent_id, server, tool, args, timeout_ms).await {
                Ok(result) => ok_response(id, result),
                Err(e) => error_response(id, e.user_message()),
            }
        }
        "get_gateway_status" if state.debug => ok_response(id, tools::get_gateway_status(state, agent_id)),
        "get_gateway_status" => error_response(id, "get_gateway_status is only available in debug mode".to_string()),
        other => error_response(id, format!("unknown tool \"{other}\"")),
    }
}

fn ok_response(id: Value, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

fn error_response(id: Value, message: String) -> Value {
    json!({ "id": id, "error": { "message": message } })
}
