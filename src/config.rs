//! Config Loader & Validator: parses, schema-validates, env-substitutes, and
//! cross-validates the two JSON configuration files. Every entry point here
//! is re-entrant and side-effect-free — it never mutates process state.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::glob_match::{validate_server_pattern, validate_tool_pattern};

/// One configured downstream server. Exactly one transport variant; parsing
/// enforces mutual exclusion between `command` and `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerDescriptor {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        description: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl ServerDescriptor {
    /// Human-readable description, if the descriptor carries one, surfaced
    /// by `list_servers` when `include_metadata` is requested.
    pub fn description(&self) -> Option<&str> {
        match self {
            ServerDescriptor::Stdio { description, .. } => description.as_deref(),
            ServerDescriptor::Http { description, .. } => description.as_deref(),
        }
    }
    pub fn transport_name(&self) -> &'static str {
        match self {
            ServerDescriptor::Stdio { .. } => "stdio",
            ServerDescriptor::Http { .. } => "http",
        }
    }

    /// True when the HTTP descriptor carries an `Authorization` header
    /// (case-insensitive key match), in which case OAuth auto-negotiation
    /// must be disabled per the downstream connection manager.
    pub fn has_authorization_header(&self) -> bool {
        match self {
            ServerDescriptor::Http { headers, .. } => {
                headers.keys().any(|k| k.eq_ignore_ascii_case("authorization"))
            }
            ServerDescriptor::Stdio { .. } => false,
        }
    }
}

/// The full set of configured downstream servers, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub servers: HashMap<String, ServerDescriptor>,
}

/// `allow` or `deny` section of a single agent's rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSection {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub tools: HashMap<String, Vec<String>>,
}

/// One agent's allow/deny rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRules {
    #[serde(default)]
    pub allow: RuleSection,
    #[serde(default)]
    pub deny: RuleSection,
}

/// Defaults applied when an agent id has no entry in `agents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_deny_on_missing_agent")]
    pub deny_on_missing_agent: bool,
}

fn default_deny_on_missing_agent() -> bool {
    true
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            deny_on_missing_agent: true,
        }
    }
}

/// The full gateway rules document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayRules {
    #[serde(default)]
    pub agents: HashMap<String, AgentRules>,
    #[serde(default)]
    pub defaults: Defaults,
}

fn agent_id_re() -> Regex {
    Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static regex is valid")
}

/// Load and validate the MCP server configuration file, performing
/// `${VAR}` environment-variable substitution on every string value.
pub fn load_mcp_config(path: &Path) -> Result<McpConfig> {
    if !path.exists() {
        return Err(Error::ConfigNotFound(path.display().to_string()));
    }

    let text = std::fs::read_to_string(path)?;
    let raw: Value = serde_json::from_str(&text).map_err(|source| Error::ConfigInvalidJson {
        path: path.display().to_string(),
        source,
    })?;

    validate_mcp_config_shape(&raw)?;
    let substituted = substitute_env_vars(raw)?;

    serde_json::from_value(substituted)
        .map_err(|e| Error::ConfigInvalidSchema(format!("MCP server configuration: {e}")))
}

/// Load and validate the gateway rules file. No environment substitution is
/// performed on this file.
pub fn load_gateway_rules(path: &Path) -> Result<GatewayRules> {
    if !path.exists() {
        return Err(Error::ConfigNotFound(path.display().to_string()));
    }

    let text = std::fs::read_to_string(path)?;
    let raw: Value = serde_json::from_str(&text).map_err(|source| Error::ConfigInvalidJson {
        path: path.display().to_string(),
        source,
    })?;

    validate_gateway_rules_shape(&raw)?;

    serde_json::from_value(raw)
        .map_err(|e| Error::ConfigInvalidSchema(format!("gateway rules: {e}")))
}

/// Load and validate both files, then cross-validate: every server named by
/// any agent rule must either be the wildcard `*` or exist in the MCP
/// config. Cross-validation failures are warnings, never errors.
pub fn reload_configs(
    mcp_path: &Path,
    rules_path: &Path,
) -> Result<(McpConfig, GatewayRules, Vec<String>)> {
    let mcp_config = load_mcp_config(mcp_path)?;
    let gateway_rules = load_gateway_rules(rules_path)?;
    let warnings = validate_rules_against_servers(&gateway_rules, &mcp_config);
    Ok((mcp_config, gateway_rules, warnings))
}

/// Structural validation of the raw MCP config JSON, before env
/// substitution or typed deserialization. Mirrors the original
/// implementation's validation order so error messages stay stable.
fn validate_mcp_config_shape(raw: &Value) -> Result<()> {
    let obj = raw.as_object().ok_or_else(|| {
        Error::ConfigInvalidSchema(format!(
            "MCP server configuration must be a JSON object, got {}",
            type_name(raw)
        ))
    })?;

    let servers = obj.get("mcpServers").ok_or_else(|| {
        Error::ConfigInvalidSchema("MCP server configuration must contain \"mcpServers\" key".into())
    })?;

    let servers = servers.as_object().ok_or_else(|| {
        Error::ConfigInvalidSchema(format!(
            "\"mcpServers\" must be an object, got {}",
            type_name(servers)
        ))
    })?;

    for (name, server) in servers {
        let server_obj = server.as_object().ok_or_else(|| {
            Error::ConfigInvalidSchema(format!(
                "server \"{name}\" configuration must be an object, got {}",
                type_name(server)
            ))
        })?;

        let has_command = server_obj.contains_key("command");
        let has_url = server_obj.contains_key("url");

        if has_command && has_url {
            return Err(Error::ConfigInvalidSchema(format!(
                "server \"{name}\" cannot have both \"command\" (stdio) and \"url\" (HTTP) - specify one transport type only"
            )));
        }
        if !has_command && !has_url {
            return Err(Error::ConfigInvalidSchema(format!(
                "server \"{name}\" must specify either \"command\" (stdio) or \"url\" (HTTP) transport"
            )));
        }

        if has_command {
            let command = &server_obj["command"];
            if !command.is_string() {
                return Err(Error::ConfigInvalidSchema(format!(
                    "server \"{name}\": \"command\" must be a string, got {}",
                    type_name(command)
                )));
            }
            if let Some(args) = server_obj.get("args") {
                let args_arr = args.as_array().ok_or_else(|| {
                    Error::ConfigInvalidSchema(format!(
                        "server \"{name}\": \"args\" must be an array, got {}",
                        type_name(args)
                    ))
                })?;
                for (i, arg) in args_arr.iter().enumerate() {
                    if !arg.is_string() {
                        return Err(Error::ConfigInvalidSchema(format!(
                            "server \"{name}\": args[{i}] must be a string, got {}",
                            type_name(arg)
                        )));
                    }
                }
            }
            if let Some(env) = server_obj.get("env") {
                let env_obj = env.as_object().ok_or_else(|| {
                    Error::ConfigInvalidSchema(format!(
                        "server \"{name}\": \"env\" must be an object, got {}",
                        type_name(env)
                    ))
                })?;
                for (key, value) in env_obj {
                    if !value.is_string() {
                        return Err(Error::ConfigInvalidSchema(format!(
                            "server \"{name}\": env[\"{key}\"] must be a string, got {}",
                            type_name(value)
                        )));
                    }
                }
            }
        }

        if has_url {
            let url_val = &server_obj["url"];
            let url = url_val.as_str().ok_or_else(|| {
                Error::ConfigInvalidSchema(format!(
                    "server \"{name}\": \"url\" must be a string, got {}",
                    type_name(url_val)
                ))
            })?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::ConfigInvalidSchema(format!(
                    "server \"{name}\": \"url\" must start with http:// or https://, got \"{url}\""
                )));
            }
            if let Some(headers) = server_obj.get("headers") {
                let headers_obj = headers.as_object().ok_or_else(|| {
                    Error::ConfigInvalidSchema(format!(
                        "server \"{name}\": \"headers\" must be an object, got {}",
                        type_name(headers)
                    ))
                })?;
                for (key, value) in headers_obj {
                    if !value.is_string() {
                        return Err(Error::ConfigInvalidSchema(format!(
                            "server \"{name}\": headers[\"{key}\"] must be a string, got {}",
                            type_name(value)
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

/// Structural validation of the raw gateway rules JSON.
fn validate_gateway_rules_shape(raw: &Value) -> Result<()> {
    let obj = raw.as_object().ok_or_else(|| {
        Error::ConfigInvalidSchema(format!(
            "gateway rules configuration must be a JSON object, got {}",
            type_name(raw)
        ))
    })?;

    let id_re = agent_id_re();

    if let Some(agents) = obj.get("agents") {
        let agents_obj = agents.as_object().ok_or_else(|| {
            Error::ConfigInvalidSchema(format!(
                "\"agents\" must be an object, got {}",
                type_name(agents)
            ))
        })?;

        for (agent_id, agent_config) in agents_obj {
            if agent_id.is_empty() {
                return Err(Error::ConfigInvalidSchema(
                    "agent id must be a non-empty string".into(),
                ));
            }
            if !id_re.is_match(agent_id) {
                return Err(Error::ConfigInvalidSchema(format!(
                    "agent id \"{agent_id}\" contains invalid characters. Only alphanumeric, underscore, dot, and hyphen allowed."
                )));
            }

            let agent_obj = agent_config.as_object().ok_or_else(|| {
                Error::ConfigInvalidSchema(format!(
                    "agent \"{agent_id}\" configuration must be an object, got {}",
                    type_name(agent_config)
                ))
            })?;

            for section_name in ["allow", "deny"] {
                let Some(section) = agent_obj.get(section_name) else {
                    continue;
                };
                let section_obj = section.as_object().ok_or_else(|| {
                    Error::ConfigInvalidSchema(format!(
                        "agent \"{agent_id}\" {section_name} section must be an object, got {}",
                        type_name(section)
                    ))
                })?;

                if let Some(servers) = section_obj.get("servers") {
                    let servers_arr = servers.as_array().ok_or_else(|| {
                        Error::ConfigInvalidSchema(format!(
                            "agent \"{agent_id}\" {section_name}.servers must be an array, got {}",
                            type_name(servers)
                        ))
                    })?;
                    for (i, server) in servers_arr.iter().enumerate() {
                        let server_str = server.as_str().ok_or_else(|| {
                            Error::ConfigInvalidSchema(format!(
                                "agent \"{agent_id}\" {section_name}.servers[{i}] must be a string, got {}",
                                type_name(server)
                            ))
                        })?;
                        validate_server_pattern(
                            server_str,
                            &format!("agent \"{agent_id}\" {section_name}.servers[{i}]"),
                        )?;
                    }
                }

                if let Some(tools) = section_obj.get("tools") {
                    let tools_obj = tools.as_object().ok_or_else(|| {
                        Error::ConfigInvalidSchema(format!(
                            "agent \"{agent_id}\" {section_name}.tools must be an object, got {}",
                            type_name(tools)
                        ))
                    })?;
                    for (server_name, patterns) in tools_obj {
                        let patterns_arr = patterns.as_array().ok_or_else(|| {
                            Error::ConfigInvalidSchema(format!(
                                "agent \"{agent_id}\" {section_name}.tools[\"{server_name}\"] must be an array, got {}",
                                type_name(patterns)
                            ))
                        })?;
                        for (i, pattern) in patterns_arr.iter().enumerate() {
                            let pattern_str = pattern.as_str().ok_or_else(|| {
                                Error::ConfigInvalidSchema(format!(
                                    "agent \"{agent_id}\" {section_name}.tools[\"{server_name}\"][{i}] must be a string, got {}",
                                    type_name(pattern)
                                ))
                            })?;
                            validate_tool_pattern(
                                pattern_str,
                                &format!(
                                    "agent \"{agent_id}\" {section_name}.tools[\"{server_name}\"][{i}]"
                                ),
                            )?;
                        }
                    }
                }
            }
        }
    }

    if let Some(defaults) = obj.get("defaults") {
        let defaults_obj = defaults.as_object().ok_or_else(|| {
            Error::ConfigInvalidSchema(format!(
                "\"defaults\" must be an object, got {}",
                type_name(defaults)
            ))
        })?;
        if let Some(deny) = defaults_obj.get("deny_on_missing_agent") {
            if !deny.is_boolean() {
                return Err(Error::ConfigInvalidSchema(format!(
                    "\"defaults.deny_on_missing_agent\" must be a boolean, got {}",
                    type_name(deny)
                )));
            }
        }
    }

    Ok(())
}

/// Recursively replace every `${NAME}` occurrence in string values with the
/// named environment variable. Fails on the first missing variable.
fn substitute_env_vars(value: Value) -> Result<Value> {
    let placeholder = Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid");

    fn walk(value: Value, placeholder: &Regex) -> Result<Value> {
        match value {
            Value::String(s) => {
                let mut missing: Option<String> = None;
                let replaced = placeholder.replace_all(&s, |caps: &regex::Captures| {
                    let var_name = &caps[1];
                    match std::env::var(var_name) {
                        Ok(v) => v,
                        Err(_) => {
                            if missing.is_none() {
                                missing = Some(var_name.to_string());
                            }
                            String::new()
                        }
                    }
                });
                if let Some(name) = missing {
                    return Err(Error::EnvVarMissing(name));
                }
                Ok(Value::String(replaced.into_owned()))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k, walk(v, placeholder)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(walk(item, placeholder)?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other),
        }
    }

    walk(value, &placeholder)
}

/// Servers referenced by any agent rule that are neither `*` nor present in
/// the MCP config produce a warning, never a hard failure.
pub fn validate_rules_against_servers(rules: &GatewayRules, mcp_config: &McpConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let available: std::collections::HashSet<&String> = mcp_config.servers.keys().collect();

    for (agent_id, agent) in &rules.agents {
        for (section_name, section) in [("allow", &agent.allow), ("deny", &agent.deny)] {
            for server in &section.servers {
                if server != "*" && !available.contains(server) {
                    warnings.push(format!(
                        "agent \"{agent_id}\" {section_name}.servers references undefined server \"{server}\""
                    ));
                }
            }
        }
    }

    warnings
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_stdio_and_http_servers() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "mcp.json",
            r#"{"mcpServers": {
                "fs": {"command": "npx", "args": ["-y", "server-fs"]},
                "notion": {"url": "https://mcp.notion.com/mcp"}
            }}"#,
        );

        let config = load_mcp_config(&path).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["fs"].transport_name(), "stdio");
        assert_eq!(config.servers["notion"].transport_name(), "http");
    }

    #[test]
    fn rejects_both_command_and_url() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "mcp.json",
            r#"{"mcpServers": {"bad": {"command": "x", "url": "https://x"}}}"#,
        );
        let err = load_mcp_config(&path).unwrap_err();
        assert!(err.to_string().contains("cannot have both"));
    }

    #[test]
    fn env_substitution_succeeds_and_fails() {
        std::env::set_var("AGENT_MCP_GATEWAY_TEST_KEY", "secret123");
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "mcp.json",
            r#"{"mcpServers": {"x": {"command": "npx", "env": {"API_KEY": "${AGENT_MCP_GATEWAY_TEST_KEY}"}}}}"#,
        );
        let config = load_mcp_config(&path).unwrap();
        match &config.servers["x"] {
            ServerDescriptor::Stdio { env, .. } => {
                assert_eq!(env["API_KEY"], "secret123");
            }
            _ => panic!("expected stdio descriptor"),
        }
        std::env::remove_var("AGENT_MCP_GATEWAY_TEST_KEY");

        let path2 = write(
            &dir,
            "mcp2.json",
            r#"{"mcpServers": {"x": {"command": "npx", "env": {"API_KEY": "${AGENT_MCP_GATEWAY_DOES_NOT_EXIST}"}}}}"#,
        );
        let err = load_mcp_config(&path2).unwrap_err();
        assert!(err.to_string().contains("AGENT_MCP_GATEWAY_DOES_NOT_EXIST"));
    }

    #[test]
    fn rejects_multi_wildcard_tool_pattern() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "rules.json",
            r#"{"agents": {"backend": {"deny": {"tools": {"postgres": ["drop_*_all"]}}}}}"#,
        );
        let err = load_gateway_rules(&path).unwrap_err();
        assert!(err.to_string().contains("multiple wildcards"));
    }

    #[test]
    fn cross_validation_produces_warnings_not_errors() {
        let dir = TempDir::new().unwrap();
        let mcp_path = write(&dir, "mcp.json", r#"{"mcpServers": {"real": {"command": "x"}}}"#);
        let rules_path = write(
            &dir,
            "rules.json",
            r#"{"agents": {"a": {"allow": {"servers": ["ghost"]}}}}"#,
        );

        let (_config, _rules, warnings) = reload_configs(&mcp_path, &rules_path).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ghost"));
    }

    #[test]
    fn missing_file_is_config_not_found() {
        let result = load_mcp_config(Path::new("/nonexistent/mcp.json"));
        assert!(matches!(result, Err(Error::ConfigNotFound(_))));
    }
}
