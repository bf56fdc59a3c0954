//! Policy Engine: evaluates agent permissions against configured rules.
//!
//! Enforces a strict deny-before-allow precedence at both server and tool
//! granularity. The precedence order is load-bearing and must never change:
//!
//! 1. Explicit deny rules (specific names)
//! 2. Explicit allow rules (specific names)
//! 3. Wildcard deny rules (patterns like `drop_*`)
//! 4. Wildcard allow rules (patterns like `get_*` or `*`)
//! 5. Default policy (`defaults.deny_on_missing_agent`)

use std::sync::RwLock;

use tracing::info;

use crate::config::GatewayRules;
use crate::glob_match::{is_wildcard, matches};

/// Thread-safe holder for the current rules, swapped atomically on reload.
pub struct PolicyEngine {
    rules: RwLock<GatewayRules>,
}

/// Counts of what changed between an old and new rules document, used for
/// reload logging.
#[derive(Debug, Default, PartialEq)]
pub struct RuleDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub defaults_changed: bool,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && !self.defaults_changed
    }
}

impl PolicyEngine {
    pub fn new(rules: GatewayRules) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// True if `agent_id` can access `server`.
    ///
    /// An unknown agent falls back to `defaults.deny_on_missing_agent`.
    pub fn can_access_server(&self, agent_id: &str, server: &str) -> bool {
        let rules = self.rules.read().unwrap();
        eval_server_access(&rules, agent_id, server)
    }

    /// True if `agent_id` can invoke `tool` on `server`. Server access is
    /// checked first; tool access is then resolved by the same
    /// deny-before-allow precedence, restricted to rules scoped to `server`.
    ///
    /// Both checks read a single lock guard so a concurrent `reload` can
    /// never be observed mid-evaluation: either all of the old rules apply
    /// or all of the new ones do.
    pub fn can_access_tool(&self, agent_id: &str, server: &str, tool: &str) -> bool {
        let rules = self.rules.read().unwrap();
        eval_tool_access(&rules, agent_id, server, tool)
    }

    /// Servers configured for `agent_id`, or `["*"]` if wildcard-allowed
    /// with no wildcard deny in effect. Used by `list_servers` to decide
    /// which configured servers to surface without evaluating every one
    /// through `can_access_server`.
    pub fn get_allowed_servers(&self, agent_id: &str) -> Vec<String> {
        let rules = self.rules.read().unwrap();

        let Some(agent) = rules.agents.get(agent_id) else {
            return Vec::new();
        };

        let allow_servers = &agent.allow.servers;
        let deny_servers = &agent.deny.servers;

        if allow_servers.iter().any(|s| s == "*") && !deny_servers.iter().any(|s| s == "*") {
            return vec!["*".to_string()];
        }

        allow_servers
            .iter()
            .filter(|s| s.as_str() != "*")
            .filter(|server| {
                let denied = deny_servers.iter().any(|s| s == *server)
                    || deny_servers
                        .iter()
                        .any(|pattern| is_wildcard(pattern) && matches(server, pattern));
                !denied
            })
            .cloned()
            .collect()
    }

    /// Allowed tool patterns for `agent_id` on `server`: `None` means no
    /// tools (server inaccessible, or the agent has no `tools[server]`
    /// entry), `Some(vec!["*".into()])` means all tools, otherwise the
    /// explicit pattern list configured for that server.
    pub fn get_allowed_tools(&self, agent_id: &str, server: &str) -> Vec<String> {
        let rules = self.rules.read().unwrap();

        if !eval_server_access(&rules, agent_id, server) {
            return Vec::new();
        }

        let Some(agent) = rules.agents.get(agent_id) else {
            if !rules.defaults.deny_on_missing_agent {
                return vec!["*".to_string()];
            }
            return Vec::new();
        };

        let Some(allow_tools) = agent.allow.tools.get(server) else {
            return Vec::new();
        };

        if allow_tools.iter().any(|t| t == "*") {
            return vec!["*".to_string()];
        }

        allow_tools.clone()
    }

    /// Human-readable explanation of a policy decision, for audit logs and
    /// debug-mode error messages.
    pub fn decision_reason(&self, agent_id: &str, server: &str, tool: Option<&str>) -> String {
        let rules = self.rules.read().unwrap();

        let Some(agent) = rules.agents.get(agent_id) else {
            return if rules.defaults.deny_on_missing_agent {
                format!("agent \"{agent_id}\" not found in rules; default policy denies access")
            } else {
                format!("agent \"{agent_id}\" not found in rules; default policy allows access")
            };
        };

        let deny_servers = &agent.deny.servers;
        let allow_servers = &agent.allow.servers;

        if deny_servers.iter().any(|s| s == server) {
            return format!("server \"{server}\" explicitly denied for agent \"{agent_id}\"");
        }
        for pattern in deny_servers.iter().filter(|p| is_wildcard(p)) {
            if matches(server, pattern) {
                return format!(
                    "server \"{server}\" denied by pattern \"{pattern}\" for agent \"{agent_id}\""
                );
            }
        }

        let mut server_allowed = false;
        let mut server_allow_reason = String::new();
        if allow_servers.iter().any(|s| s == server) {
            server_allowed = true;
            server_allow_reason = format!("server \"{server}\" explicitly allowed");
        } else if allow_servers.iter().any(|s| s == "*") {
            server_allowed = true;
            server_allow_reason = "server allowed by wildcard \"*\"".to_string();
        } else {
            for pattern in allow_servers.iter().filter(|p| is_wildcard(p)) {
                if matches(server, pattern) {
                    server_allowed = true;
                    server_allow_reason =
                        format!("server \"{server}\" allowed by pattern \"{pattern}\"");
                    break;
                }
            }
        }

        if !server_allowed {
            return format!("server \"{server}\" not in allowed list for agent \"{agent_id}\"");
        }

        let Some(tool) = tool else {
            return server_allow_reason;
        };

        let empty = Vec::new();
        let deny_tools = agent.deny.tools.get(server).unwrap_or(&empty);
        let allow_tools = agent.allow.tools.get(server).unwrap_or(&empty);

        if deny_tools.iter().any(|t| t == tool) {
            return format!(
                "tool \"{tool}\" explicitly denied for agent \"{agent_id}\" on server \"{server}\""
            );
        }
        if allow_tools.iter().any(|t| t == tool) {
            return format!(
                "tool \"{tool}\" explicitly allowed for agent \"{agent_id}\" on server \"{server}\""
            );
        }
        for pattern in deny_tools.iter().filter(|p| is_wildcard(p)) {
            if matches(tool, pattern) {
                return format!(
                    "tool \"{tool}\" denied by pattern \"{pattern}\" for agent \"{agent_id}\" on server \"{server}\""
                );
            }
        }
        for pattern in allow_tools.iter().filter(|p| is_wildcard(p)) {
            if matches(tool, pattern) {
                return format!(
                    "tool \"{tool}\" allowed by pattern \"{pattern}\" for agent \"{agent_id}\" on server \"{server}\""
                );
            }
        }

        format!("tool \"{tool}\" not in allowed list for agent \"{agent_id}\" on server \"{server}\"")
    }

    /// Atomically swap in `new_rules`, logging what changed. Callers are
    /// expected to have already validated `new_rules` via the config loader;
    /// this method never fails.
    pub fn reload(&self, new_rules: GatewayRules) {
        let diff = {
            let old = self.rules.read().unwrap();
            compute_diff(&old, &new_rules)
        };

        if !diff.added.is_empty() {
            info!(agents = ?diff.added, "policy reload: agents added");
        }
        if !diff.removed.is_empty() {
            info!(agents = ?diff.removed, "policy reload: agents removed");
        }
        if !diff.modified.is_empty() {
            info!(agents = ?diff.modified, "policy reload: agents modified");
        }
        if diff.defaults_changed {
            info!("policy reload: default policy changed");
        }
        if diff.is_empty() {
            info!("policy reload: no changes detected in rules");
        }

        *self.rules.write().unwrap() = new_rules;
    }

    /// Snapshot of the currently active rules, for status reporting.
    pub fn rules_snapshot(&self) -> GatewayRules {
        self.rules.read().unwrap().clone()
    }
}

/// Server-access precedence evaluated against an already-acquired rules
/// guard, so callers that also need tool-level access can evaluate both
/// against the same snapshot instead of re-locking.
fn eval_server_access(rules: &GatewayRules, agent_id: &str, server: &str) -> bool {
    let Some(agent) = rules.agents.get(agent_id) else {
        return !rules.defaults.deny_on_missing_agent;
    };

    let deny_servers = &agent.deny.servers;
    if deny_servers.iter().any(|s| s == server || s == "*") {
        return false;
    }
    if deny_servers
        .iter()
        .any(|pattern| is_wildcard(pattern) && matches(server, pattern))
    {
        return false;
    }

    let allow_servers = &agent.allow.servers;
    if allow_servers.iter().any(|s| s == server || s == "*") {
        return true;
    }
    allow_servers
        .iter()
        .any(|pattern| is_wildcard(pattern) && matches(server, pattern))
}

/// Tool-access precedence, evaluated against the same rules guard as the
/// server check that gates it.
fn eval_tool_access(rules: &GatewayRules, agent_id: &str, server: &str, tool: &str) -> bool {
    if !eval_server_access(rules, agent_id, server) {
        return false;
    }

    let Some(agent) = rules.agents.get(agent_id) else {
        return !rules.defaults.deny_on_missing_agent;
    };

    let empty = Vec::new();
    let deny_tools = agent.deny.tools.get(server).unwrap_or(&empty);
    let allow_tools = agent.allow.tools.get(server).unwrap_or(&empty);

    let (explicit_deny, wildcard_deny): (Vec<&String>, Vec<&String>) =
        deny_tools.iter().partition(|r| !is_wildcard(r));
    let (explicit_allow, wildcard_allow): (Vec<&String>, Vec<&String>) =
        allow_tools.iter().partition(|r| !is_wildcard(r));

    if explicit_deny.iter().any(|r| r.as_str() == tool) {
        return false;
    }
    if explicit_allow.iter().any(|r| r.as_str() == tool) {
        return true;
    }
    if wildcard_deny.iter().any(|pattern| matches(tool, pattern)) {
        return false;
    }
    if wildcard_allow.iter().any(|pattern| matches(tool, pattern)) {
        return true;
    }

    false
}

fn compute_diff(old: &GatewayRules, new: &GatewayRules) -> RuleDiff {
    let old_agents: std::collections::HashSet<&String> = old.agents.keys().collect();
    let new_agents: std::collections::HashSet<&String> = new.agents.keys().collect();

    let mut added: Vec<String> = new_agents.difference(&old_agents).map(|s| s.to_string()).collect();
    added.sort();
    let mut removed: Vec<String> = old_agents.difference(&new_agents).map(|s| s.to_string()).collect();
    removed.sort();

    let mut modified: Vec<String> = old_agents
        .intersection(&new_agents)
        .filter(|id| old.agents.get(**id) != new.agents.get(**id))
        .map(|s| s.to_string())
        .collect();
    modified.sort();

    RuleDiff {
        added,
        removed,
        modified,
        defaults_changed: old.defaults != new.defaults,
    }
}
