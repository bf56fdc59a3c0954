//! Request Middleware: extracts and validates `agent_id` from every
//! tool-call's arguments before it reaches a virtual-tool handler.
//!
//! Grounded on `original_source/src/middleware.py`'s `AgentAccessControl`:
//! the only behavior here is pulling `agent_id` out of the argument map,
//! enforcing its presence when required, and stripping it so downstream
//! handlers never see it as a forwarded argument.

use serde_json::{Map, Value};

use crate::config::Defaults;
use crate::error::{Error, Result};

/// Pull `agent_id` out of `args`, removing the key so it is never forwarded
/// to a handler as an ordinary argument. Returns `None` only when the key
/// is absent and `defaults.deny_on_missing_agent` is false; otherwise an
/// absent key is an error.
pub fn extract_agent_id(defaults: &Defaults, args: &mut Map<String, Value>) -> Result<Option<String>> {
    let Some(value) = args.remove("agent_id") else {
        if defaults.deny_on_missing_agent {
            return Err(Error::MissingAgentId);
        }
        return Ok(None);
    };

    match value {
        Value::String(s) => Ok(Some(s)),
        other => Err(Error::AccessDenied {
            agent: String::new(),
            resource: format!("agent_id must be a string, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults(deny_on_missing: bool) -> Defaults {
        Defaults {
            deny_on_missing_agent: deny_on_missing,
        }
    }

    #[test]
    fn extracts_and_strips_agent_id() {
        let mut args = json!({"agent_id": "backend", "foo": 1}).as_object().unwrap().clone();
        let agent = extract_agent_id(&defaults(true), &mut args).unwrap();
        assert_eq!(agent, Some("backend".to_string()));
        assert!(!args.contains_key("agent_id"));
        assert!(args.contains_key("foo"));
    }

    #[test]
    fn missing_agent_id_denied_by_default() {
        let mut args = json!({}).as_object().unwrap().clone();
        let err = extract_agent_id(&defaults(true), &mut args).unwrap_err();
        assert!(matches!(err, Error::MissingAgentId));
    }

    #[test]
    fn missing_agent_id_allowed_when_not_required() {
        let mut args = json!({}).as_object().unwrap().clone();
        let agent = extract_agent_id(&defaults(false), &mut args).unwrap();
        assert_eq!(agent, None);
    }

    #[test]
    fn non_string_agent_id_is_an_error() {
        let mut args = json!({"agent_id": 42}).as_object().unwrap().clone();
        assert!(extract_agent_id(&defaults(true), &mut args).is_err());
    }
}
