//! Pattern validation and matching for server/tool names.
//!
//! Grounded on the teacher's hand-rolled `*`/`?` matcher
//! (`ricecoder-permissions::glob_matcher`), but matching itself is delegated
//! to `globset` so `[set]`/`[!set]` work too — the teacher's matcher only
//! ever needed `*`/`?` for its own use cases.

use globset::GlobBuilder;

use crate::error::{Error, Result};

/// Case-sensitive, whole-name glob match. `*` matches any substring
/// (including empty), `?` matches exactly one character, `[set]`/`[!set]`
/// match a single character in/not-in the set.
pub fn matches(name: &str, pattern: &str) -> bool {
    if pattern == name {
        return true;
    }
    match GlobBuilder::new(pattern)
        .literal_separator(false)
        .case_insensitive(false)
        .build()
    {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(_) => false,
    }
}

/// A server-name pattern may only be a literal name or the bare `*`.
pub fn validate_server_pattern(pattern: &str, context: &str) -> Result<()> {
    if pattern == "*" {
        return Ok(());
    }
    if pattern.contains('*') {
        return Err(Error::ConfigInvalidSchema(format!(
            "{context}: wildcard \"*\" can only be used alone, not in pattern \"{pattern}\""
        )));
    }
    Ok(())
}

/// A tool pattern may be a literal, the bare `*`, or contain exactly one `*`
/// at the very start or end of the string.
pub fn validate_tool_pattern(pattern: &str, context: &str) -> Result<()> {
    let count = pattern.matches('*').count();
    if count == 0 {
        return Ok(());
    }
    if count > 1 {
        return Err(Error::ConfigInvalidSchema(format!(
            "{context}: pattern \"{pattern}\" contains multiple wildcards - only one allowed"
        )));
    }
    if pattern != "*" && !(pattern.starts_with('*') || pattern.ends_with('*')) {
        return Err(Error::ConfigInvalidSchema(format!(
            "{context}: wildcard in pattern \"{pattern}\" must be at start, end, or alone"
        )));
    }
    Ok(())
}

/// True if `pattern` contains a `*` (used to partition rule lists into
/// "explicit" and "wildcard" buckets per the policy engine's precedence).
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(matches("postgres", "postgres"));
        assert!(!matches("postgres", "mysql"));
    }

    #[test]
    fn star_prefix_and_suffix() {
        assert!(matches("drop_table", "drop_*"));
        assert!(matches("get_user", "*_user"));
        assert!(!matches("create_user", "drop_*"));
    }

    #[test]
    fn bracket_sets() {
        assert!(matches("cat", "c[aeiou]t"));
        assert!(matches("cot", "c[aeiou]t"));
        assert!(!matches("cxt", "c[aeiou]t"));
        assert!(matches("cxt", "c[!aeiou]t"));
    }

    #[test]
    fn server_pattern_rejects_embedded_wildcard() {
        assert!(validate_server_pattern("*", "ctx").is_ok());
        assert!(validate_server_pattern("postgres", "ctx").is_ok());
        assert!(validate_server_pattern("post*res", "ctx").is_err());
    }

    #[test]
    fn tool_pattern_rejects_multiple_or_mid_wildcard() {
        assert!(validate_tool_pattern("drop_*", "ctx").is_ok());
        assert!(validate_tool_pattern("*_user", "ctx").is_ok());
        assert!(validate_tool_pattern("*", "ctx").is_ok());
        assert!(validate_tool_pattern("drop_*_all", "ctx").is_err());
        assert!(validate_tool_pattern("dr*p_table", "ctx").is_err());
    }

    #[test]
    fn is_wildcard_detection() {
        assert!(is_wildcard("drop_*"));
        assert!(!is_wildcard("drop_table"));
    }
}
