//! Configuration / CLI: flags, environment-variable fallbacks, and the
//! `--init` example-config scaffolding.

use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

const EXAMPLE_MCP_SERVERS: &str = include_str!("../templates/mcp-servers.example.json");
const EXAMPLE_GATEWAY_RULES: &str = include_str!("../templates/gateway-rules.example.json");

#[derive(Debug, Parser)]
#[command(name = "agent-mcp-gateway", version, about = "Policy-enforcing proxy gateway for the Model Context Protocol")]
pub struct Cli {
    /// Enable verbose logging and register the `get_gateway_status` tool.
    #[arg(long)]
    pub debug: bool,

    /// Scaffold an example config directory at ~/.config/agent-mcp-gateway/ and exit.
    #[arg(long)]
    pub init: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

/// Resolved environment-driven configuration, read directly via
/// `std::env::var` rather than clap's `env` attribute (see §10.3).
pub struct EnvConfig {
    pub mcp_config_path: PathBuf,
    pub gateway_rules_path: PathBuf,
    pub audit_log_path: PathBuf,
    pub default_agent: Option<String>,
    pub debug: bool,
}

impl EnvConfig {
    pub fn resolve(cli_debug: bool) -> Self {
        let mcp_config_path = env_path("GATEWAY_MCP_CONFIG", "./config/mcp-servers.json");
        let gateway_rules_path = env_path("GATEWAY_RULES", "./config/gateway-rules.json");
        let audit_log_path = env_path("GATEWAY_AUDIT_LOG", "./logs/audit.jsonl");
        let default_agent = std::env::var("GATEWAY_DEFAULT_AGENT").ok();
        let debug = cli_debug || env_truthy("GATEWAY_DEBUG");

        Self {
            mcp_config_path,
            gateway_rules_path,
            audit_log_path,
            default_agent,
            debug,
        }
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_truthy(var: &str) -> bool {
    match std::env::var(var) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

/// Scaffold `~/.config/agent-mcp-gateway/{mcp-servers.json,gateway-rules.json}`
/// from embedded templates, prompting before overwriting an existing file.
/// A non-interactive stdin (no tty) is treated as "no".
pub fn init_config_directory() -> Result<()> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::ConfigInvalidSchema("could not determine home directory for --init".to_string())
    })?;
    let dir = home.join(".config").join("agent-mcp-gateway");
    std::fs::create_dir_all(&dir)?;

    write_with_prompt(&dir.join("mcp-servers.json"), EXAMPLE_MCP_SERVERS)?;
    write_with_prompt(&dir.join("gateway-rules.json"), EXAMPLE_GATEWAY_RULES)?;

    println!("Initialized example configuration in {}", dir.display());
    Ok(())
}

fn write_with_prompt(path: &std::path::Path, contents: &str) -> Result<()> {
    if path.exists() && !confirm_overwrite(path) {
        println!("Skipped existing file: {}", path.display());
        return Ok(());
    }

    std::fs::write(path, contents)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn confirm_overwrite(path: &std::path::Path) -> bool {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return false;
    }

    print!("{} already exists. Overwrite? [y/N] ", path.display());
    let _ = std::io::Write::flush(&mut std::io::stdout());

    let mut line = String::new();
    if stdin.lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
