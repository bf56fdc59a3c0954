//! Downstream transport implementations: a stdio client that spawns a fresh
//! child process per call, and an HTTP client with OAuth auto-negotiation.
//!
//! Both implement [`DownstreamClient`], the trait the connection manager
//! holds a `Box<dyn DownstreamClient>` behind. Neither maintains a
//! persistent session — every `list_tools`/`call_tool` call starts and tears
//! down its own transport, matching the per-call session isolation the
//! connection manager relies on.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::config::ServerDescriptor;
use crate::error::{Error, Result};

/// Minimal tool descriptor returned by `list_tools`, matching the shape a
/// downstream server reports for its own tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A downstream server client, abstracting over stdio and HTTP transports.
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value>;
}

/// Build the right client for a server descriptor. Construction never
/// connects — it only validates the descriptor shape and prepares state.
pub fn build_client(server_name: &str, descriptor: &ServerDescriptor) -> Box<dyn DownstreamClient> {
    match descriptor {
        ServerDescriptor::Stdio { command, args, env, .. } => Box::new(StdioClient {
            server_name: server_name.to_string(),
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
        }),
        ServerDescriptor::Http { url, headers, .. } => {
            if descriptor.has_authorization_header() {
                Box::new(HttpClient::with_explicit_headers(
                    server_name,
                    url.clone(),
                    headers.clone(),
                ))
            } else {
                Box::new(HttpClient::with_oauth(server_name, url.clone()))
            }
        }
    }
}

/// Spawns the configured command fresh for every call, speaks newline-framed
/// JSON-RPC over stdin/stdout, and tears the process down once the response
/// is read.
pub struct StdioClient {
    server_name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl StdioClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        debug!(server = %self.server_name, %method, "spawning stdio session");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ServerUnavailable {
                server: self.server_name.clone(),
                reason: format!("failed to spawn \"{}\": {e}", self.command),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::ServerUnavailable {
            server: self.server_name.clone(),
            reason: "child process has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::ServerUnavailable {
            server: self.server_name.clone(),
            reason: "child process has no stdout".into(),
        })?;
        let mut reader = BufReader::new(stdout);

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::DownstreamFailure(format!("write to {}: {e}", self.server_name)))?;
        stdin.flush().await.ok();

        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| Error::DownstreamFailure(format!("read from {}: {e}", self.server_name)))?;

        let _ = child.kill().await;
        let _ = child.wait().await;

        if response_line.trim().is_empty() {
            return Err(Error::DownstreamFailure(format!(
                "{} closed without responding",
                self.server_name
            )));
        }

        let response: Value = serde_json::from_str(response_line.trim())?;
        extract_result(&self.server_name, response)
    }
}

#[async_trait]
impl DownstreamClient for StdioClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tool_list(result)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await
    }
}

/// Headers an HTTP client attaches to every request, either supplied
/// verbatim by the operator or auto-negotiated via OAuth on challenge.
enum HttpAuth {
    Explicit(HashMap<String, String>),
    OAuth { token: RwLock<Option<String>> },
}

pub struct HttpClient {
    server_name: String,
    base_url: String,
    client: reqwest::Client,
    auth: HttpAuth,
}

impl HttpClient {
    fn with_explicit_headers(server_name: &str, base_url: String, headers: HashMap<String, String>) -> Self {
        Self {
            server_name: server_name.to_string(),
            base_url,
            client: reqwest::Client::new(),
            auth: HttpAuth::Explicit(headers),
        }
    }

    fn with_oauth(server_name: &str, base_url: String) -> Self {
        Self {
            server_name: server_name.to_string(),
            base_url,
            client: reqwest::Client::new(),
            auth: HttpAuth::OAuth {
                token: RwLock::new(None),
            },
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.send(&body).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if let HttpAuth::OAuth { .. } = &self.auth {
                debug!(server = %self.server_name, "authorization challenge received, negotiating OAuth token");
                self.negotiate_oauth().await?;
                let retried = self.send(&body).await?;
                return self.finish(retried).await;
            }
        }

        self.finish(response).await
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let mut req = self.client.post(&self.base_url).json(body);

        match &self.auth {
            HttpAuth::Explicit(headers) => {
                for (key, value) in headers {
                    req = req.header(key, value);
                }
            }
            HttpAuth::OAuth { token } => {
                if let Some(t) = token.read().unwrap().clone() {
                    req = req.header("Authorization", format!("Bearer {t}"));
                }
            }
        }

        req.send().await.map_err(|e| {
            Error::DownstreamFailure(format!("request to {}: {e}", self.server_name))
        })
    }

    async fn finish(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::DownstreamFailure(format!("invalid response from {}: {e}", self.server_name)))?;

        if !status.is_success() {
            return Err(Error::DownstreamFailure(format!(
                "{} returned HTTP {status}",
                self.server_name
            )));
        }

        extract_result(&self.server_name, body)
    }

    /// Discover the token endpoint and exchange client credentials for a
    /// bearer token, per RFC 8414 metadata discovery. Credentials come from
    /// `GATEWAY_OAUTH_CLIENT_ID`/`GATEWAY_OAUTH_CLIENT_SECRET`.
    async fn negotiate_oauth(&self) -> Result<()> {
        let HttpAuth::OAuth { token } = &self.auth else {
            return Ok(());
        };

        let base = self.base_url.trim_end_matches('/');
        let metadata_url = format!("{base}/.well-known/oauth-authorization-server");
        let metadata: Value = self
            .client
            .get(&metadata_url)
            .send()
            .await
            .map_err(|e| Error::DownstreamFailure(format!("OAuth discovery for {}: {e}", self.server_name)))?
            .json()
            .await
            .map_err(|e| Error::DownstreamFailure(format!("OAuth metadata for {}: {e}", self.server_name)))?;

        let token_endpoint = metadata
            .get("token_endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::DownstreamFailure(format!(
                    "{} OAuth metadata missing token_endpoint",
                    self.server_name
                ))
            })?;

        let client_id = std::env::var("GATEWAY_OAUTH_CLIENT_ID").map_err(|_| {
            Error::DownstreamFailure(format!(
                "{} requires OAuth but GATEWAY_OAUTH_CLIENT_ID is not set",
                self.server_name
            ))
        })?;
        let client_secret = std::env::var("GATEWAY_OAUTH_CLIENT_SECRET").unwrap_or_default();

        let token_response: Value = self
            .client
            .post(token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::DownstreamFailure(format!("OAuth token exchange for {}: {e}", self.server_name)))?
            .json()
            .await
            .map_err(|e| Error::DownstreamFailure(format!("OAuth token response for {}: {e}", self.server_name)))?;

        let access_token = token_response
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::DownstreamFailure(format!(
                    "{} OAuth token response missing access_token",
                    self.server_name
                ))
            })?;

        *token.write().unwrap() = Some(access_token.to_string());
        Ok(())
    }
}

#[async_trait]
impl DownstreamClient for HttpClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        parse_tool_list(result)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await
    }
}

fn extract_result(server_name: &str, response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown downstream error");
        return Err(Error::DownstreamFailure(format!("{server_name}: {message}")));
    }

    response
        .get("result")
        .cloned()
        .ok_or_else(|| Error::DownstreamFailure(format!("{server_name} response has no result field")))
}

fn parse_tool_list(result: Value) -> Result<Vec<ToolInfo>> {
    let tools = result
        .get("tools")
        .cloned()
        .unwrap_or_else(|| Value::Array(vec![]));
    serde_json::from_value(tools).map_err(Error::from)
}

/// Applies exponential backoff between connection attempts:
/// `base_delay * 2^attempt`, per the connection manager's retry policy.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
