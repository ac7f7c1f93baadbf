//! Bridge configuration.

use std::time::Duration;

use crate::errors::{Error, Result};
use crate::protocol::McpTool;
use crate::{
    DEFAULT_ENVIRONMENT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HTTP_TIMEOUT,
    DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SOCKET_CONNECT_TIMEOUT, DEFAULT_WORKFLOW_DEFINITION,
};

/// Construction-time configuration for the bridge.
///
/// The HTTP client is expected to be pre-authenticated for the instance;
/// credential resolution happens outside the bridge.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Base URL of the instance, e.g. `https://gitlab.example.com`.
    pub instance_url: String,
    pub workflow_definition: String,
    pub environment: String,
    /// Client version advertised in start requests.
    pub client_version: String,
    /// Namespace under which hosts pass `workflowSessionID` in provider
    /// options.
    pub provider_id: String,
    pub project_id: Option<String>,
    pub project_path: Option<String>,
    pub cwd: Option<String>,
    pub root_namespace_id: Option<String>,
    /// MCP tools advertised (and preapproved) on every start request.
    pub mcp_tools: Vec<McpTool>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub keepalive_interval: Duration,
    /// Timeout for HTTP passthrough requests executed on the service's
    /// behalf.
    pub http_timeout: Duration,
    pub token_refresh_margin: Option<Duration>,
    /// Pre-authenticated HTTP client; a default one is built when unset.
    pub http_client: Option<reqwest::Client>,
    /// Explicit workflow-service socket endpoint. When unset the endpoint
    /// is derived from the instance URL.
    pub socket_url_override: Option<String>,
}

impl BridgeConfig {
    pub fn new(instance_url: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            workflow_definition: DEFAULT_WORKFLOW_DEFINITION.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            provider_id: "flowbridge".to_string(),
            project_id: None,
            project_path: None,
            cwd: None,
            root_namespace_id: None,
            mcp_tools: Vec::new(),
            connect_timeout: DEFAULT_SOCKET_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            token_refresh_margin: None,
            http_client: None,
            socket_url_override: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.instance_url.trim();
        if url.is_empty() {
            return Err(Error::Config("instance url is required".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(Error::Config(format!("invalid instance url: {url}")));
        }
        if self.workflow_definition.trim().is_empty() {
            return Err(Error::Config("workflow definition is required".to_string()));
        }
        Ok(())
    }

    /// Instance URL with any trailing slash trimmed; the form used in
    /// session keys and derived endpoints.
    pub fn normalized_instance_url(&self) -> String {
        self.instance_url.trim().trim_end_matches('/').to_string()
    }

    /// Absolute REST URL under the instance's `api/v4` prefix.
    pub fn rest_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4/{}",
            self.normalized_instance_url(),
            path.trim_start_matches('/')
        )
    }

    /// WebSocket URL for the workflow service channel: the configured
    /// override, or the endpoint derived from the instance URL by scheme
    /// substitution.
    pub fn socket_url(&self) -> String {
        if let Some(endpoint) = &self.socket_url_override {
            return endpoint.clone();
        }
        let base = self.normalized_instance_url();
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base
        };
        format!("{base}/api/v4/ai/duo_workflows/ws")
    }
}
