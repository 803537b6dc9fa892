//! Purpose: Client identity, credentials, and endpoint configuration.
//! Exports: `ClientConfig`, `DEFAULT_SERVER`, `DEFAULT_PORT`, `DEFAULT_RESUBSCRIBE_BACKOFF_MS`.
//! Role: Immutable inputs the caller sets before any operation.
//! Invariants: Operations refuse to run while the project id or token is blank.
//! Invariants: The literal server name `DEFAULT` resolves to the maintained deployment.
use crate::core::error::{ClientResult, Error, ErrorKind};
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SERVER: &str = "clouddb.appinventor.mit.edu";
pub const DEFAULT_PORT: u16 = 6381;
pub const DEFAULT_RESUBSCRIBE_BACKOFF_MS: u64 = 3_000;

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub project_id: String,
    pub token: String,
    pub resubscribe_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT,
            use_tls: true,
            project_id: String::new(),
            token: String::new(),
            resubscribe_backoff_ms: DEFAULT_RESUBSCRIBE_BACKOFF_MS,
        }
    }
}

impl ClientConfig {
    pub fn new(project_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    /// Parse `redis://host[:port]` or `rediss://host[:port]`. The scheme picks TLS.
    pub fn from_url(input: &str) -> ClientResult<Self> {
        let url = Url::parse(input).map_err(|err| {
            Error::new(ErrorKind::Configuration)
                .with_message(format!("invalid server url: {input}"))
                .with_hint("Use redis://host:port or rediss://host:port.")
                .with_source(err)
        })?;
        let use_tls = match url.scheme() {
            "redis" => false,
            "rediss" => true,
            other => {
                return Err(Error::new(ErrorKind::Configuration)
                    .with_message(format!("unsupported url scheme: {other}"))
                    .with_hint("Use redis://host:port or rediss://host:port."));
            }
        };
        let host = url.host_str().filter(|host| !host.is_empty()).ok_or_else(|| {
            Error::new(ErrorKind::Configuration).with_message(format!("server url has no host: {input}"))
        })?;
        let mut config = Self {
            server: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
            use_tls,
            ..Self::default()
        };
        // redis://:token@host carries the token as the password.
        if let Some(password) = url.password().filter(|password| !password.is_empty()) {
            config.token = password.to_string();
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ClientResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Configuration)
                .with_message(format!("failed to read config {}", path.display()))
                .with_source(err)
        })?;
        serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Configuration)
                .with_message(format!("invalid config {}: {err}", path.display()))
                .with_hint("Config files are JSON objects with keys like \"project_id\" and \"token\".")
        })
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("project id is not set")
                .with_hint("Set a project id before using the client."));
        }
        if self.token.trim().is_empty() {
            return Err(Error::new(ErrorKind::Configuration)
                .with_message("access token is not set")
                .with_hint("Set the project token before using the client."));
        }
        if self.port == 0 {
            return Err(Error::new(ErrorKind::Configuration).with_message("port must be non-zero"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: resolve_server(&self.server),
            port: self.port,
            tls: self.use_tls,
        }
    }

    pub fn resubscribe_backoff(&self) -> Duration {
        Duration::from_millis(self.resubscribe_backoff_ms)
    }
}

pub(crate) fn resolve_server(server: &str) -> String {
    let trimmed = server.trim();
    if trimmed.is_empty() || trimmed == "DEFAULT" {
        DEFAULT_SERVER.to_string()
    } else {
        trimmed.to_string()
    }
}
