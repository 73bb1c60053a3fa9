use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::http::parser::ParseLimits;

/// Environment variable naming a YAML configuration file.
pub const CONFIG_ENV: &str = "BEACON_CONFIG";
/// Environment variable overriding `listen_addr`.
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Directory served by the built-in site. Nothing is served when unset.
    pub document_root: Option<PathBuf>,
    /// Files tried, in order, when a directory is requested.
    pub index_files: Vec<String>,
    pub limits: Limits,
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_header_line_length: usize,
    pub max_header_lines: usize,
    /// Read buffer of each file response.
    pub file_buffer_size: usize,
    /// Largest slice pulled from a response per socket write.
    pub write_chunk_size: usize,
    /// Request bodies up to this size are kept on the request message.
    pub max_buffered_body: u64,
    pub max_websocket_frame: usize,
    /// Consecutive rejected requests tolerated before the connection closes.
    pub max_consecutive_errors: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub realm: String,
    /// Digest when true, Basic otherwise.
    pub digest: bool,
    /// Path prefixes that require credentials.
    pub protected_paths: Vec<String>,
    pub users: HashMap<String, String>,
    /// Seconds a digest nonce stays valid after its challenge.
    pub nonce_lifetime_secs: u64,
    pub max_nonces: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            document_root: None,
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
            limits: Limits::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_line_length: 8190,
            max_header_lines: 100,
            file_buffer_size: crate::http::file::DEFAULT_BUFFER_SIZE,
            write_chunk_size: 256 * 1024,
            max_buffered_body: 1024 * 1024,
            max_websocket_frame: 1024 * 1024,
            max_consecutive_errors: 3,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            realm: "defaultRealm@host.com".to_string(),
            digest: true,
            protected_paths: Vec::new(),
            users: HashMap::new(),
            nonce_lifetime_secs: crate::http::auth::DEFAULT_NONCE_LIFETIME.as_secs(),
            max_nonces: crate::http::auth::DEFAULT_MAX_NONCES,
        }
    }
}

impl Limits {
    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_line_length: self.max_header_line_length,
            max_header_lines: self.max_header_lines,
        }
    }
}

impl AuthConfig {
    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }
}

impl Config {
    /// Loads the file named by `BEACON_CONFIG` if set, then applies the
    /// `LISTEN` override. A missing or broken file falls back to defaults.
    pub fn load() -> Self {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path, error = %e, "Using default configuration");
                Self::default()
            }),
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var(LISTEN_ENV) {
            cfg.listen_addr = listen_addr;
        }

        cfg
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("invalid configuration")
    }
}
