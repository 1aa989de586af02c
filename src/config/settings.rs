/* yxorp (AGPL-3.0)

Copyright (C) 2025 - yxorp Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration loaders and structures for yxorp.
///
/// These types mirror `config/yxorp.example.toml`. Every field is defaulted, so an
/// empty file (or no file at all) yields a proxy on `0.0.0.0:5050` whose public origin
/// is `http://localhost:5050`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct YxorpConfig {
    /// Listener configuration (bind address and port).
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Proxy behaviour: public origin, landing page, history and rewrite knobs.
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Upstream dialer timeouts.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Telemetry configuration (stdout vs structured log output).
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl YxorpConfig {
    /// Reads the config file, deserializes TOML, and resolves the landing page path
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg: YxorpConfig = toml::from_str(&raw)
            .with_context(|| format!("invalid yxorp config: {}", path.display()))?;

        let base_dir = path.parent();
        if let Some(landing) = cfg.proxy.landing_page.as_mut() {
            Self::absolutize_path(base_dir, landing);
        }

        Ok(cfg)
    }

    /// Public origin to encode against: the configured one, or `http://localhost:<port>`.
    pub fn public_origin(&self) -> String {
        self.proxy
            .public_origin
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.listener.bind_port))
    }

    fn absolutize_path(base_dir: Option<&Path>, target: &mut PathBuf) {
        if target.is_relative() {
            if let Some(dir) = base_dir {
                *target = dir.join(&*target);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_bind_port() -> u16 {
    5050
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Origin browsers use to reach the proxy. Falls back to `http://localhost:<port>`.
    #[serde(default)]
    pub public_origin: Option<String>,
    /// HTML served on `/`. The built-in page is used when unset.
    #[serde(default)]
    pub landing_page: Option<PathBuf>,
    /// Seconds a client's last target stays usable for relative-path repair and retries.
    #[serde(default = "default_history_timeout_secs")]
    pub history_timeout_secs: u64,
    /// Enables the domain-comparison rewrite inside script literals.
    #[serde(default = "default_true")]
    pub script_heuristics: bool,
    /// Upper bound for buffered request and response bodies. Unlimited when unset.
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            public_origin: None,
            landing_page: None,
            history_timeout_secs: default_history_timeout_secs(),
            script_heuristics: true,
            max_body_bytes: None,
        }
    }
}

impl ProxyConfig {
    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }
}

fn default_history_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_tls_handshake_timeout_secs")]
    pub tls_handshake_timeout_secs: u64,
    /// Covers writing the request and reading the whole response.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            tls_handshake_timeout_secs: default_tls_handshake_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_tls_handshake_timeout_secs() -> u64 {
    10
}

fn default_response_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Route flow events through `tracing`.
    #[default]
    Stdout,
    /// Print one JSON object per flow event.
    Json,
}
