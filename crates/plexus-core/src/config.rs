use std::{collections::HashSet, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub listeners: Vec<Listener>,
    pub plugins: PluginSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Listener {
    pub name: String,
    pub bind: String,
    pub tls: Option<Tls>,
    pub http: Option<HttpTweaks>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tls {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HttpTweaks {
    /// Overrides `plugins.request_timeout_secs` for this listener.
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Directory holding one sub-directory per plugin bundle.
    pub directory: String,
    /// Plugin ids to load; empty loads every bundle found.
    pub enable: Vec<String>,
    pub call_timeout_secs: u64,
    pub accept_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            directory: "plugins".into(),
            enable: Vec::new(),
            call_timeout_secs: 30,
            accept_timeout_secs: 5,
            request_timeout_secs: 60,
            max_consecutive_failures: 3,
        }
    }
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.listeners.is_empty() {
            bail!("at least one listener is required");
        }
        let mut listener_names = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !listener_names.insert(listener.name.clone()) {
                bail!("duplicate listener name `{}`", listener.name);
            }
        }
        self.plugins.validate()
    }

    /// Returns parsed listeners with ready-to-bind socket addresses.
    pub fn resolved_listeners(&self) -> Result<Vec<ResolvedListener>> {
        self.listeners
            .iter()
            .map(|listener| ResolvedListener::resolve(listener, &self.plugins))
            .collect()
    }

    /// A commented starting point for `plexus config example`.
    pub fn example() -> &'static str {
        r#"[[listeners]]
name = "public"
bind = ":8065"

# [listeners.tls]
# cert = "/etc/plexus/cert.pem"
# key = "/etc/plexus/key.pem"

# [listeners.http]
# request_timeout_secs = 30

[plugins]
directory = "${PLEXUS_PLUGIN_DIR:./plugins}"
enable = []
call_timeout_secs = 30
accept_timeout_secs = 5
request_timeout_secs = 60
max_consecutive_failures = 3
"#
    }
}

/// Runtime representation of a listener with parsed socket/tls config.
#[derive(Debug, Clone)]
pub struct ResolvedListener {
    pub name: String,
    pub addr: SocketAddr,
    pub tls: Option<Tls>,
    pub request_timeout: Duration,
}

impl ResolvedListener {
    fn resolve(listener: &Listener, plugins: &PluginSettings) -> Result<Self> {
        let addr = listener.parse_bind_addr()?;
        let secs = listener
            .http
            .as_ref()
            .and_then(|http| http.request_timeout_secs)
            .unwrap_or(plugins.request_timeout_secs);
        Ok(Self {
            name: listener.name.clone(),
            addr,
            tls: listener.tls.clone(),
            request_timeout: Duration::from_secs(secs),
        })
    }
}

impl Listener {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("listener name must not be empty");
        }
        self.parse_bind_addr()
            .with_context(|| format!("invalid bind address for listener `{}`", self.name))?;
        if let Some(tls) = &self.tls {
            tls.validate()
                .with_context(|| format!("listener `{}` has incomplete tls settings", self.name))?;
        }
        if let Some(0) = self.http.as_ref().and_then(|http| http.request_timeout_secs) {
            bail!("listener `{}` request_timeout_secs must be positive", self.name);
        }
        Ok(())
    }

    pub fn parse_bind_addr(&self) -> Result<SocketAddr> {
        if self.bind.starts_with(':') {
            let addr = format!("0.0.0.0{}", self.bind);
            Ok(SocketAddr::from_str(&addr)?)
        } else {
            Ok(SocketAddr::from_str(&self.bind)?)
        }
    }
}

impl Tls {
    pub fn validate(&self) -> Result<()> {
        if self.cert.trim().is_empty() || self.key.trim().is_empty() {
            bail!("tls cert and key paths must be provided");
        }
        Ok(())
    }
}

impl PluginSettings {
    pub fn validate(&self) -> Result<()> {
        if self.directory.trim().is_empty() {
            bail!("plugins.directory must not be empty");
        }
        for (name, value) in [
            ("call_timeout_secs", self.call_timeout_secs),
            ("accept_timeout_secs", self.accept_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                bail!("plugins.{name} must be positive");
            }
        }
        if self.max_consecutive_failures == 0 {
            bail!("plugins.max_consecutive_failures must be at least 1");
        }
        let mut seen = HashSet::new();
        for id in &self.enable {
            if !seen.insert(id.as_str()) {
                bail!("plugin `{id}` is enabled twice");
            }
        }
        Ok(())
    }

    pub fn directory(&self) -> PathBuf {
        PathBuf::from(&self.directory)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    /// Whether `id` passes the `enable` allow-list.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.enable.is_empty() || self.enable.iter().any(|enabled| enabled == id)
    }
}
