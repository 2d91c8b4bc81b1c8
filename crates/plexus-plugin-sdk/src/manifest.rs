use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    hooks::{discover_implemented, MethodSignature, HOOK_INTERFACE},
    rpc::TransportKind,
};

/// Manifest file expected at the root of every plugin bundle.
pub const MANIFEST_FILE: &str = "plugin.json";

/// On-disk JSON manifest located next to each plugin executable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// Relative to the bundle directory.
    pub executable: Option<String>,
    pub transport: TransportKind,
    /// Method signatures the plugin claims to provide.
    pub hooks: Option<Vec<MethodSignature>>,
    /// Handed to the plugin through `LoadPluginConfiguration`.
    pub settings: Map<String, Value>,
}

impl PluginManifest {
    pub fn load(bundle_dir: &Path) -> Result<Self> {
        let path = bundle_dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn validate(&self) -> Result<semver::Version> {
        if self.id.is_empty() {
            bail!("plugin id must not be empty");
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            bail!("plugin id `{}` may only contain letters, digits, '.', '-' and '_'", self.id);
        }
        if self.executable.as_deref().map_or(true, str::is_empty) {
            bail!("plugin `{}` does not name an executable", self.id);
        }
        semver::Version::parse(&self.version)
            .with_context(|| format!("plugin `{}` has invalid version `{}`", self.id, self.version))
    }

    /// [`PluginManifest::validate`] plus a check that the executable is a
    /// file inside `bundle_dir`.
    pub fn validate_bundle(&self, bundle_dir: &Path) -> Result<semver::Version> {
        let version = self.validate()?;
        match self.executable_path(bundle_dir) {
            Some(exe) if exe.is_file() => Ok(version),
            Some(exe) => bail!("plugin `{}` executable {} not found", self.id, exe.display()),
            None => bail!("plugin `{}` does not name an executable", self.id),
        }
    }

    pub fn executable_path(&self, bundle_dir: &Path) -> Option<PathBuf> {
        self.executable.as_ref().map(|exe| bundle_dir.join(exe))
    }

    /// Hooks whose declared signature matches the hook interface, or `None`
    /// when the manifest declares nothing.
    pub fn declared_hooks(&self) -> Option<Vec<&'static str>> {
        self.hooks
            .as_deref()
            .map(|methods| discover_implemented(methods, HOOK_INTERFACE))
    }
}
