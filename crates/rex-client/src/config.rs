//! Target definitions at `~/.rex/targets.toml`.
//!
//! ```toml
//! [[target]]
//! name = "web"
//! host = "10.0.0.5"
//! user = "deploy"
//! password = "hunter2"
//! host_key = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use rex_core::error::{RexError, RexResult};
use rex_core::hostkey::HostKeyPolicy;
use rex_core::transport::Authorizer;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExConfig {
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

/// How to reach and authenticate against one target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Unique name of the target within an [`Ex`](crate::Ex).
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Shorthand for a single password authorizer.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth: Vec<Authorizer>,
    /// `"insecure"` or `"sha256:<hex>"`. Required to connect.
    #[serde(default)]
    pub host_key: Option<HostKeyPolicy>,
}

fn default_port() -> u16 {
    22
}

impl TargetConfig {
    /// All configured authorizers, the `password` shorthand first.
    pub fn authorizers(&self) -> Vec<Authorizer> {
        self.password
            .iter()
            .map(Authorizer::password)
            .chain(self.auth.iter().cloned())
            .collect()
    }

    /// The `host:port` address, with IPv6 hosts bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl ExConfig {
    /// `~/.rex/targets.toml`.
    pub fn default_path() -> RexResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| RexError::Config("cannot determine home directory".into()))?;
        Ok(home.join(".rex").join("targets.toml"))
    }

    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: impl AsRef<Path>) -> RexResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| RexError::Config(format!("{}: {e}", path.display())))?;

        debug!(path = %path.display(), targets = config.targets.len(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> RexResult<Self> {
        let config: ExConfig =
            toml::from_str(content).map_err(|e| RexError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> RexResult<()> {
        for (i, target) in self.targets.iter().enumerate() {
            if target.name.is_empty() {
                return Err(RexError::Config(format!("target #{i} has no name")));
            }
            if self.targets[..i].iter().any(|t| t.name == target.name) {
                return Err(RexError::Config(format!(
                    "duplicate target name: {}",
                    target.name
                )));
            }
        }
        Ok(())
    }
}
