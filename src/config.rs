//! Configuration loading for the server and client binaries.
//!
//! Both sides are configured by a JSON file whose key spelling is part of the
//! deployed format and must not change.

use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Server-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port the control listener binds on.
    #[serde(rename = "InternalDataPort")]
    pub internal_data_port: u16,
    /// Allowed public port range, written `"MIN-MAX"`.
    #[serde(rename = "AllowedPortRange")]
    pub allowed_port_range: String,
    /// Maximum live forwards per client session.
    #[serde(rename = "MaxPortsPerClient")]
    pub max_ports_per_client: u32,
    /// Shared key clients must present in `auth`.
    #[serde(rename = "Key")]
    pub key: String,
}

impl ServerConfig {
    /// Load and validate a server config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Parse and validate a server config from its JSON text.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("invalid server config")?;
        config.port_range()?;
        Ok(config)
    }

    /// Parse `AllowedPortRange` into an inclusive range.
    pub fn port_range(&self) -> Result<RangeInclusive<u16>> {
        let raw = &self.allowed_port_range;
        let Some((min, max)) = raw.split_once('-') else {
            bail!("invalid port range format {raw:?}");
        };
        let min: u16 = min
            .parse()
            .with_context(|| format!("invalid port range format {raw:?}"))?;
        let max: u16 = max
            .parse()
            .with_context(|| format!("invalid port range format {raw:?}"))?;
        if min < 1 || min >= max {
            bail!("invalid port range values {raw:?}");
        }
        Ok(min..=max)
    }
}

/// One requested forward: bind `target_port` publicly on the server and relay
/// each connection accepted there to `forward_domain:forward_port`.
#[derive(Debug, Clone)]
pub struct ForwardSpec {
    pub forward_domain: String,
    pub forward_port: u16,
    pub target_port: u16,
    pub mode: String,
}

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the server's control listener.
    pub server_domain: String,
    pub server_port: u16,
    /// Shared key presented in `auth`.
    pub key: String,
    /// Forwards requested after authentication.
    pub forwards: Vec<ForwardSpec>,
}

#[derive(Deserialize)]
struct RawClientConfig {
    #[serde(rename = "ServerDomain")]
    server_domain: String,
    #[serde(rename = "ServerPort")]
    server_port: u16,
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Forwards", default)]
    forwards: Vec<RawForward>,
}

#[derive(Deserialize)]
struct RawForward {
    #[serde(default = "default_forward_domain")]
    forward_domain: String,
    #[serde(default)]
    forward_port: Option<u16>,
    #[serde(default)]
    target_port: Option<u16>,
    #[serde(default = "default_mode")]
    mode: String,
}

fn default_forward_domain() -> String {
    "127.0.0.1".to_string()
}

fn default_mode() -> String {
    "TCP".to_string()
}

impl ClientConfig {
    /// Load and validate a client config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Parse and validate a client config from its JSON text.
    ///
    /// Forward entries missing `forward_port` or `target_port` are skipped
    /// with a warning. Duplicate `target_port` values are fatal: the server
    /// correlates `forward_response` by target port alone, so a duplicate
    /// would be ambiguous.
    pub fn from_json(raw: &str) -> Result<Self> {
        let raw: RawClientConfig = serde_json::from_str(raw).context("invalid client config")?;

        let mut forwards = Vec::new();
        for entry in raw.forwards {
            let (Some(forward_port), Some(target_port)) = (entry.forward_port, entry.target_port)
            else {
                warn!("skipping forward with missing forward_port or target_port");
                continue;
            };
            forwards.push(ForwardSpec {
                forward_domain: entry.forward_domain,
                forward_port,
                target_port,
                mode: entry.mode,
            });
        }

        let mut seen = HashSet::new();
        for spec in &forwards {
            if !seen.insert(spec.target_port) {
                bail!("duplicate target_port {} in forwards", spec.target_port);
            }
        }

        Ok(ClientConfig {
            server_domain: raw.server_domain,
            server_port: raw.server_port,
            key: raw.key,
            forwards,
        })
    }
}
