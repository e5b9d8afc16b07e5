// src/config.rs
//! Parsed configuration handed to the core.
//!
//! The text parser lives outside the core; what arrives here are the
//! typed results: interface defaults, filter lists, authentication
//! parameters and the DSCP enablement list. A failed validation
//! rejects the whole configuration so the previous one stays in force.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::Filters;
use crate::interface::InterfaceConfig;
use crate::tos::TrafficClass;
use crate::util::RouterId;

/// Verdicts of the external configuration parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    Done,
    Quit,
    Dump,
    Monitor,
    Unmonitor,
    No,
}

/// HMAC suite used by the external authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthType {
    #[default]
    None,
    Sha256,
    Blake2s128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_type: AuthType,
    /// Raw keys, indexed by key-id.
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("interface {0:?} configured twice")]
    DuplicateInterface(String),
    #[error("hello interval must be positive on {0:?}")]
    ZeroHelloInterval(String),
    #[error("rtt-max must exceed rtt-min on {0:?}")]
    InvertedRttWindow(String),
    #[error("authentication keys required for {0:?}")]
    MissingKeys(String),
    #[error("DSCP codepoint 0x{0:02x} is not classifiable")]
    UnknownDscp(u8),
}

/// The whole parsed configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Persisted router-id, if the operator pinned one.
    pub router_id: Option<RouterId>,
    /// Defaults applied to interfaces without an explicit section.
    pub default_interface: InterfaceConfig,
    /// Per-interface overrides, by name.
    pub interfaces: HashMap<String, InterfaceConfig>,
    pub filters: Filters,
    pub auth: AuthConfig,
    /// DSCP codepoints the daemon advertises qualified routes for.
    pub dscp_values: Vec<u8>,
}

impl Config {
    /// Resolve the effective configuration for a named interface.
    pub fn interface(&self, name: &str) -> InterfaceConfig {
        self.interfaces
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_interface.clone())
    }

    /// Reject inconsistent configurations as a whole.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, conf) in std::iter::once(("default", &self.default_interface))
            .chain(self.interfaces.iter().map(|(n, c)| (n.as_str(), c)))
        {
            if conf.hello_interval_ms == 0 {
                return Err(ConfigError::ZeroHelloInterval(name.to_string()));
            }
            if conf.max_rtt_penalty > 0 && conf.rtt_max <= conf.rtt_min {
                return Err(ConfigError::InvertedRttWindow(name.to_string()));
            }
        }
        if self.auth.auth_type != AuthType::None && self.auth.keys.is_empty() {
            return Err(ConfigError::MissingKeys(format!("{:?}", self.auth.auth_type)));
        }
        for &dscp in &self.dscp_values {
            // Only table codepoints may be enabled; DF is implicit.
            if TrafficClass::classify(dscp) == TrafficClass::Default && dscp != 0 {
                return Err(ConfigError::UnknownDscp(dscp));
            }
        }
        Ok(())
    }
}
