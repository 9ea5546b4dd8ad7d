//! Agent configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `ALPHA_API_URL` | `https://x402.911fund.io` |
//! | `ALPHA_BUDGET_CEILING_ATOMIC` | `1000000` (1 USDC) |
//! | `ALPHA_BUDGET_WINDOW_SECS` | `86400` |
//! | `ALPHA_SIGNER_CMD` | unset: probe-only |
//! | `ALPHA_SIGNER_TIMEOUT_SECS` | `30` |
//! | `ALPHA_QUOTE_SELECTION` | `first` or `cheapest` |
//! | `ALPHA_ALLOWED_NETWORKS` | unset: any network |

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::api::DEFAULT_BASE_URL;
use crate::payment::{Cheapest, CommandSigner, FirstListed, NetworkAllowlist, QuoteSelector};

const DEFAULT_CEILING_ATOMIC: u64 = 1_000_000;
const DEFAULT_WINDOW_SECS: u64 = 86_400;
const DEFAULT_SIGNER_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuoteSelection {
    #[default]
    First,
    Cheapest,
}

impl FromStr for QuoteSelection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(Self::First),
            "cheapest" => Ok(Self::Cheapest),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub api_url: String,
    pub budget_ceiling_atomic: u64,
    pub budget_window: Duration,
    /// External signer command line, split on whitespace
    pub signer_cmd: Option<String>,
    pub signer_timeout: Duration,
    pub quote_selection: QuoteSelection,
    /// Empty means any network
    pub allowed_networks: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_BASE_URL.to_string(),
            budget_ceiling_atomic: DEFAULT_CEILING_ATOMIC,
            budget_window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            signer_cmd: None,
            signer_timeout: Duration::from_secs(DEFAULT_SIGNER_TIMEOUT_SECS),
            quote_selection: QuoteSelection::First,
            allowed_networks: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset or blank values keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            api_url: get("ALPHA_API_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            budget_ceiling_atomic: parse_var(&get, "ALPHA_BUDGET_CEILING_ATOMIC")?
                .unwrap_or(defaults.budget_ceiling_atomic),
            budget_window: parse_var::<u64>(&get, "ALPHA_BUDGET_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.budget_window),
            signer_cmd: get("ALPHA_SIGNER_CMD"),
            signer_timeout: parse_var::<u64>(&get, "ALPHA_SIGNER_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.signer_timeout),
            quote_selection: parse_var(&get, "ALPHA_QUOTE_SELECTION")?.unwrap_or_default(),
            allowed_networks: get("ALPHA_ALLOWED_NETWORKS")
                .map(|v| {
                    v.split(',')
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn selector(&self) -> Arc<dyn QuoteSelector> {
        match (self.quote_selection, self.allowed_networks.is_empty()) {
            (QuoteSelection::First, true) => Arc::new(FirstListed),
            (QuoteSelection::Cheapest, true) => Arc::new(Cheapest),
            (QuoteSelection::First, false) => Arc::new(NetworkAllowlist {
                networks: self.allowed_networks.clone(),
                inner: FirstListed,
            }),
            (QuoteSelection::Cheapest, false) => Arc::new(NetworkAllowlist {
                networks: self.allowed_networks.clone(),
                inner: Cheapest,
            }),
        }
    }

    /// `None` when no signer command is configured
    pub fn signer(&self) -> Option<CommandSigner> {
        let mut parts = self.signer_cmd.as_deref()?.split_whitespace();
        let program = parts.next()?;
        Some(CommandSigner::new(
            program,
            parts.map(str::to_string).collect(),
            self.signer_timeout,
        ))
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| value.parse::<T>().map_err(|_| ConfigError::Invalid { var, value }))
        .transpose()
}
