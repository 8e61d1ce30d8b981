use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use launch_core::LaunchError;

/// Networks the launch can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Hardhat,
    Sepolia,
    Base,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Hardhat, Network::Sepolia, Network::Base];

    pub fn label(&self) -> &'static str {
        match self {
            Network::Hardhat => "Hardhat Local",
            Network::Sepolia => "Sepolia Testnet",
            Network::Base => "Base Mainnet",
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Hardhat => 31337,
            Network::Sepolia => 11_155_111,
            Network::Base => 8453,
        }
    }

    /// Whether deployments here are public and worth verifying.
    pub fn is_public(&self) -> bool {
        !matches!(self, Network::Hardhat)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Network {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardhat" | "localhost" => Ok(Network::Hardhat),
            "sepolia" => Ok(Network::Sepolia),
            "base" => Ok(Network::Base),
            other => Err(LaunchError::Config(format!(
                "unknown network '{other}' (expected hardhat, sepolia or base)"
            ))),
        }
    }
}

/// Verification endpoint and chain id for one network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub network: Network,
    pub chain_id: u64,
    pub verify_api_url: Option<String>,
}

fn default_verify_api(network: Network) -> Option<&'static str> {
    match network {
        Network::Hardhat => None,
        Network::Sepolia => Some("https://api-sepolia.etherscan.io/api"),
        Network::Base => Some("https://api.basescan.org/api"),
    }
}

/// Per-network verification endpoints with a config override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProfiles {
    profiles: HashMap<Network, NetworkProfile>,
}

impl NetworkProfiles {
    pub fn with_defaults() -> Self {
        let profiles = Network::ALL
            .into_iter()
            .map(|network| {
                let profile = NetworkProfile {
                    network,
                    chain_id: network.chain_id(),
                    verify_api_url: default_verify_api(network).map(str::to_string),
                };
                (network, profile)
            })
            .collect();
        Self { profiles }
    }

    pub fn get(&self, network: Network) -> Option<&NetworkProfile> {
        self.profiles.get(&network)
    }

    /// Override the verification endpoint for a network.
    pub fn set_verify_api(&mut self, network: Network, url: String) -> Result<(), LaunchError> {
        if !validate_url(&url) {
            return Err(LaunchError::Config(format!("invalid verification URL: {url}")));
        }
        if let Some(entry) = self.profiles.get_mut(&network) {
            entry.verify_api_url = Some(url);
        }
        Ok(())
    }
}

impl Default for NetworkProfiles {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A URL is acceptable when it parses, uses HTTP(S), and names a host.
pub fn validate_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            (scheme == "http" || scheme == "https") && parsed.host().is_some()
        }
        Err(_) => false,
    }
}
