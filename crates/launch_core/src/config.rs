use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address::Address;
use crate::error_handler::LaunchError;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub const KEY_NETWORK: &str = "NETWORK";
pub const KEY_VAULT_ADMIN: &str = "VAULT_ADMIN_ADDRESS";
pub const KEY_USDC: &str = "USDC_ADDRESS";
pub const KEY_WETH: &str = "WETH_ADDRESS";
pub const KEY_FEE_TO_SETTER: &str = "FEE_TO_SETTER";
pub const KEY_TOKEN_NAME: &str = "TOKEN_NAME";
pub const KEY_TOKEN_SYMBOL: &str = "TOKEN_SYMBOL";
pub const KEY_TOTAL_SUPPLY: &str = "TOTAL_SUPPLY";
pub const KEY_PRESALE_ALLOCATION: &str = "PRESALE_ALLOCATION";
pub const KEY_LP_REWARD_ALLOCATION: &str = "LP_REWARD_ALLOCATION";
pub const KEY_STAKING_REWARD_ALLOCATION: &str = "STAKING_REWARD_ALLOCATION";
pub const KEY_PRESALE_PRICE: &str = "PRESALE_PRICE";
pub const KEY_PRESALE_VESTING_MONTHS: &str = "PRESALE_VESTING_MONTHS";
pub const KEY_FUNDING_STRATEGY: &str = "FUNDING_STRATEGY";
pub const KEY_VESTING_BENEFICIARIES: &str = "VESTING_BENEFICIARIES";
pub const KEY_VESTING_AMOUNTS: &str = "VESTING_AMOUNTS";
pub const KEY_VESTING_START: &str = "VESTING_START";
pub const KEY_VESTING_CLIFF_SECONDS: &str = "VESTING_CLIFF_SECONDS";
pub const KEY_VESTING_DURATION_SECONDS: &str = "VESTING_DURATION_SECONDS";
pub const KEY_VERIFY_BASE_DELAY_MS: &str = "VERIFY_BASE_DELAY_MS";
pub const KEY_VERIFY_MAX_RETRIES: &str = "VERIFY_MAX_RETRIES";
pub const KEY_VERIFY_INTER_REQUEST_DELAY_MS: &str = "VERIFY_INTER_REQUEST_DELAY_MS";
pub const KEY_VERIFY_API_URL: &str = "VERIFY_API_URL";
pub const KEY_VERIFY_API_KEY: &str = "VERIFY_API_KEY";
pub const KEY_CONFIRMATION_TIMEOUT_SECS: &str = "CONFIRMATION_TIMEOUT_SECS";
pub const KEY_CHECKPOINT_PATH: &str = "CHECKPOINT_PATH";
pub const KEY_LOG_DIR: &str = "LOG_DIR";

/// Every key the schema understands. Environment variables are only read for
/// these names.
pub const KNOWN_KEYS: &[&str] = &[
    KEY_NETWORK,
    KEY_VAULT_ADMIN,
    KEY_USDC,
    KEY_WETH,
    KEY_FEE_TO_SETTER,
    KEY_TOKEN_NAME,
    KEY_TOKEN_SYMBOL,
    KEY_TOTAL_SUPPLY,
    KEY_PRESALE_ALLOCATION,
    KEY_LP_REWARD_ALLOCATION,
    KEY_STAKING_REWARD_ALLOCATION,
    KEY_PRESALE_PRICE,
    KEY_PRESALE_VESTING_MONTHS,
    KEY_FUNDING_STRATEGY,
    KEY_VESTING_BENEFICIARIES,
    KEY_VESTING_AMOUNTS,
    KEY_VESTING_START,
    KEY_VESTING_CLIFF_SECONDS,
    KEY_VESTING_DURATION_SECONDS,
    KEY_VERIFY_BASE_DELAY_MS,
    KEY_VERIFY_MAX_RETRIES,
    KEY_VERIFY_INTER_REQUEST_DELAY_MS,
    KEY_VERIFY_API_URL,
    KEY_VERIFY_API_KEY,
    KEY_CONFIRMATION_TIMEOUT_SECS,
    KEY_CHECKPOINT_PATH,
    KEY_LOG_DIR,
];

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "launch.config.json";

/// One vesting month as used by the presale contracts (30 days).
pub const SECONDS_PER_MONTH: u64 = 2_592_000;

/// Sink names funded by the allocation plan.
pub const SINK_PRESALE: &str = "Presale";
pub const SINK_LP_REWARDS: &str = "LPRewardSink";
pub const SINK_STAKING_REWARDS: &str = "StakingRewardSink";

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

/// How the allocation ledger moves tokens into sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FundingStrategyKind {
    /// Mint the total supply to the holder once, then transfer slices.
    #[default]
    MintThenTransfer,
    /// Mint each slice directly to its sink.
    MintPerSink,
}

impl FromStr for FundingStrategyKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mint-then-transfer" | "transfer" => Ok(Self::MintThenTransfer),
            "mint-per-sink" | "mint" => Ok(Self::MintPerSink),
            other => Err(LaunchError::Config(format!(
                "{KEY_FUNDING_STRATEGY} must be 'mint-then-transfer' or 'mint-per-sink', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for FundingStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MintThenTransfer => f.write_str("mint-then-transfer"),
            Self::MintPerSink => f.write_str("mint-per-sink"),
        }
    }
}

/// Shared vesting batch parameters. Beneficiaries and amounts stay raw here;
/// the batch builder validates them before touching the chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VestingSettings {
    pub beneficiaries: Vec<String>,
    pub amounts: Vec<String>,
    pub start: Option<u64>,
    pub cliff_seconds: u64,
    pub duration_seconds: u64,
}

/// Verification retry policy and endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySettings {
    pub base_delay_ms: u64,
    pub max_retries: u32,
    pub inter_request_delay_ms: u64,
    pub api_url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_retries: 5,
            inter_request_delay_ms: 1_000,
            api_url: None,
            api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// LaunchConfig
// ---------------------------------------------------------------------------

/// Validated launch configuration, built once from a flat key-value set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub network: String,
    pub vault_admin: Address,
    pub payment_token: Option<Address>,
    pub weth: Option<Address>,
    pub fee_to_setter: Address,
    pub token_name: String,
    pub token_symbol: String,
    pub total_supply: String,
    /// Ordered `(sink, decimal amount)` pairs.
    pub allocations: Vec<(String, String)>,
    pub presale_price: String,
    pub presale_vesting_months: u64,
    pub funding_strategy: FundingStrategyKind,
    pub vesting: VestingSettings,
    pub verify: VerifySettings,
    pub confirmation_timeout_secs: u64,
    pub checkpoint_path: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl LaunchConfig {
    /// Returns the base directory: `~/.launch/`
    pub fn base_dir() -> anyhow::Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".launch"))
    }

    /// Returns the default logs directory: `~/.launch/logs/`
    pub fn default_logs_dir() -> anyhow::Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Logs directory, honouring `LOG_DIR` when set.
    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::default_logs_dir(),
        }
    }

    /// Load from the config file (if any) overlaid with environment variables.
    ///
    /// An explicitly passed `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, LaunchError> {
        let file_values = match path {
            Some(p) => read_flat_file(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    read_flat_file(default)?
                } else {
                    debug!("No {DEFAULT_CONFIG_FILE} found, using environment only");
                    BTreeMap::new()
                }
            }
        };
        let env_values: BTreeMap<String, String> = KNOWN_KEYS
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();
        Self::from_sources(file_values, env_values)
    }

    /// Merge file values with environment values (environment wins) and validate.
    pub fn from_sources(
        mut file_values: BTreeMap<String, String>,
        env_values: BTreeMap<String, String>,
    ) -> Result<Self, LaunchError> {
        file_values.extend(env_values);
        Self::from_map(&file_values)
    }

    /// Validate a flat key-value map against the schema.
    pub fn from_map(values: &BTreeMap<String, String>) -> Result<Self, LaunchError> {
        let get = |key: &str| {
            values
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let vault_admin = get(KEY_VAULT_ADMIN)
            .ok_or_else(|| LaunchError::Config(format!("{KEY_VAULT_ADMIN} is required")))
            .and_then(|raw| parse_address(KEY_VAULT_ADMIN, raw))?;
        let payment_token = get(KEY_USDC)
            .map(|raw| parse_address(KEY_USDC, raw))
            .transpose()?;
        let weth = get(KEY_WETH)
            .map(|raw| parse_address(KEY_WETH, raw))
            .transpose()?;
        let fee_to_setter = match get(KEY_FEE_TO_SETTER) {
            Some(raw) => parse_address(KEY_FEE_TO_SETTER, raw)?,
            None => vault_admin.clone(),
        };

        let network = get(KEY_NETWORK).unwrap_or("hardhat").to_ascii_lowercase();

        let mut allocations = vec![
            (
                SINK_PRESALE.to_string(),
                get(KEY_PRESALE_ALLOCATION).unwrap_or("300000000").to_string(),
            ),
            (
                SINK_LP_REWARDS.to_string(),
                get(KEY_LP_REWARD_ALLOCATION)
                    .unwrap_or("1000000000")
                    .to_string(),
            ),
        ];
        if let Some(staking) = get(KEY_STAKING_REWARD_ALLOCATION) {
            allocations.push((SINK_STAKING_REWARDS.to_string(), staking.to_string()));
        }

        let presale_vesting_months = parse_u64(values, KEY_PRESALE_VESTING_MONTHS, 1)?;
        let funding_strategy = match get(KEY_FUNDING_STRATEGY) {
            Some(raw) => raw.parse()?,
            None => FundingStrategyKind::default(),
        };

        let vesting = VestingSettings {
            beneficiaries: split_list(get(KEY_VESTING_BENEFICIARIES)),
            amounts: split_list(get(KEY_VESTING_AMOUNTS)),
            start: get(KEY_VESTING_START).map(parse_timestamp).transpose()?,
            cliff_seconds: parse_u64(values, KEY_VESTING_CLIFF_SECONDS, 0)?,
            duration_seconds: parse_u64(
                values,
                KEY_VESTING_DURATION_SECONDS,
                presale_vesting_months.saturating_mul(SECONDS_PER_MONTH),
            )?,
        };
        if vesting.cliff_seconds > vesting.duration_seconds {
            return Err(LaunchError::Config(format!(
                "{KEY_VESTING_CLIFF_SECONDS} ({}) exceeds {KEY_VESTING_DURATION_SECONDS} ({})",
                vesting.cliff_seconds, vesting.duration_seconds
            )));
        }

        let defaults = VerifySettings::default();
        let verify = VerifySettings {
            base_delay_ms: parse_u64(values, KEY_VERIFY_BASE_DELAY_MS, defaults.base_delay_ms)?,
            max_retries: parse_u64(
                values,
                KEY_VERIFY_MAX_RETRIES,
                u64::from(defaults.max_retries),
            )?
            .try_into()
            .map_err(|_| LaunchError::Config(format!("{KEY_VERIFY_MAX_RETRIES} is too large")))?,
            inter_request_delay_ms: parse_u64(
                values,
                KEY_VERIFY_INTER_REQUEST_DELAY_MS,
                defaults.inter_request_delay_ms,
            )?,
            api_url: get(KEY_VERIFY_API_URL).map(str::to_string),
            api_key: get(KEY_VERIFY_API_KEY).map(str::to_string),
        };

        let checkpoint_path = get(KEY_CHECKPOINT_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("deployments").join(format!("{network}.json")));

        let config = Self {
            network,
            vault_admin,
            payment_token,
            weth,
            fee_to_setter,
            token_name: get(KEY_TOKEN_NAME).unwrap_or("Atlas Token").to_string(),
            token_symbol: get(KEY_TOKEN_SYMBOL).unwrap_or("ATLAS").to_string(),
            total_supply: get(KEY_TOTAL_SUPPLY).unwrap_or("10000000000").to_string(),
            allocations,
            presale_price: get(KEY_PRESALE_PRICE).unwrap_or("50000000").to_string(),
            presale_vesting_months,
            funding_strategy,
            vesting,
            verify,
            confirmation_timeout_secs: parse_u64(values, KEY_CONFIRMATION_TIMEOUT_SECS, 200)?,
            checkpoint_path,
            log_dir: get(KEY_LOG_DIR).map(PathBuf::from),
        };
        info!(
            network = %config.network,
            strategy = %config.funding_strategy,
            "launch config validated"
        );
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read a flat JSON object. Strings, numbers and booleans are accepted as
/// values; anything nested is a configuration error.
fn read_flat_file(path: &Path) -> Result<BTreeMap<String, String>, LaunchError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        LaunchError::Config(format!("Failed to read config {}: {e}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        LaunchError::Config(format!("Failed to parse config {}: {e}", path.display()))
    })?;
    let object = value.as_object().ok_or_else(|| {
        LaunchError::Config(format!("{} must contain a flat JSON object", path.display()))
    })?;

    let mut values = BTreeMap::new();
    for (key, v) in object {
        let flat = match v {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => continue,
            _ => {
                return Err(LaunchError::Config(format!(
                    "config key '{key}' must be a scalar value"
                )));
            }
        };
        values.insert(key.clone(), flat);
    }
    info!("Loaded config from {}", path.display());
    Ok(values)
}

fn parse_address(key: &str, raw: &str) -> Result<Address, LaunchError> {
    Address::parse(raw).map_err(|e| LaunchError::Config(format!("{key}: {e}")))
}

/// Unix seconds or an RFC 3339 timestamp.
fn parse_timestamp(raw: &str) -> Result<u64, LaunchError> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(secs);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp()).ok())
        .ok_or_else(|| {
            LaunchError::Config(format!(
                "{KEY_VESTING_START} must be unix seconds or an RFC 3339 time, got '{raw}'"
            ))
        })
}

fn parse_u64(values: &BTreeMap<String, String>, key: &str, default: u64) -> Result<u64, LaunchError> {
    match values.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| LaunchError::Config(format!("{key} must be a whole number, got '{raw}'"))),
        None => Ok(default),
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|r| {
        r.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
