//! Durable per-network checkpoint.
//!
//! One JSON document per network. Module records live at the top level keyed
//! by module name; funding and vesting progress live under reserved `__` keys.
//! Every write re-reads the file, merges, and replaces it atomically, so a
//! crash leaves either the old or the new document and never a partial one.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use launch_chain::InitArgs;
use launch_core::{Address, LaunchError};

use crate::registry::ModuleKind;

/// Amounts are stored as decimal strings so that readers with 53-bit
/// numbers do not lose precision.
mod units_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RecordRepr")]
pub struct DeploymentRecord {
    #[serde(skip)]
    pub module_name: String,
    pub address: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation_address: Option<Address>,
    pub kind: ModuleKind,
    pub args: InitArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

impl DeploymentRecord {
    pub fn new(module_name: impl Into<String>, address: Address, kind: ModuleKind) -> Self {
        Self {
            module_name: module_name.into(),
            address,
            implementation_address: None,
            kind,
            args: Vec::new(),
            deployed_at: Some(Utc::now()),
        }
    }

    pub fn with_implementation(mut self, implementation: Option<Address>) -> Self {
        self.implementation_address = implementation;
        self
    }

    pub fn with_args(mut self, args: InitArgs) -> Self {
        self.args = args;
        self
    }
}

/// Older checkpoints store a bare address string per module.
#[derive(Deserialize)]
#[serde(untagged)]
enum RecordRepr {
    Bare(Address),
    Full(RecordFields),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordFields {
    address: Address,
    #[serde(default)]
    implementation_address: Option<Address>,
    #[serde(default)]
    kind: ModuleKind,
    #[serde(default)]
    args: InitArgs,
    #[serde(default)]
    deployed_at: Option<DateTime<Utc>>,
}

impl From<RecordRepr> for DeploymentRecord {
    fn from(repr: RecordRepr) -> Self {
        match repr {
            RecordRepr::Bare(address) => Self {
                module_name: String::new(),
                address,
                implementation_address: None,
                kind: ModuleKind::Simple,
                args: Vec::new(),
                deployed_at: None,
            },
            RecordRepr::Full(f) => Self {
                module_name: String::new(),
                address: f.address,
                implementation_address: f.implementation_address,
                kind: f.kind,
                args: f.args,
                deployed_at: f.deployed_at,
            },
        }
    }
}

/// A sink that has received its allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundedMark {
    pub sink_address: Address,
    #[serde(with = "units_string")]
    pub units: u128,
    pub tx_hash: String,
    pub funded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingState {
    /// Set once the mint-then-transfer supply mint is confirmed.
    #[serde(default)]
    pub supply_minted: bool,
    /// Hash of a supply mint that was sent but not yet seen confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_supply_mint: Option<String>,
    #[serde(default)]
    pub sinks: BTreeMap<String, FundedMark>,
}

impl FundingState {
    pub fn is_empty(&self) -> bool {
        !self.supply_minted && self.pending_supply_mint.is_none() && self.sinks.is_empty()
    }
}

/// One schedule confirmed on chain for a beneficiary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VestingMark {
    #[serde(with = "units_string")]
    pub units: u128,
    pub start: u64,
    pub cliff_seconds: u64,
    pub duration_seconds: u64,
    pub tx_hash: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Full on-disk document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    #[serde(rename = "__funding", default, skip_serializing_if = "FundingState::is_empty")]
    pub funding: FundingState,
    /// Beneficiary address -> schedules, in submission order.
    #[serde(rename = "__vesting", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vesting: BTreeMap<String, Vec<VestingMark>>,
    #[serde(flatten)]
    pub modules: BTreeMap<String, DeploymentRecord>,
}

impl CheckpointData {
    fn fill_names(&mut self) {
        for (name, record) in self.modules.iter_mut() {
            record.module_name = name.clone();
        }
    }
}

/// Checkpoint store bound to one file.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    data: CheckpointData,
}

impl Checkpoint {
    /// Open the checkpoint at `path`. A missing file is an empty checkpoint.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LaunchError> {
        let path = path.into();
        let data = read_data(&path)?;
        debug!(path = %path.display(), modules = data.modules.len(), "checkpoint opened");
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing the cached view.
    pub fn load(&mut self) -> Result<&CheckpointData, LaunchError> {
        self.data = read_data(&self.path)?;
        Ok(&self.data)
    }

    pub fn data(&self) -> &CheckpointData {
        &self.data
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.modules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&DeploymentRecord, LaunchError> {
        self.data
            .modules
            .get(name)
            .ok_or_else(|| LaunchError::NotFound(name.to_string()))
    }

    pub fn address_of(&self, name: &str) -> Result<Address, LaunchError> {
        self.get(name).map(|r| r.address.clone())
    }

    pub fn modules(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.data.modules.values()
    }

    pub fn funding(&self) -> &FundingState {
        &self.data.funding
    }

    pub fn vesting(&self) -> &BTreeMap<String, Vec<VestingMark>> {
        &self.data.vesting
    }

    /// Units locked by every recorded schedule.
    pub fn vesting_units(&self) -> u128 {
        self.data
            .vesting
            .values()
            .flatten()
            .map(|mark| mark.units)
            .sum()
    }

    /// Record a deployment. Fails if the module is already recorded at a
    /// different address; re-recording the same address is a no-op.
    pub fn put(&mut self, record: DeploymentRecord) -> Result<(), LaunchError> {
        self.put_inner(record, false)
    }

    /// Record a deployment, replacing any existing entry.
    pub fn put_forced(&mut self, record: DeploymentRecord) -> Result<(), LaunchError> {
        self.put_inner(record, true)
    }

    fn put_inner(&mut self, record: DeploymentRecord, force: bool) -> Result<(), LaunchError> {
        let name = record.module_name.clone();
        if name.starts_with(crate::registry::RESERVED_PREFIX) || name.is_empty() {
            return Err(LaunchError::Storage(format!(
                "refusing to record module under reserved key '{name}'"
            )));
        }
        self.update(|data| {
            if let Some(existing) = data.modules.get(&name) {
                if existing.address != record.address && !force {
                    return Err(LaunchError::CheckpointConflict {
                        module: name.clone(),
                        recorded: existing.address.to_string(),
                        attempted: record.address.to_string(),
                    });
                }
                if existing.address == record.address && !force {
                    return Ok(false);
                }
            }
            info!(module = %name, address = %record.address, forced = force, "checkpoint recorded");
            data.modules.insert(name.clone(), record);
            Ok(true)
        })
    }

    /// Mutate the funding section and persist it.
    pub fn update_funding<F>(&mut self, change: F) -> Result<(), LaunchError>
    where
        F: FnOnce(&mut FundingState),
    {
        self.update(|data| {
            change(&mut data.funding);
            Ok(true)
        })
    }

    /// Record confirmed vesting schedules. A beneficiary scheduled again keeps
    /// its earlier marks.
    pub fn record_vesting(
        &mut self,
        marks: impl IntoIterator<Item = (Address, VestingMark)>,
    ) -> Result<(), LaunchError> {
        let marks: Vec<(Address, VestingMark)> = marks.into_iter().collect();
        self.update(|data| {
            for (beneficiary, mark) in marks {
                data.vesting.entry(beneficiary.to_string()).or_default().push(mark);
            }
            Ok(true)
        })
    }

    /// Read-merge-write. `change` returns whether anything needs writing.
    fn update<F>(&mut self, change: F) -> Result<(), LaunchError>
    where
        F: FnOnce(&mut CheckpointData) -> Result<bool, LaunchError>,
    {
        let mut latest = read_data(&self.path)?;
        if change(&mut latest)? {
            write_atomic(&self.path, &latest)?;
        }
        self.data = latest;
        Ok(())
    }
}

fn read_data(path: &Path) -> Result<CheckpointData, LaunchError> {
    if !path.exists() {
        return Ok(CheckpointData::default());
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(CheckpointData::default());
    }
    let mut data: CheckpointData = serde_json::from_str(&content).map_err(|e| {
        LaunchError::Storage(format!("corrupt checkpoint {}: {e}", path.display()))
    })?;
    data.fill_names();
    Ok(data)
}

fn write_atomic(path: &Path, data: &CheckpointData) -> Result<(), LaunchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(data)?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
