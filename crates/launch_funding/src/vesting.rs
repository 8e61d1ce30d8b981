//! Vesting schedules, validated as a batch and submitted atomically.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use launch_chain::{BatchCall, ChainClient, confirm_within};
use launch_core::{Address, LaunchError, VestingSettings};
use launch_deploy::{Checkpoint, VestingMark};

use crate::units::{DEFAULT_DECIMALS, parse_units};

pub const CREATE_SCHEDULE_METHOD: &str = "createVestingSchedule";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingSchedule {
    pub beneficiary: Address,
    pub units: u128,
    pub start: u64,
    pub cliff_seconds: u64,
    pub duration_seconds: u64,
}

impl VestingSchedule {
    fn to_call(&self) -> BatchCall {
        BatchCall {
            method: CREATE_SCHEDULE_METHOD.to_string(),
            args: vec![
                json!(self.beneficiary.as_str()),
                json!(self.units.to_string()),
                json!(self.start),
                json!(self.cliff_seconds),
                json!(self.duration_seconds),
            ],
        }
    }
}

/// Validated schedules plus their total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VestingBatch {
    pub schedules: Vec<VestingSchedule>,
    pub total_units: u128,
}

impl VestingBatch {
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}

/// Collects raw beneficiary/amount lists and validates them before any
/// chain interaction.
#[derive(Debug, Clone)]
pub struct VestingBatchBuilder {
    beneficiaries: Vec<String>,
    amounts: Vec<String>,
    start: u64,
    cliff_seconds: u64,
    duration_seconds: u64,
    decimals: u8,
    allow_duplicates: bool,
}

impl VestingBatchBuilder {
    pub fn new(beneficiaries: Vec<String>, amounts: Vec<String>) -> Self {
        Self {
            beneficiaries,
            amounts,
            start: Utc::now().timestamp().max(0) as u64,
            cliff_seconds: 0,
            duration_seconds: 0,
            decimals: DEFAULT_DECIMALS,
            allow_duplicates: false,
        }
    }

    pub fn from_settings(settings: &VestingSettings) -> Self {
        let builder = Self::new(settings.beneficiaries.clone(), settings.amounts.clone());
        let start = settings.start.unwrap_or(builder.start);
        builder.with_schedule(start, settings.cliff_seconds, settings.duration_seconds)
    }

    pub fn with_schedule(mut self, start: u64, cliff_seconds: u64, duration_seconds: u64) -> Self {
        self.start = start;
        self.cliff_seconds = cliff_seconds;
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    /// Accept beneficiaries that are repeated or already scheduled.
    pub fn allow_duplicates(mut self) -> Self {
        self.allow_duplicates = true;
        self
    }

    /// Validate everything and compute the total. Pure.
    pub fn build(
        &self,
        already_scheduled: &BTreeMap<String, Vec<VestingMark>>,
    ) -> Result<VestingBatch, LaunchError> {
        if self.beneficiaries.len() != self.amounts.len() {
            return Err(LaunchError::ArityMismatch {
                beneficiaries: self.beneficiaries.len(),
                amounts: self.amounts.len(),
            });
        }
        if self.cliff_seconds > self.duration_seconds {
            return Err(LaunchError::Config(format!(
                "vesting cliff ({}s) exceeds duration ({}s)",
                self.cliff_seconds, self.duration_seconds
            )));
        }
        if !self.beneficiaries.is_empty() && self.duration_seconds == 0 {
            return Err(LaunchError::Config("vesting duration must be positive".into()));
        }

        let mut seen = HashSet::new();
        let mut batch = VestingBatch::default();
        for (raw_beneficiary, raw_amount) in self.beneficiaries.iter().zip(&self.amounts) {
            let beneficiary = Address::parse(raw_beneficiary).map_err(|_| {
                LaunchError::Config(format!("invalid vesting beneficiary '{raw_beneficiary}'"))
            })?;
            let units = parse_units(raw_amount, self.decimals).map_err(|e| {
                LaunchError::InvalidAmount {
                    entry: beneficiary.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if units == 0 {
                return Err(LaunchError::InvalidAmount {
                    entry: beneficiary.to_string(),
                    reason: "amount must be positive".into(),
                });
            }
            let duplicate = !seen.insert(beneficiary.clone())
                || already_scheduled.contains_key(beneficiary.as_str());
            if duplicate && !self.allow_duplicates {
                return Err(LaunchError::DuplicateBeneficiary(beneficiary.to_string()));
            }
            batch.total_units = batch.total_units.checked_add(units).ok_or_else(|| {
                LaunchError::InvalidAmount {
                    entry: "vesting total".into(),
                    reason: "sum does not fit in 128 bits".into(),
                }
            })?;
            batch.schedules.push(VestingSchedule {
                beneficiary,
                units,
                start: self.start,
                cliff_seconds: self.cliff_seconds,
                duration_seconds: self.duration_seconds,
            });
        }
        Ok(batch)
    }
}

/// Submits a validated batch to the vesting contract.
pub struct VestingScheduler {
    chain: Arc<dyn ChainClient>,
    confirmation_timeout: Duration,
}

impl VestingScheduler {
    pub fn new(chain: Arc<dyn ChainClient>, confirmation_timeout: Duration) -> Self {
        Self {
            chain,
            confirmation_timeout,
        }
    }

    /// Check the holder balance, approve exactly `total`, then create every
    /// schedule in one batch. Schedules are recorded only after confirmation.
    pub async fn submit(
        &self,
        batch: &VestingBatch,
        token: &Address,
        vesting: &Address,
        checkpoint: &mut Checkpoint,
    ) -> Result<Option<String>, LaunchError> {
        if batch.is_empty() {
            return Ok(None);
        }

        let holder = self.chain.signer();
        let available = self.chain.balance_of(token, &holder).await?;
        if available < batch.total_units {
            return Err(LaunchError::InsufficientBalance {
                holder: holder.to_string(),
                required: batch.total_units,
                available,
            });
        }

        let approval = self.chain.approve(token, vesting, batch.total_units).await?;
        confirm_within(self.chain.as_ref(), &approval, self.confirmation_timeout).await?;

        let calls: Vec<BatchCall> = batch.schedules.iter().map(VestingSchedule::to_call).collect();
        let tx = self.chain.submit_batch(vesting, &calls).await?;
        let receipt = confirm_within(self.chain.as_ref(), &tx, self.confirmation_timeout).await?;

        let scheduled_at = Utc::now();
        checkpoint.record_vesting(batch.schedules.iter().map(|s| {
            (
                s.beneficiary.clone(),
                VestingMark {
                    units: s.units,
                    start: s.start,
                    cliff_seconds: s.cliff_seconds,
                    duration_seconds: s.duration_seconds,
                    tx_hash: receipt.tx_hash.clone(),
                    scheduled_at,
                },
            )
        }))?;
        info!(
            schedules = batch.schedules.len(),
            total_units = batch.total_units,
            tx = %receipt.tx_hash,
            "vesting batch scheduled"
        );
        Ok(Some(receipt.tx_hash))
    }
}
