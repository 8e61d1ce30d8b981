//! Allocation ledger: split total supply across sinks and fund them.
//!
//! Planning is pure and conservation-checked. Applying is resumable: every
//! confirmed funding is persisted to the checkpoint before the next sink is
//! touched, and sinks already marked funded are never paid twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use launch_chain::{ChainClient, ChainError, PendingTx, confirm_within};
use launch_core::{Address, FundingStrategyKind, LaunchError};
use launch_deploy::{Checkpoint, FundedMark, FundingState};

use crate::units::{DEFAULT_DECIMALS, format_units, parse_units};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkAllocation {
    /// Module name in the checkpoint, or a literal account address.
    pub sink: String,
    pub units: u128,
    pub funded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub total_supply_units: u128,
    pub decimals: u8,
    pub sinks: Vec<SinkAllocation>,
    /// Supply set aside outside the sinks (vesting), counted against the total.
    #[serde(default)]
    pub reserved: Vec<(String, u128)>,
}

impl AllocationPlan {
    /// Convert decimal amounts to units and check that they fit in the supply.
    pub fn plan(
        total_supply: &str,
        named_amounts: &[(String, String)],
        decimals: u8,
    ) -> Result<Self, LaunchError> {
        let total_supply_units =
            parse_units(total_supply, decimals).map_err(|e| LaunchError::InvalidAmount {
                entry: "total supply".to_string(),
                reason: e.to_string(),
            })?;

        let mut seen = HashSet::new();
        let mut sinks = Vec::with_capacity(named_amounts.len());
        for (sink, raw) in named_amounts {
            if !seen.insert(sink.as_str()) {
                return Err(LaunchError::Config(format!("sink '{sink}' is allocated twice")));
            }
            let units = parse_units(raw, decimals).map_err(|e| LaunchError::InvalidAmount {
                entry: sink.clone(),
                reason: e.to_string(),
            })?;
            sinks.push(SinkAllocation {
                sink: sink.clone(),
                units,
                funded: false,
            });
        }

        let plan = Self {
            total_supply_units,
            decimals,
            sinks,
            reserved: Vec::new(),
        };
        plan.check_conservation()?;
        Ok(plan)
    }

    /// Set `units` aside under `entry`. Sinks plus every reservation must
    /// still fit in the supply; on error the plan is left unchanged.
    pub fn reserve(&mut self, entry: &str, units: u128) -> Result<(), LaunchError> {
        self.reserved.push((entry.to_string(), units));
        if let Err(e) = self.check_conservation() {
            self.reserved.pop();
            return Err(e);
        }
        Ok(())
    }

    fn entries(&self) -> impl Iterator<Item = (&str, u128)> {
        self.sinks
            .iter()
            .map(|s| (s.sink.as_str(), s.units))
            .chain(self.reserved.iter().map(|(entry, units)| (entry.as_str(), *units)))
    }

    fn check_conservation(&self) -> Result<(), LaunchError> {
        let requested = self
            .entries()
            .try_fold(0u128, |acc, (_, units)| acc.checked_add(units))
            .ok_or_else(|| LaunchError::InvalidAmount {
                entry: "allocations".to_string(),
                reason: "sum does not fit in 128 bits".to_string(),
            })?;
        if requested > self.total_supply_units {
            return Err(LaunchError::OverAllocation {
                total: self.total_supply_units,
                requested,
                excess: requested - self.total_supply_units,
                entries: self
                    .entries()
                    .map(|(entry, units)| (entry.to_string(), units))
                    .collect(),
            });
        }
        Ok(())
    }

    pub fn allocated_units(&self) -> u128 {
        self.sinks.iter().map(|s| s.units).sum()
    }

    pub fn reserved_units(&self) -> u128 {
        self.reserved.iter().map(|(_, units)| units).sum()
    }

    pub fn unallocated_units(&self) -> u128 {
        self.total_supply_units - self.allocated_units() - self.reserved_units()
    }

    pub fn unfunded_units(&self) -> u128 {
        self.unfunded().map(|s| s.units).sum()
    }

    pub fn unfunded(&self) -> impl Iterator<Item = &SinkAllocation> {
        self.sinks.iter().filter(|s| !s.funded)
    }

    pub fn is_fully_funded(&self) -> bool {
        self.sinks.iter().all(|s| s.funded)
    }

    /// Adopt funded flags persisted by earlier runs.
    pub fn sync_funded(&mut self, state: &FundingState) {
        for sink in &mut self.sinks {
            if state.sinks.contains_key(&sink.sink) {
                sink.funded = true;
            }
        }
    }
}

/// Chain handles shared by the funding strategies.
pub struct FundingContext<'a> {
    pub chain: &'a dyn ChainClient,
    pub token: &'a Address,
    /// Account that holds minted supply and sends transfers.
    pub holder: &'a Address,
    pub confirmation_timeout: Duration,
}

impl FundingContext<'_> {
    async fn require_balance(&self, required: u128) -> Result<(), LaunchError> {
        let available = self.chain.balance_of(self.token, self.holder).await?;
        if available < required {
            return Err(LaunchError::InsufficientBalance {
                holder: self.holder.to_string(),
                required,
                available,
            });
        }
        Ok(())
    }
}

/// How tokens reach a sink.
#[async_trait]
pub trait FundingStrategy: Send + Sync {
    fn kind(&self) -> FundingStrategyKind;

    /// Runs once per `apply`, before the first sink is funded.
    async fn prepare(
        &self,
        ctx: &FundingContext<'_>,
        plan: &AllocationPlan,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), LaunchError>;

    /// Submit the funding of one sink.
    async fn fund(
        &self,
        ctx: &FundingContext<'_>,
        sink: &Address,
        units: u128,
    ) -> Result<PendingTx, LaunchError>;

    /// Make sure the holder itself owns `units` (the vesting deposit).
    async fn fund_holder(&self, ctx: &FundingContext<'_>, units: u128) -> Result<(), LaunchError> {
        ctx.require_balance(units).await
    }
}

/// Mint the whole supply to the holder once, then transfer slices.
pub struct MintThenTransfer;

#[async_trait]
impl FundingStrategy for MintThenTransfer {
    fn kind(&self) -> FundingStrategyKind {
        FundingStrategyKind::MintThenTransfer
    }

    async fn prepare(
        &self,
        ctx: &FundingContext<'_>,
        plan: &AllocationPlan,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), LaunchError> {
        if !checkpoint.funding().supply_minted {
            let pending = checkpoint.funding().pending_supply_mint.clone();
            let landed = match pending {
                Some(hash) => reconcile_supply_mint(ctx, hash, checkpoint).await?,
                None => false,
            };
            if !landed {
                info!(
                    holder = %ctx.holder,
                    units = plan.total_supply_units,
                    "minting total supply to holder"
                );
                let tx = ctx
                    .chain
                    .mint(ctx.token, ctx.holder, plan.total_supply_units)
                    .await?;
                checkpoint.update_funding(|state| state.pending_supply_mint = Some(tx.hash.clone()))?;
                confirm_within(ctx.chain, &tx, ctx.confirmation_timeout).await?;
            }
            checkpoint.update_funding(|state| {
                state.supply_minted = true;
                state.pending_supply_mint = None;
            })?;
        }
        ctx.require_balance(plan.unfunded_units()).await
    }

    async fn fund(
        &self,
        ctx: &FundingContext<'_>,
        sink: &Address,
        units: u128,
    ) -> Result<PendingTx, LaunchError> {
        ctx.require_balance(units).await?;
        Ok(ctx.chain.transfer(ctx.token, sink, units).await?)
    }
}

/// Wait for a supply mint sent by an earlier run. `Ok(false)` means the chain
/// does not know it and a fresh mint is needed; a timeout is returned as is.
async fn reconcile_supply_mint(
    ctx: &FundingContext<'_>,
    hash: String,
    checkpoint: &mut Checkpoint,
) -> Result<bool, LaunchError> {
    info!(tx = %hash, "found pending supply mint, waiting for it");
    let tx = PendingTx {
        hash: hash.clone(),
        description: "pending supply mint".to_string(),
    };
    match confirm_within(ctx.chain, &tx, ctx.confirmation_timeout).await {
        Ok(_) => Ok(true),
        Err(LaunchError::Chain(reason)) => {
            warn!(tx = %hash, "pending supply mint did not land ({reason}), minting again");
            checkpoint.update_funding(|state| state.pending_supply_mint = None)?;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Mint each slice directly to its sink.
pub struct MintPerSink;

#[async_trait]
impl FundingStrategy for MintPerSink {
    fn kind(&self) -> FundingStrategyKind {
        FundingStrategyKind::MintPerSink
    }

    async fn prepare(
        &self,
        _ctx: &FundingContext<'_>,
        _plan: &AllocationPlan,
        _checkpoint: &mut Checkpoint,
    ) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn fund(
        &self,
        ctx: &FundingContext<'_>,
        sink: &Address,
        units: u128,
    ) -> Result<PendingTx, LaunchError> {
        Ok(ctx.chain.mint(ctx.token, sink, units).await?)
    }

    /// Mint only the shortfall, so a rerun after a landed mint sends nothing.
    async fn fund_holder(&self, ctx: &FundingContext<'_>, units: u128) -> Result<(), LaunchError> {
        let available = ctx.chain.balance_of(ctx.token, ctx.holder).await?;
        if available >= units {
            return Ok(());
        }
        let shortfall = units - available;
        info!(holder = %ctx.holder, units = shortfall, "minting vesting deposit to holder");
        let tx = ctx.chain.mint(ctx.token, ctx.holder, shortfall).await?;
        confirm_within(ctx.chain, &tx, ctx.confirmation_timeout).await?;
        Ok(())
    }
}

pub fn strategy_for(kind: FundingStrategyKind) -> Box<dyn FundingStrategy> {
    match kind {
        FundingStrategyKind::MintThenTransfer => Box::new(MintThenTransfer),
        FundingStrategyKind::MintPerSink => Box::new(MintPerSink),
    }
}

/// Decimals reported by `token`, or [`DEFAULT_DECIMALS`] when the token has
/// no `decimals()`. Any other failure is returned.
pub async fn token_decimals(chain: &dyn ChainClient, token: &Address) -> Result<u8, LaunchError> {
    match chain.decimals(token).await {
        Ok(decimals) => Ok(decimals),
        Err(ChainError::Unsupported(e)) => {
            warn!(%token, "decimals() unavailable ({e}), assuming {DEFAULT_DECIMALS}");
            Ok(DEFAULT_DECIMALS)
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingReport {
    /// Sinks funded by this run, with units.
    pub funded: Vec<(String, u128)>,
    /// Sinks skipped because an earlier run funded them.
    pub already_funded: Vec<String>,
    pub cancelled: bool,
}

/// Applies allocation plans through a funding strategy.
pub struct AllocationLedger {
    chain: Arc<dyn ChainClient>,
    strategy: Box<dyn FundingStrategy>,
    confirmation_timeout: Duration,
    abort: Arc<AtomicBool>,
}

impl AllocationLedger {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        strategy: Box<dyn FundingStrategy>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            strategy,
            confirmation_timeout,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Plan at the token's own decimals.
    pub async fn plan(
        &self,
        token: &Address,
        total_supply: &str,
        named_amounts: &[(String, String)],
    ) -> Result<AllocationPlan, LaunchError> {
        let decimals = token_decimals(self.chain.as_ref(), token).await?;
        AllocationPlan::plan(total_supply, named_amounts, decimals)
    }

    /// Top up the holder so it can pay `units` itself, through the strategy.
    pub async fn fund_holder(&self, token: &Address, units: u128) -> Result<(), LaunchError> {
        let holder = self.chain.signer();
        let ctx = FundingContext {
            chain: self.chain.as_ref(),
            token,
            holder: &holder,
            confirmation_timeout: self.confirmation_timeout,
        };
        self.strategy.fund_holder(&ctx, units).await
    }

    /// Fund every unfunded sink in `plan`.
    ///
    /// All sink addresses are resolved before the first chain call. On error,
    /// sinks funded so far stay recorded and the next call resumes after them.
    pub async fn apply(
        &self,
        plan: &mut AllocationPlan,
        token: &Address,
        checkpoint: &mut Checkpoint,
    ) -> Result<FundingReport, LaunchError> {
        plan.sync_funded(checkpoint.funding());
        let mut report = FundingReport {
            already_funded: plan
                .sinks
                .iter()
                .filter(|s| s.funded)
                .map(|s| s.sink.clone())
                .collect(),
            ..FundingReport::default()
        };
        if plan.is_fully_funded() {
            info!("all sinks already funded");
            return Ok(report);
        }

        let mut targets = Vec::new();
        for sink in plan.unfunded() {
            let address = resolve_sink(&sink.sink, checkpoint)?;
            targets.push((sink.sink.clone(), address, sink.units));
        }

        let holder = self.chain.signer();
        let ctx = FundingContext {
            chain: self.chain.as_ref(),
            token,
            holder: &holder,
            confirmation_timeout: self.confirmation_timeout,
        };
        info!(
            strategy = %self.strategy.kind(),
            sinks = targets.len(),
            units = plan.unfunded_units(),
            "funding started"
        );
        self.strategy.prepare(&ctx, plan, checkpoint).await?;

        for (name, address, units) in targets {
            if self.abort.load(Ordering::SeqCst) {
                warn!("abort requested, stopping funding before {name}");
                report.cancelled = true;
                break;
            }
            let tx = self.strategy.fund(&ctx, &address, units).await?;
            let receipt = confirm_within(self.chain.as_ref(), &tx, self.confirmation_timeout).await?;
            let mark = FundedMark {
                sink_address: address.clone(),
                units,
                tx_hash: receipt.tx_hash,
                funded_at: Utc::now(),
            };
            checkpoint.update_funding(|state| {
                state.sinks.insert(name.clone(), mark);
            })?;
            if let Some(entry) = plan.sinks.iter_mut().find(|s| s.sink == name) {
                entry.funded = true;
            }
            info!(
                sink = %name,
                %address,
                amount = %format_units(units, plan.decimals),
                "sink funded"
            );
            report.funded.push((name, units));
        }
        Ok(report)
    }
}

fn resolve_sink(sink: &str, checkpoint: &Checkpoint) -> Result<Address, LaunchError> {
    if sink.starts_with("0x") {
        return Address::parse(sink);
    }
    checkpoint.address_of(sink)
}
