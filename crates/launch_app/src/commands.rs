use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use launch_chain::{Network, NetworkProfiles, SimulatedChain};
use launch_core::LaunchConfig;
use launch_deploy::manifest::{self, atlas_grants, atlas_registry};
use launch_deploy::{Checkpoint, DeployOptions, DeployReport, ModuleState, Orchestrator, Wiring};
use launch_funding::{
    AllocationLedger, VestingBatch, VestingBatchBuilder, VestingScheduler, format_units,
    strategy_for,
};
use launch_verify::{HttpVerifier, RetryController, RetryPolicy, VerificationStatus, VerifyRequest};

/// Everything a command needs, opened once per invocation.
pub struct Launch {
    pub config: LaunchConfig,
    pub chain: Arc<SimulatedChain>,
    pub checkpoint: Checkpoint,
    pub abort: Arc<AtomicBool>,
}

impl Launch {
    pub fn open(config: LaunchConfig, abort: Arc<AtomicBool>) -> Result<Self> {
        let network: Network = config.network.parse()?;
        let checkpoint = Checkpoint::open(config.checkpoint_path.clone())
            .with_context(|| format!("opening checkpoint {}", config.checkpoint_path.display()))?;
        let chain_path = chain_state_path(&config);
        let chain = SimulatedChain::open(&chain_path)
            .with_context(|| format!("opening chain state {}", chain_path.display()))?;
        info!(
            network = %network,
            chain_id = network.chain_id(),
            checkpoint = %config.checkpoint_path.display(),
            "launch context ready"
        );
        Ok(Self {
            config,
            chain: Arc::new(chain),
            checkpoint,
            abort,
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.confirmation_timeout_secs)
    }
}

/// Simulated chain state lives next to the checkpoint.
pub fn chain_state_path(config: &LaunchConfig) -> PathBuf {
    config.checkpoint_path.with_extension("chain.json")
}

/// Deploy missing modules, then wire capabilities once every required
/// module is recorded. Returns whether everything succeeded.
///
/// A `--module` run only deploys its closure; wiring waits for a full run.
pub async fn deploy(launch: &mut Launch, options: DeployOptions) -> Result<bool> {
    let registry = atlas_registry(&launch.config)?;
    let orchestrator = Orchestrator::new(registry, launch.chain.clone(), launch.config.clone())
        .with_abort_flag(Arc::clone(&launch.abort));
    let report = orchestrator.run(&mut launch.checkpoint, &options).await?;
    print_deploy_report(&report);

    if let Some(module) = &options.only {
        println!("wiring skipped for a single-module run ({module})");
        return Ok(report.is_success());
    }

    let required_missing = orchestrator
        .registry()
        .iter()
        .any(|m| m.required && !launch.checkpoint.has(&m.name));
    if report.aborted_by.is_some() || report.cancelled || required_missing {
        println!("wiring deferred until every required module is deployed");
        return Ok(false);
    }

    let wiring = Wiring::new(launch.chain.clone(), launch.timeout())
        .with_abort_flag(Arc::clone(&launch.abort));
    match wiring
        .apply(&atlas_grants(&launch.config), orchestrator.registry(), &launch.checkpoint)
        .await
    {
        Ok(wiring_report) => {
            println!("wiring: {} grants applied", wiring_report.applied_count());
            for (label, outcome) in wiring_report.skipped() {
                println!("  skipped {label}: {outcome:?}");
            }
            Ok(report.is_success() && !wiring_report.cancelled)
        }
        Err(e) => {
            println!("wiring failed: {e}");
            Ok(false)
        }
    }
}

fn print_deploy_report(report: &DeployReport) {
    println!("deployment run {}", report.run_id);
    for outcome in &report.outcomes {
        let address = outcome
            .address
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match &outcome.state {
            ModuleState::Failed { error } => {
                println!("  {:<22} failed     [{}] {error}", outcome.name, error.category());
            }
            state => println!("  {:<22} {:<10} {address}", outcome.name, format!("{state:?}").to_lowercase()),
        }
    }
    if let Some(module) = &report.aborted_by {
        println!("run aborted: required module {module} failed");
    }
    if report.cancelled {
        println!("run cancelled; re-run to resume");
    }
}

/// Fund every sink, then schedule configured vesting.
///
/// Vesting is validated and counted against the supply before the first
/// chain call.
pub async fn fund(launch: &mut Launch, allow_duplicate_beneficiaries: bool) -> Result<bool> {
    let token = launch
        .checkpoint
        .address_of(manifest::TOKEN)
        .context("token is not deployed; run `launch deploy` first")?;

    let ledger = AllocationLedger::new(
        launch.chain.clone(),
        strategy_for(launch.config.funding_strategy),
        launch.timeout(),
    )
    .with_abort_flag(Arc::clone(&launch.abort));
    let mut plan = ledger
        .plan(&token, &launch.config.total_supply, &launch.config.allocations)
        .await?;
    let batch = vesting_batch(launch, plan.decimals, allow_duplicate_beneficiaries)?;
    let vesting_units = launch
        .checkpoint
        .vesting_units()
        .saturating_add(batch.as_ref().map_or(0, |b| b.total_units));
    if vesting_units > 0 {
        plan.reserve("vesting", vesting_units)?;
    }
    let report = ledger.apply(&mut plan, &token, &mut launch.checkpoint).await?;

    for sink in &report.already_funded {
        println!("  {sink:<22} already funded");
    }
    for (sink, units) in &report.funded {
        println!("  {sink:<22} funded {}", format_units(*units, plan.decimals));
    }
    println!(
        "allocated {} of {} ({} vesting, {} unallocated)",
        format_units(plan.allocated_units(), plan.decimals),
        format_units(plan.total_supply_units, plan.decimals),
        format_units(plan.reserved_units(), plan.decimals),
        format_units(plan.unallocated_units(), plan.decimals),
    );
    if report.cancelled {
        println!("funding cancelled; re-run to resume");
        return Ok(false);
    }

    let Some(batch) = batch.filter(|b| !b.is_empty()) else {
        return Ok(true);
    };
    let vesting = launch
        .checkpoint
        .address_of(manifest::VESTING)
        .context("vesting module is not deployed")?;
    ledger.fund_holder(&token, batch.total_units).await?;
    let tx = VestingScheduler::new(launch.chain.clone(), launch.timeout())
        .submit(&batch, &token, &vesting, &mut launch.checkpoint)
        .await?;
    println!(
        "vesting: {} schedules, total {} ({})",
        batch.schedules.len(),
        format_units(batch.total_units, plan.decimals),
        tx.unwrap_or_default()
    );
    Ok(true)
}

/// The configured vesting batch, or `None` when there is nothing to schedule.
fn vesting_batch(
    launch: &Launch,
    decimals: u8,
    allow_duplicate_beneficiaries: bool,
) -> Result<Option<VestingBatch>> {
    let settings = &launch.config.vesting;
    if settings.beneficiaries.is_empty() {
        return Ok(None);
    }
    let already = launch.checkpoint.vesting();
    let all_scheduled = settings.beneficiaries.iter().all(|b| {
        launch_core::Address::parse(b).is_ok_and(|a| already.contains_key(a.as_str()))
    });
    if all_scheduled && !allow_duplicate_beneficiaries {
        println!("vesting: all {} beneficiaries already scheduled", settings.beneficiaries.len());
        return Ok(None);
    }

    let mut builder = VestingBatchBuilder::from_settings(settings).with_decimals(decimals);
    if allow_duplicate_beneficiaries {
        builder = builder.allow_duplicates();
    }
    Ok(Some(builder.build(already)?))
}

/// Verify recorded modules. Verification problems are reported, never fatal.
pub async fn verify(launch: &Launch) -> Result<bool> {
    let network: Network = launch.config.network.parse()?;
    let mut profiles = NetworkProfiles::with_defaults();
    if let Some(url) = &launch.config.verify.api_url {
        profiles.set_verify_api(network, url.clone())?;
    }
    let api_url = profiles.get(network).and_then(|p| p.verify_api_url.clone());
    let Some(api_url) = api_url else {
        println!("no verification endpoint for {network}; nothing to do");
        return Ok(true);
    };
    if !network.is_public() {
        warn!(%network, "verifying against a local network");
    }

    let verifier = HttpVerifier::new(&api_url, launch.config.verify.api_key.clone())?;
    let registry = atlas_registry(&launch.config)?;
    let order: Vec<&str> = registry
        .resolve_order()?
        .into_iter()
        .map(|m| m.name.as_str())
        .collect();
    let requests = VerifyRequest::for_recorded(&launch.checkpoint, order);

    let report = RetryController::new(Arc::new(verifier), RetryPolicy::from(&launch.config.verify))
        .with_abort_flag(Arc::clone(&launch.abort))
        .run(&requests)
        .await;
    for result in &report.results {
        let status = match &result.status {
            VerificationStatus::Verified => "verified".to_string(),
            VerificationStatus::AlreadyVerified => "already verified".to_string(),
            VerificationStatus::GaveUp => format!("gave up after {} retries", result.retries),
            VerificationStatus::Fatal { reason } => format!("failed: {reason}"),
        };
        println!("  {:<22} {status}", result.module);
    }
    println!(
        "verification: {} ok, {} not verified",
        report.success_count(),
        report.failures().count()
    );
    Ok(true)
}

/// Print what the checkpoint records.
pub fn status(launch: &Launch, json: bool) -> Result<bool> {
    let data = launch.checkpoint.data();
    if json {
        println!("{}", serde_json::to_string_pretty(data)?);
        return Ok(true);
    }

    println!("checkpoint {}", launch.checkpoint.path().display());
    let registry = atlas_registry(&launch.config)?;
    for module in registry.resolve_order()? {
        match data.modules.get(&module.name) {
            Some(record) => {
                let implementation = record
                    .implementation_address
                    .as_ref()
                    .map(|a| format!(" (impl {a})"))
                    .unwrap_or_default();
                println!("  {:<22} {}{implementation}", module.name, record.address);
            }
            None if module.required => println!("  {:<22} not deployed", module.name),
            None => println!("  {:<22} not deployed (optional)", module.name),
        }
    }

    if data.funding.supply_minted {
        println!("funding: supply minted to holder");
    }
    for (sink, mark) in &data.funding.sinks {
        println!("  {sink:<22} funded {} units at {}", mark.units, mark.funded_at);
    }
    if !data.vesting.is_empty() {
        let schedules: usize = data.vesting.values().map(Vec::len).sum();
        println!(
            "vesting: {schedules} schedules for {} beneficiaries",
            data.vesting.len()
        );
    }
    Ok(true)
}
