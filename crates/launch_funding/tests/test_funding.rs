use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use launch_chain::{ChainClient, InitArgs, PendingTx, SimulatedChain};
use launch_core::{Address, FundingStrategyKind, LaunchError};
use launch_deploy::{Checkpoint, DeploymentRecord, ModuleKind};
use launch_funding::*;

const TIMEOUT: Duration = Duration::from_secs(5);
const TREASURY: &str = "0x3333333333333333333333333333333333333333";

struct Fixture {
    _tmp: tempfile::TempDir,
    chain: Arc<SimulatedChain>,
    checkpoint: Checkpoint,
    token: Address,
    presale: Address,
}

async fn deploy(chain: &SimulatedChain, artifact: &str, args: InitArgs) -> Address {
    let tx = chain.deploy_simple(artifact, &args).await.unwrap();
    chain
        .wait_for_confirmation(&tx)
        .await
        .unwrap()
        .contract_address
        .unwrap()
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let chain = Arc::new(SimulatedChain::new());
    let token = deploy(&chain, "AtlasToken", Vec::new()).await;
    let presale = deploy(&chain, "Presale", Vec::new()).await;
    let mut checkpoint = Checkpoint::open(tmp.path().join("hardhat.json")).unwrap();
    checkpoint
        .put(DeploymentRecord::new("AtlasToken", token.clone(), ModuleKind::Upgradeable))
        .unwrap();
    checkpoint
        .put(DeploymentRecord::new("presale", presale.clone(), ModuleKind::Simple))
        .unwrap();
    Fixture {
        _tmp: tmp,
        chain,
        checkpoint,
        token,
        presale,
    }
}

fn split(presale: &str, treasury: &str) -> Vec<(String, String)> {
    vec![
        ("presale".to_string(), presale.to_string()),
        (TREASURY.to_string(), treasury.to_string()),
    ]
}

/// Delegates to a real strategy but loses the connection on one call.
struct FlakyStrategy {
    inner: Box<dyn FundingStrategy>,
    calls: Arc<AtomicUsize>,
    fail_on: usize,
}

#[async_trait]
impl FundingStrategy for FlakyStrategy {
    fn kind(&self) -> FundingStrategyKind {
        self.inner.kind()
    }

    async fn prepare(
        &self,
        ctx: &FundingContext<'_>,
        plan: &AllocationPlan,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), LaunchError> {
        self.inner.prepare(ctx, plan, checkpoint).await
    }

    async fn fund(
        &self,
        ctx: &FundingContext<'_>,
        sink: &Address,
        units: u128,
    ) -> Result<PendingTx, LaunchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(LaunchError::Chain("connection lost".into()));
        }
        self.inner.fund(ctx, sink, units).await
    }
}

#[tokio::test]
async fn test_over_allocation_fails_before_any_call() {
    let mut f = fixture().await;
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(MintThenTransfer), TIMEOUT);
    let err = ledger.plan(&f.token, "1000", &split("400", "700")).await.unwrap_err();
    assert!(matches!(err, LaunchError::OverAllocation { .. }));
    assert!(f.checkpoint.load().unwrap().funding.is_empty());
    assert_eq!(f.chain.balance(&f.token, &f.chain.signer()), 0);
}

#[tokio::test]
async fn test_interrupted_funding_resumes_without_double_transfer() {
    let mut f = fixture().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let flaky = FlakyStrategy {
        inner: Box::new(MintThenTransfer),
        calls: Arc::clone(&calls),
        fail_on: 2,
    };
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(flaky), TIMEOUT);
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "600")).await.unwrap();

    let err = ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap_err();
    assert!(matches!(err, LaunchError::Chain(_)));
    assert!(f.checkpoint.funding().sinks.contains_key("presale"));
    assert!(!f.checkpoint.funding().sinks.contains_key(TREASURY));

    // Fresh process: new plan, new ledger, same checkpoint file.
    let mut checkpoint = Checkpoint::open(f.checkpoint.path()).unwrap();
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(MintThenTransfer), TIMEOUT);
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "600")).await.unwrap();
    let report = ledger.apply(&mut plan, &f.token, &mut checkpoint).await.unwrap();

    assert_eq!(report.already_funded, vec!["presale".to_string()]);
    assert_eq!(report.funded.len(), 1);
    assert!(plan.is_fully_funded());

    let unit = 10u128.pow(18);
    let treasury = Address::parse(TREASURY).unwrap();
    assert_eq!(f.chain.balance(&f.token, &f.presale), 400 * unit);
    assert_eq!(f.chain.balance(&f.token, &treasury), 600 * unit);
    assert_eq!(f.chain.balance(&f.token, &f.chain.signer()), 0);

    let again = ledger.apply(&mut plan, &f.token, &mut checkpoint).await.unwrap();
    assert!(again.funded.is_empty());
    assert_eq!(f.chain.balance(&f.token, &f.presale), 400 * unit);
}

#[tokio::test]
async fn test_insufficient_holder_balance_blocks_all_transfers() {
    let mut f = fixture().await;
    // Supply already marked as minted, but the holder never received it.
    f.checkpoint.update_funding(|s| s.supply_minted = true).unwrap();
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(MintThenTransfer), TIMEOUT);
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "600")).await.unwrap();

    let err = ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap_err();
    assert!(matches!(err, LaunchError::InsufficientBalance { available: 0, .. }));
    assert_eq!(f.chain.balance(&f.token, &f.presale), 0);
    assert!(f.checkpoint.funding().sinks.is_empty());
}

#[tokio::test]
async fn test_mint_per_sink_never_touches_holder() {
    let mut f = fixture().await;
    let ledger = AllocationLedger::new(
        f.chain.clone(),
        strategy_for(FundingStrategyKind::MintPerSink),
        TIMEOUT,
    );
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "600")).await.unwrap();
    ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap();

    assert_eq!(f.chain.balance(&f.token, &f.chain.signer()), 0);
    assert_eq!(f.chain.balance(&f.token, &f.presale), 400 * 10u128.pow(18));
    assert!(!f.checkpoint.funding().supply_minted);
}

#[tokio::test]
async fn test_stalled_supply_mint_is_not_repeated() {
    let mut f = fixture().await;
    f.chain.stall_confirmations_of("mint");
    let ledger = AllocationLedger::new(
        f.chain.clone(),
        Box::new(MintThenTransfer),
        Duration::from_millis(50),
    );
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "500")).await.unwrap();
    let err = ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap_err();
    assert!(matches!(err, LaunchError::Timeout { .. }));
    assert!(f.checkpoint.funding().pending_supply_mint.is_some());
    assert!(!f.checkpoint.funding().supply_minted);

    // The mint lands; a fresh run waits for it instead of minting again.
    f.chain.clear_faults();
    let mut checkpoint = Checkpoint::open(f.checkpoint.path()).unwrap();
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(MintThenTransfer), TIMEOUT);
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "500")).await.unwrap();
    ledger.apply(&mut plan, &f.token, &mut checkpoint).await.unwrap();

    let unit = 10u128.pow(18);
    assert_eq!(f.chain.balance(&f.token, &f.chain.signer()), 100 * unit);
    assert_eq!(f.chain.balance(&f.token, &f.presale), 400 * unit);
    assert!(checkpoint.funding().supply_minted);
    assert!(checkpoint.funding().pending_supply_mint.is_none());
}

#[tokio::test]
async fn test_unknown_pending_supply_mint_is_sent_again() {
    let mut f = fixture().await;
    f.checkpoint
        .update_funding(|s| s.pending_supply_mint = Some("0xdead".into()))
        .unwrap();
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(MintThenTransfer), TIMEOUT);
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "500")).await.unwrap();
    ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap();

    assert_eq!(f.chain.balance(&f.token, &f.chain.signer()), 100 * 10u128.pow(18));
    assert!(f.checkpoint.funding().pending_supply_mint.is_none());
}

#[tokio::test]
async fn test_mint_per_sink_mints_vesting_deposit_to_holder() {
    let mut f = fixture().await;
    let vesting = deploy(&f.chain, "presale/Vesting", vec![serde_json::json!(f.token.as_str())]).await;
    let ledger = AllocationLedger::new(
        f.chain.clone(),
        strategy_for(FundingStrategyKind::MintPerSink),
        TIMEOUT,
    );
    let mut plan = ledger.plan(&f.token, "1000", &split("400", "500")).await.unwrap();
    let batch = VestingBatchBuilder::new(
        vec!["0x1111111111111111111111111111111111111111".into()],
        vec!["100".into()],
    )
    .with_decimals(plan.decimals)
    .with_schedule(0, 0, 10)
    .build(f.checkpoint.vesting())
    .unwrap();
    plan.reserve("vesting", batch.total_units).unwrap();
    ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap();

    ledger.fund_holder(&f.token, batch.total_units).await.unwrap();
    // Already covered: no second mint.
    ledger.fund_holder(&f.token, batch.total_units).await.unwrap();
    let holder = f.chain.signer();
    assert_eq!(f.chain.balance(&f.token, &holder), batch.total_units);

    VestingScheduler::new(f.chain.clone(), TIMEOUT)
        .submit(&batch, &f.token, &vesting, &mut f.checkpoint)
        .await
        .unwrap();
    assert_eq!(f.chain.balance(&f.token, &vesting), 100 * 10u128.pow(18));
    assert_eq!(f.chain.balance(&f.token, &holder), 0);
}

#[tokio::test]
async fn test_unknown_sink_fails_before_minting() {
    let mut f = fixture().await;
    let ledger = AllocationLedger::new(f.chain.clone(), Box::new(MintThenTransfer), TIMEOUT);
    let named = vec![("LPRewardSink".to_string(), "10".to_string())];
    let mut plan = ledger.plan(&f.token, "1000", &named).await.unwrap();

    let err = ledger.apply(&mut plan, &f.token, &mut f.checkpoint).await.unwrap_err();
    assert_eq!(err, LaunchError::NotFound("LPRewardSink".into()));
    assert_eq!(f.chain.balance(&f.token, &f.chain.signer()), 0);
}

#[tokio::test]
async fn test_vesting_batch_with_bad_amount_makes_no_chain_call() {
    let f = fixture().await;
    let vesting = deploy(&f.chain, "presale/Vesting", vec![serde_json::json!(f.token.as_str())]).await;
    let builder = VestingBatchBuilder::new(
        vec![
            "0x1111111111111111111111111111111111111111".into(),
            "0x2222222222222222222222222222222222222222".into(),
        ],
        vec!["100".into(), "bad".into()],
    )
    .with_schedule(0, 0, 100);

    assert!(builder.build(&BTreeMap::new()).is_err());
    let holder = f.chain.signer();
    assert_eq!(f.chain.allowance(&f.token, &holder, &vesting), 0);
    assert!(f.chain.batches(&vesting).is_empty());
}

#[tokio::test]
async fn test_vesting_batch_approves_exact_total_and_records() {
    let mut f = fixture().await;
    let vesting = deploy(&f.chain, "presale/Vesting", vec![serde_json::json!(f.token.as_str())]).await;
    let holder = f.chain.signer();
    let tx = f.chain.mint(&f.token, &holder, 1_000).await.unwrap();
    f.chain.wait_for_confirmation(&tx).await.unwrap();

    let batch = VestingBatchBuilder::new(
        vec![
            "0x1111111111111111111111111111111111111111".into(),
            "0x2222222222222222222222222222222222222222".into(),
        ],
        vec!["100".into(), "250".into()],
    )
    .with_decimals(0)
    .with_schedule(1_700_000_000, 0, 2_592_000)
    .build(f.checkpoint.vesting())
    .unwrap();

    let scheduler = VestingScheduler::new(f.chain.clone(), TIMEOUT);
    let tx = scheduler
        .submit(&batch, &f.token, &vesting, &mut f.checkpoint)
        .await
        .unwrap();
    assert!(tx.is_some());

    assert_eq!(f.chain.balance(&f.token, &vesting), 350);
    assert_eq!(f.chain.balance(&f.token, &holder), 650);
    assert_eq!(f.chain.allowance(&f.token, &holder, &vesting), 0);
    assert_eq!(f.chain.batches(&vesting).len(), 1);
    assert_eq!(f.checkpoint.vesting().len(), 2);

    // Same beneficiaries again are rejected without the override.
    let repeat = VestingBatchBuilder::new(
        vec!["0x1111111111111111111111111111111111111111".into()],
        vec!["1".into()],
    )
    .with_decimals(0)
    .with_schedule(0, 0, 1)
    .build(f.checkpoint.vesting());
    assert!(matches!(repeat, Err(LaunchError::DuplicateBeneficiary(_))));
}

#[tokio::test]
async fn test_repeated_beneficiary_keeps_every_schedule() {
    let mut f = fixture().await;
    let vesting = deploy(&f.chain, "presale/Vesting", vec![serde_json::json!(f.token.as_str())]).await;
    let holder = f.chain.signer();
    let tx = f.chain.mint(&f.token, &holder, 1_000).await.unwrap();
    f.chain.wait_for_confirmation(&tx).await.unwrap();

    let beneficiary = "0x1111111111111111111111111111111111111111";
    let batch = VestingBatchBuilder::new(
        vec![beneficiary.into(), beneficiary.into()],
        vec!["100".into(), "250".into()],
    )
    .with_decimals(0)
    .with_schedule(0, 0, 10)
    .allow_duplicates()
    .build(f.checkpoint.vesting())
    .unwrap();
    VestingScheduler::new(f.chain.clone(), TIMEOUT)
        .submit(&batch, &f.token, &vesting, &mut f.checkpoint)
        .await
        .unwrap();

    let reopened = Checkpoint::open(f.checkpoint.path()).unwrap();
    let marks = &reopened.vesting()[beneficiary];
    assert_eq!(marks.len(), 2);
    assert_eq!(reopened.vesting_units(), f.chain.balance(&f.token, &vesting));
    assert_eq!(reopened.vesting_units(), 350);
}

#[tokio::test]
async fn test_vesting_batch_is_all_or_nothing() {
    let mut f = fixture().await;
    let vesting = deploy(&f.chain, "presale/Vesting", vec![serde_json::json!(f.token.as_str())]).await;
    let holder = f.chain.signer();
    let tx = f.chain.mint(&f.token, &holder, 1_000).await.unwrap();
    f.chain.wait_for_confirmation(&tx).await.unwrap();
    f.chain.fail_method(vesting::CREATE_SCHEDULE_METHOD);

    let batch = VestingBatchBuilder::new(
        vec![
            "0x1111111111111111111111111111111111111111".into(),
            "0x2222222222222222222222222222222222222222".into(),
        ],
        vec!["100".into(), "250".into()],
    )
    .with_decimals(0)
    .with_schedule(0, 0, 10)
    .build(&BTreeMap::new())
    .unwrap();

    let result = VestingScheduler::new(f.chain.clone(), TIMEOUT)
        .submit(&batch, &f.token, &vesting, &mut f.checkpoint)
        .await;
    assert!(result.is_err());
    assert_eq!(f.chain.balance(&f.token, &vesting), 0);
    assert!(f.checkpoint.vesting().is_empty());
}
