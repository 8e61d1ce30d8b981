//! Deterministic in-process chain.
//!
//! Used for rehearsal runs of the whole pipeline and as the collaborator in
//! tests. State can be persisted to a JSON file so that `deploy`, `fund` and
//! `verify` invocations observe each other's effects. Failure injection hooks
//! are kept in memory only.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use launch_core::{Address, LaunchError};

use crate::client::{BatchCall, ChainClient, ChainError, InitArgs, PendingTx, Receipt};

const TOKEN_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimContract {
    artifact: String,
    args: InitArgs,
    implementation: Option<Address>,
    decimals: Option<u8>,
    roles: BTreeMap<String, BTreeSet<Address>>,
    settings: BTreeMap<String, InitArgs>,
    batches: Vec<Vec<BatchCall>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimState {
    nonce: u64,
    block: u64,
    contracts: BTreeMap<Address, SimContract>,
    /// token -> holder -> balance
    balances: BTreeMap<Address, BTreeMap<Address, u128>>,
    /// token -> "owner:spender" -> allowance
    allowances: BTreeMap<Address, BTreeMap<String, u128>>,
    receipts: BTreeMap<String, Receipt>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_artifacts: HashSet<String>,
    failing_methods: HashSet<String>,
    stalled: HashSet<String>,
    decimals_unsupported: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: SimState,
    faults: Faults,
    deploy_counts: HashMap<String, usize>,
    /// tx hash -> artifact or method, for stall lookups
    tx_labels: HashMap<String, String>,
}

/// In-memory chain with optional file persistence.
pub struct SimulatedChain {
    signer: Address,
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl SimulatedChain {
    pub fn new() -> Self {
        Self {
            signer: derive_address(b"launch-simulated-signer", 0),
            inner: Mutex::new(Inner::default()),
            path: None,
        }
    }

    /// Open a persisted chain, starting empty when the file does not exist.
    pub fn open(path: &Path) -> Result<Self, LaunchError> {
        let mut chain = Self::new();
        if path.exists() {
            let json = std::fs::read_to_string(path)?;
            let state: SimState = serde_json::from_str(&json)?;
            info!(path = %path.display(), contracts = state.contracts.len(), "simulated chain loaded");
            chain.inner.get_mut().state = state;
        }
        chain.path = Some(path.to_path_buf());
        Ok(chain)
    }

    fn persist(&self, state: &SimState) -> Result<(), ChainError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(state)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)
        };
        write().map_err(|e| ChainError::Rpc(format!("failed to persist simulated chain: {e}")))
    }

    // -- failure injection ---------------------------------------------------

    /// Every deployment of `artifact` reverts.
    pub fn fail_deploys_of(&self, artifact: &str) {
        self.inner.lock().faults.failing_artifacts.insert(artifact.to_string());
    }

    /// Every call, role grant, or batch using `method` reverts.
    pub fn fail_method(&self, method: &str) {
        self.inner.lock().faults.failing_methods.insert(method.to_string());
    }

    /// Transactions for `label` (artifact or method) never confirm.
    pub fn stall_confirmations_of(&self, label: &str) {
        self.inner.lock().faults.stalled.insert(label.to_string());
    }

    /// `decimals()` is reported as unsupported by every token.
    pub fn hide_decimals(&self) {
        self.inner.lock().faults.decimals_unsupported = true;
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults = Faults::default();
    }

    // -- inspection ----------------------------------------------------------

    /// Number of deployments of `artifact` submitted through this instance.
    pub fn deploy_count(&self, artifact: &str) -> usize {
        self.inner.lock().deploy_counts.get(artifact).copied().unwrap_or(0)
    }

    pub fn balance(&self, token: &Address, holder: &Address) -> u128 {
        let inner = self.inner.lock();
        balance_in(&inner.state, token, holder)
    }

    pub fn allowance(&self, token: &Address, owner: &Address, spender: &Address) -> u128 {
        let inner = self.inner.lock();
        inner
            .state
            .allowances
            .get(token)
            .and_then(|m| m.get(&allowance_key(owner, spender)))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_role(&self, target: &Address, role: &str, grantee: &Address) -> bool {
        let inner = self.inner.lock();
        inner
            .state
            .contracts
            .get(target)
            .and_then(|c| c.roles.get(role))
            .is_some_and(|holders| holders.contains(grantee))
    }

    /// Arguments of the last `method` call on `target`.
    pub fn setting(&self, target: &Address, method: &str) -> Option<InitArgs> {
        let inner = self.inner.lock();
        inner
            .state
            .contracts
            .get(target)
            .and_then(|c| c.settings.get(method).cloned())
    }

    /// Batches applied to `target`, in submission order.
    pub fn batches(&self, target: &Address) -> Vec<Vec<BatchCall>> {
        let inner = self.inner.lock();
        inner
            .state
            .contracts
            .get(target)
            .map(|c| c.batches.clone())
            .unwrap_or_default()
    }

    pub fn contract_artifact(&self, address: &Address) -> Option<String> {
        let inner = self.inner.lock();
        inner.state.contracts.get(address).map(|c| c.artifact.clone())
    }

    // -- internals -----------------------------------------------------------

    /// Apply `effect` to the state, record a receipt, persist, and return the
    /// pending handle. Effects run at submission; confirmation only reports.
    fn submit<F>(&self, label: &str, description: String, effect: F) -> Result<PendingTx, ChainError>
    where
        F: FnOnce(&mut SimState, &Address) -> Result<(Option<Address>, Option<Address>), ChainError>,
    {
        let mut inner = self.inner.lock();
        let mut next = inner.state.clone();
        next.nonce += 1;
        next.block += 1;
        let (contract_address, implementation_address) = effect(&mut next, &self.signer)?;

        let hash = format!("0x{}", hex::encode(Sha256::digest(format!("tx:{}:{label}", next.nonce))));
        next.receipts.insert(
            hash.clone(),
            Receipt {
                tx_hash: hash.clone(),
                block: next.block,
                contract_address,
                implementation_address,
            },
        );
        self.persist(&next)?;
        inner.state = next;
        inner.tx_labels.insert(hash.clone(), label.to_string());
        debug!(tx = %hash, %description, "simulated tx applied");
        Ok(PendingTx { hash, description })
    }

    fn check_method(&self, method: &str) -> Result<(), ChainError> {
        if self.inner.lock().faults.failing_methods.contains(method) {
            return Err(ChainError::Reverted(format!("{method} rejected")));
        }
        Ok(())
    }

    fn deploy(&self, artifact: &str, args: &InitArgs, upgradeable: bool) -> Result<PendingTx, ChainError> {
        {
            let mut inner = self.inner.lock();
            *inner.deploy_counts.entry(artifact.to_string()).or_default() += 1;
            if inner.faults.failing_artifacts.contains(artifact) {
                return Err(ChainError::Reverted(format!("deployment of {artifact} reverted")));
            }
        }
        let owned_artifact = artifact.to_string();
        let owned_args = args.clone();
        self.submit(artifact, format!("deploy {artifact}"), move |state, signer| {
            let proxy = derive_address(signer.as_str().as_bytes(), state.nonce);
            let implementation = upgradeable.then(|| {
                derive_address(format!("impl:{}", signer).as_bytes(), state.nonce)
            });
            let decimals = is_token_artifact(&owned_artifact).then_some(TOKEN_DECIMALS);
            state.contracts.insert(
                proxy.clone(),
                SimContract {
                    artifact: owned_artifact,
                    args: owned_args,
                    implementation: implementation.clone(),
                    decimals,
                    ..SimContract::default()
                },
            );
            Ok((Some(proxy), implementation))
        })
    }
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn signer(&self) -> Address {
        self.signer.clone()
    }

    async fn deploy_simple(&self, artifact: &str, args: &InitArgs) -> Result<PendingTx, ChainError> {
        self.deploy(artifact, args, false)
    }

    async fn deploy_upgradeable(
        &self,
        artifact: &str,
        args: &InitArgs,
    ) -> Result<PendingTx, ChainError> {
        self.deploy(artifact, args, true)
    }

    async fn call(
        &self,
        target: &Address,
        method: &str,
        args: &InitArgs,
    ) -> Result<PendingTx, ChainError> {
        self.check_method(method)?;
        let target = target.clone();
        let method_owned = method.to_string();
        let args = args.clone();
        self.submit(method, format!("{method} on {target}"), move |state, _| {
            let contract = contract_mut(state, &target)?;
            contract.settings.insert(method_owned, args);
            Ok((None, None))
        })
    }

    async fn grant_role(
        &self,
        target: &Address,
        role: &str,
        grantee: &Address,
    ) -> Result<PendingTx, ChainError> {
        self.check_method(role)?;
        let target = target.clone();
        let grantee = grantee.clone();
        let role_owned = role.to_string();
        self.submit(role, format!("grant {role} to {grantee}"), move |state, _| {
            let contract = contract_mut(state, &target)?;
            contract.roles.entry(role_owned).or_default().insert(grantee);
            Ok((None, None))
        })
    }

    async fn balance_of(&self, token: &Address, holder: &Address) -> Result<u128, ChainError> {
        let inner = self.inner.lock();
        if !inner.state.contracts.contains_key(token) {
            return Err(ChainError::UnknownContract(token.clone()));
        }
        Ok(balance_in(&inner.state, token, holder))
    }

    async fn decimals(&self, token: &Address) -> Result<u8, ChainError> {
        let inner = self.inner.lock();
        if inner.faults.decimals_unsupported {
            return Err(ChainError::Unsupported("decimals".into()));
        }
        let contract = inner
            .state
            .contracts
            .get(token)
            .ok_or_else(|| ChainError::UnknownContract(token.clone()))?;
        contract
            .decimals
            .ok_or_else(|| ChainError::Unsupported(format!("{} has no decimals()", contract.artifact)))
    }

    async fn transfer(
        &self,
        token: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<PendingTx, ChainError> {
        self.check_method("transfer")?;
        let token = token.clone();
        let to = to.clone();
        self.submit("transfer", format!("transfer {amount} to {to}"), move |state, signer| {
            contract_mut(state, &token)?;
            move_balance(state, &token, signer, &to, amount)?;
            Ok((None, None))
        })
    }

    async fn mint(
        &self,
        token: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<PendingTx, ChainError> {
        self.check_method("mint")?;
        let token = token.clone();
        let to = to.clone();
        self.submit("mint", format!("mint {amount} to {to}"), move |state, _| {
            contract_mut(state, &token)?;
            let balance = state
                .balances
                .entry(token)
                .or_default()
                .entry(to)
                .or_default();
            *balance = balance
                .checked_add(amount)
                .ok_or_else(|| ChainError::Reverted("balance overflow".into()))?;
            Ok((None, None))
        })
    }

    async fn approve(
        &self,
        token: &Address,
        spender: &Address,
        amount: u128,
    ) -> Result<PendingTx, ChainError> {
        self.check_method("approve")?;
        let token = token.clone();
        let spender = spender.clone();
        self.submit("approve", format!("approve {amount} for {spender}"), move |state, signer| {
            contract_mut(state, &token)?;
            state
                .allowances
                .entry(token)
                .or_default()
                .insert(allowance_key(signer, &spender), amount);
            Ok((None, None))
        })
    }

    /// Every call whose first two args are `(beneficiary, amount)` pulls
    /// `amount` of the target's token from the signer via allowance. Any
    /// failure leaves the state untouched.
    async fn submit_batch(
        &self,
        target: &Address,
        calls: &[BatchCall],
    ) -> Result<PendingTx, ChainError> {
        for call in calls {
            self.check_method(&call.method)?;
        }
        let target = target.clone();
        let calls = calls.to_vec();
        let label = calls.first().map(|c| c.method.clone()).unwrap_or_default();
        self.submit(&label, format!("batch of {} calls on {target}", calls.len()), move |state, signer| {
            let token = contract_mut(state, &target)?
                .args
                .first()
                .and_then(|v| v.as_str())
                .and_then(|s| Address::parse(s).ok())
                .ok_or_else(|| ChainError::Reverted("batch target has no token".into()))?;

            let mut pulled: u128 = 0;
            for call in &calls {
                let amount = call
                    .args
                    .get(1)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<u128>().ok())
                    .ok_or_else(|| ChainError::Reverted(format!("{}: bad amount", call.method)))?;
                pulled = pulled
                    .checked_add(amount)
                    .ok_or_else(|| ChainError::Reverted("amount overflow".into()))?;
            }

            let key = allowance_key(signer, &target);
            let allowance = state
                .allowances
                .get(&token)
                .and_then(|m| m.get(&key))
                .copied()
                .unwrap_or(0);
            if allowance < pulled {
                return Err(ChainError::Reverted(format!(
                    "allowance {allowance} below batch total {pulled}"
                )));
            }
            move_balance(state, &token, signer, &target, pulled)?;
            state.allowances.entry(token).or_default().insert(key, allowance - pulled);
            contract_mut(state, &target)?.batches.push(calls);
            Ok((None, None))
        })
    }

    async fn wait_for_confirmation(&self, tx: &PendingTx) -> Result<Receipt, ChainError> {
        let receipt = {
            let inner = self.inner.lock();
            let stalled = inner
                .tx_labels
                .get(&tx.hash)
                .is_some_and(|label| inner.faults.stalled.contains(label));
            if stalled {
                None
            } else {
                Some(
                    inner
                        .state
                        .receipts
                        .get(&tx.hash)
                        .cloned()
                        .ok_or_else(|| ChainError::Rpc(format!("unknown transaction {}", tx.hash))),
                )
            }
        };
        match receipt {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn derive_address(seed: &[u8], nonce: u64) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(nonce.to_be_bytes());
    Address::from_bytes(&hasher.finalize())
}

fn is_token_artifact(artifact: &str) -> bool {
    artifact.ends_with("Token") || artifact.ends_with("WETH9")
}

fn allowance_key(owner: &Address, spender: &Address) -> String {
    format!("{owner}:{spender}")
}

fn balance_in(state: &SimState, token: &Address, holder: &Address) -> u128 {
    state
        .balances
        .get(token)
        .and_then(|m| m.get(holder))
        .copied()
        .unwrap_or(0)
}

fn contract_mut<'a>(state: &'a mut SimState, address: &Address) -> Result<&'a mut SimContract, ChainError> {
    state
        .contracts
        .get_mut(address)
        .ok_or_else(|| ChainError::UnknownContract(address.clone()))
}

fn move_balance(
    state: &mut SimState,
    token: &Address,
    from: &Address,
    to: &Address,
    amount: u128,
) -> Result<(), ChainError> {
    let available = balance_in(state, token, from);
    if available < amount {
        return Err(ChainError::Reverted(format!(
            "transfer amount {amount} exceeds balance {available}"
        )));
    }
    let balances = state.balances.entry(token.clone()).or_default();
    balances.insert(from.clone(), available - amount);
    let dest = balances.entry(to.clone()).or_default();
    *dest += amount;
    Ok(())
}
