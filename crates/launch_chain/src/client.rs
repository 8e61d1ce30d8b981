use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use launch_core::{Address, LaunchError};

/// Constructor / initializer arguments, kept as JSON so they can be recorded
/// in the checkpoint and replayed for verification.
pub type InitArgs = Vec<serde_json::Value>;

/// Failures reported by the chain collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("no contract at {0}")]
    UnknownContract(Address),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl From<ChainError> for LaunchError {
    fn from(err: ChainError) -> Self {
        LaunchError::Chain(err.to_string())
    }
}

/// A broadcast transaction that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub hash: String,
    /// Human-readable label used in logs and timeout errors.
    pub description: String,
}

/// Confirmation of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block: u64,
    /// Deployed contract (the proxy for upgradeable deployments).
    pub contract_address: Option<Address>,
    /// Implementation behind a proxy deployment.
    pub implementation_address: Option<Address>,
}

/// One call inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCall {
    pub method: String,
    pub args: InitArgs,
}

/// The execution environment the launch pipeline drives.
///
/// All state-changing methods return a [`PendingTx`]; callers must await
/// [`ChainClient::wait_for_confirmation`] before relying on its effects.
/// Token transfers and approvals are sent from [`ChainClient::signer`].
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Account that signs every transaction.
    fn signer(&self) -> Address;

    async fn deploy_simple(&self, artifact: &str, args: &InitArgs) -> Result<PendingTx, ChainError>;

    /// Deploy an implementation behind a proxy and run its initializer.
    async fn deploy_upgradeable(
        &self,
        artifact: &str,
        args: &InitArgs,
    ) -> Result<PendingTx, ChainError>;

    async fn call(
        &self,
        target: &Address,
        method: &str,
        args: &InitArgs,
    ) -> Result<PendingTx, ChainError>;

    /// Grant `role` on `target` to `grantee`. Re-granting is a no-op on chain.
    async fn grant_role(
        &self,
        target: &Address,
        role: &str,
        grantee: &Address,
    ) -> Result<PendingTx, ChainError>;

    async fn balance_of(&self, token: &Address, holder: &Address) -> Result<u128, ChainError>;

    async fn decimals(&self, token: &Address) -> Result<u8, ChainError>;

    async fn transfer(
        &self,
        token: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<PendingTx, ChainError>;

    async fn mint(&self, token: &Address, to: &Address, amount: u128)
    -> Result<PendingTx, ChainError>;

    async fn approve(
        &self,
        token: &Address,
        spender: &Address,
        amount: u128,
    ) -> Result<PendingTx, ChainError>;

    /// Submit `calls` against `target` as one all-or-nothing transaction.
    async fn submit_batch(
        &self,
        target: &Address,
        calls: &[BatchCall],
    ) -> Result<PendingTx, ChainError>;

    async fn wait_for_confirmation(&self, tx: &PendingTx) -> Result<Receipt, ChainError>;
}

/// Wait for `tx` with an upper bound.
///
/// A timeout is reported as [`LaunchError::Timeout`] and is never retried: the
/// transaction may still land, and resubmitting could execute it twice.
pub async fn confirm_within<C: ChainClient + ?Sized>(
    client: &C,
    tx: &PendingTx,
    timeout: Duration,
) -> Result<Receipt, LaunchError> {
    debug!(tx = %tx.hash, what = %tx.description, "awaiting confirmation");
    match tokio::time::timeout(timeout, client.wait_for_confirmation(tx)).await {
        Ok(Ok(receipt)) => Ok(receipt),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(LaunchError::Timeout {
            operation: tx.description.clone(),
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_error_maps_to_launch_error() {
        let err: LaunchError = ChainError::Reverted("out of gas".into()).into();
        assert_eq!(err, LaunchError::Chain("transaction reverted: out of gas".into()));
    }

    #[test]
    fn receipt_serializes() {
        let receipt = Receipt {
            tx_hash: "0xabc".into(),
            block: 7,
            contract_address: Some(Address::zero()),
            implementation_address: None,
        };
        let json = serde_json::to_string(&receipt).unwrap();
        let parsed: Receipt = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, receipt);
    }
}
