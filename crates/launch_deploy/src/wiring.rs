//! Post-deployment capability wiring.
//!
//! Grants run only once every required module is recorded. Each grant is
//! confirmed before the next one is submitted.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use launch_chain::{ChainClient, confirm_within};
use launch_core::{Address, LaunchError};

use crate::checkpoint::Checkpoint;
use crate::registry::ModuleRegistry;

/// What is being granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    /// Access-control role, granted through `grant_role`.
    Role(String),
    /// Single-address setter method, called with the grantee as its argument.
    Setter(String),
}

/// Who receives the capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grantee {
    Module(String),
    Account(Address),
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::Module(name) => f.write_str(name),
            Grantee::Account(address) => write!(f, "{address}"),
        }
    }
}

/// A capability held by `target` and handed to `grantee`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub capability: Capability,
    pub grantee: Grantee,
    pub target: String,
    pub optional: bool,
}

impl CapabilityGrant {
    pub fn role(role: &str, target: &str, grantee_module: &str) -> Self {
        Self {
            capability: Capability::Role(role.to_string()),
            grantee: Grantee::Module(grantee_module.to_string()),
            target: target.to_string(),
            optional: false,
        }
    }

    pub fn setter(method: &str, target: &str, grantee: Grantee) -> Self {
        Self {
            capability: Capability::Setter(method.to_string()),
            grantee,
            target: target.to_string(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn label(&self) -> String {
        match &self.capability {
            Capability::Role(role) => format!("{}.{role} -> {}", self.target, self.grantee),
            Capability::Setter(method) => format!("{}.{method}({})", self.target, self.grantee),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GrantOutcome {
    Applied { tx_hash: String },
    SkippedOptional { reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WiringReport {
    pub grants: Vec<(String, GrantOutcome)>,
    pub cancelled: bool,
}

impl WiringReport {
    pub fn applied_count(&self) -> usize {
        self.grants
            .iter()
            .filter(|(_, o)| matches!(o, GrantOutcome::Applied { .. }))
            .count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &(String, GrantOutcome)> {
        self.grants
            .iter()
            .filter(|(_, o)| matches!(o, GrantOutcome::SkippedOptional { .. }))
    }
}

/// Applies capability grants against recorded deployments.
pub struct Wiring {
    chain: Arc<dyn ChainClient>,
    confirmation_timeout: Duration,
    abort: Arc<AtomicBool>,
}

impl Wiring {
    pub fn new(chain: Arc<dyn ChainClient>, confirmation_timeout: Duration) -> Self {
        Self {
            chain,
            confirmation_timeout,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Apply `grants` in order.
    ///
    /// Fails up front if a required module is not recorded. A failing
    /// optional grant is logged and skipped; a failing required grant stops
    /// the pass with [`LaunchError::Wiring`].
    pub async fn apply(
        &self,
        grants: &[CapabilityGrant],
        registry: &ModuleRegistry,
        checkpoint: &Checkpoint,
    ) -> Result<WiringReport, LaunchError> {
        if let Some(missing) = registry
            .iter()
            .find(|m| m.required && !checkpoint.has(&m.name))
        {
            return Err(LaunchError::Wiring {
                grant: "*".to_string(),
                reason: format!("required module '{}' is not deployed", missing.name),
            });
        }

        let mut report = WiringReport::default();
        for grant in grants {
            if self.abort.load(Ordering::SeqCst) {
                warn!("abort requested, stopping wiring");
                report.cancelled = true;
                break;
            }
            let label = grant.label();
            match self.apply_one(grant, checkpoint).await {
                Ok(tx_hash) => {
                    info!(grant = %label, tx = %tx_hash, "capability granted");
                    report.grants.push((label, GrantOutcome::Applied { tx_hash }));
                }
                Err(reason) if grant.optional => {
                    warn!(grant = %label, %reason, "optional grant skipped");
                    report.grants.push((label, GrantOutcome::SkippedOptional { reason }));
                }
                Err(reason) => {
                    return Err(LaunchError::Wiring { grant: label, reason });
                }
            }
        }
        Ok(report)
    }

    async fn apply_one(
        &self,
        grant: &CapabilityGrant,
        checkpoint: &Checkpoint,
    ) -> Result<String, String> {
        let target = checkpoint
            .address_of(&grant.target)
            .map_err(|_| format!("target '{}' is not deployed", grant.target))?;
        let grantee = match &grant.grantee {
            Grantee::Account(address) => address.clone(),
            Grantee::Module(name) => checkpoint
                .address_of(name)
                .map_err(|_| format!("grantee '{name}' is not deployed"))?,
        };
        let submitted = match &grant.capability {
            Capability::Role(role) => self.chain.grant_role(&target, role, &grantee).await,
            Capability::Setter(method) => {
                let args = vec![serde_json::json!(grantee.as_str())];
                self.chain.call(&target, method, &args).await
            }
        };
        let tx = submitted.map_err(|e| e.to_string())?;
        let receipt = confirm_within(self.chain.as_ref(), &tx, self.confirmation_timeout)
            .await
            .map_err(|e| e.to_string())?;
        Ok(receipt.tx_hash)
    }
}
