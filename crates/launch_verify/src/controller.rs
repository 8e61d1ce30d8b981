//! Best-effort source verification with rate-limit-aware retries.
//!
//! Modules are verified one at a time with a fixed pause between them. A
//! rate-limited request is retried with exponential backoff up to a cap.
//! Nothing here can fail a deployment or a funding run: every outcome is
//! reported, none is returned as an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use launch_chain::InitArgs;
use launch_core::{Address, VerifySettings};
use launch_deploy::{Checkpoint, DeploymentRecord};

/// Response of one verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyOutcome {
    Verified,
    AlreadyVerified,
    /// Retryable: rate limits and transient service failures.
    RateLimited,
    /// Not retryable, e.g. the arguments do not match the bytecode.
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub module: String,
    pub address: Address,
    pub implementation: Option<Address>,
    /// Constructor or initializer arguments recorded at deployment.
    pub args: InitArgs,
}

impl From<&DeploymentRecord> for VerifyRequest {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            module: record.module_name.clone(),
            address: record.address.clone(),
            implementation: record.implementation_address.clone(),
            args: record.args.clone(),
        }
    }
}

impl VerifyRequest {
    /// Requests for the recorded modules among `order`, in that order.
    /// Names without a checkpoint entry are skipped.
    pub fn for_recorded<'a>(
        checkpoint: &Checkpoint,
        order: impl IntoIterator<Item = &'a str>,
    ) -> Vec<Self> {
        order
            .into_iter()
            .filter_map(|name| checkpoint.get(name).ok())
            .map(Self::from)
            .collect()
    }
}

/// External verification service.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: &VerifyRequest) -> VerifyOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause between modules, independent of backoff.
    pub inter_request_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl From<&VerifySettings> for RetryPolicy {
    fn from(settings: &VerifySettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_retries: settings.max_retries,
            inter_request_delay: Duration::from_millis(settings.inter_request_delay_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&VerifySettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    AlreadyVerified,
    /// Still rate limited after the last permitted retry.
    GaveUp,
    Fatal { reason: String },
}

impl VerificationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified | Self::AlreadyVerified)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleVerification {
    pub module: String,
    pub address: Address,
    pub status: VerificationStatus,
    pub retries: u32,
    /// Backoff delays actually waited, in order.
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub results: Vec<ModuleVerification>,
    pub cancelled: bool,
}

impl VerificationReport {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ModuleVerification> {
        self.results.iter().filter(|r| !r.status.is_success())
    }
}

pub struct RetryController {
    verifier: Arc<dyn Verifier>,
    policy: RetryPolicy,
    abort: Arc<AtomicBool>,
}

impl RetryController {
    pub fn new(verifier: Arc<dyn Verifier>, policy: RetryPolicy) -> Self {
        Self {
            verifier,
            policy,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Verify each request in order.
    pub async fn run(&self, requests: &[VerifyRequest]) -> VerificationReport {
        let mut report = VerificationReport::default();
        for (i, request) in requests.iter().enumerate() {
            if self.abort.load(Ordering::SeqCst) {
                warn!("abort requested, stopping verification");
                report.cancelled = true;
                break;
            }
            if i > 0 && !self.policy.inter_request_delay.is_zero() {
                tokio::time::sleep(self.policy.inter_request_delay).await;
            }
            report.results.push(self.verify_one(request).await);
        }
        info!(
            verified = report.success_count(),
            failed = report.failures().count(),
            "verification finished"
        );
        report
    }

    async fn verify_one(&self, request: &VerifyRequest) -> ModuleVerification {
        let mut retries = 0u32;
        let mut delays = Vec::new();
        let status = loop {
            match self.verifier.verify(request).await {
                VerifyOutcome::Verified => break VerificationStatus::Verified,
                VerifyOutcome::AlreadyVerified => break VerificationStatus::AlreadyVerified,
                VerifyOutcome::Fatal(reason) => break VerificationStatus::Fatal { reason },
                VerifyOutcome::RateLimited if retries >= self.policy.max_retries => {
                    break VerificationStatus::GaveUp;
                }
                VerifyOutcome::RateLimited => {
                    retries += 1;
                    let delay = self.policy.backoff(retries);
                    warn!(
                        module = %request.module,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match &status {
            VerificationStatus::Fatal { reason } => {
                warn!(module = %request.module, address = %request.address, %reason, "verification failed");
            }
            VerificationStatus::GaveUp => {
                warn!(module = %request.module, retries, "verification gave up after retries");
            }
            _ => info!(module = %request.module, address = %request.address, ?status, "verified"),
        }
        ModuleVerification {
            module: request.module.clone(),
            address: request.address.clone(),
            status,
            retries,
            delays,
        }
    }
}
