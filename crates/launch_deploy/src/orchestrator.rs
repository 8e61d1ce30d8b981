//! Resumable deployment runs.
//!
//! Walks the resolved module order, skips modules already in the checkpoint,
//! deploys the rest, and records each one the moment its confirmation
//! arrives. Re-running after any failure resumes at the first missing module.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use launch_chain::{ChainClient, InitArgs, confirm_within};
use launch_core::{Address, LaunchConfig, LaunchError};

use crate::checkpoint::{Checkpoint, DeploymentRecord};
use crate::registry::{BuildContext, ModuleKind, ModuleRegistry, ModuleSpec};

/// Lifecycle of one module within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleState {
    Pending,
    Resolving,
    Deploying,
    Recorded,
    /// `Deployment` for anything the module itself caused, `Timeout` when
    /// confirmation never arrived.
    Failed { error: LaunchError },
    /// Already present in the checkpoint.
    Skipped,
}

impl ModuleState {
    /// The module's address is available to dependents.
    pub fn is_available(&self) -> bool {
        matches!(self, ModuleState::Recorded | ModuleState::Skipped)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Redeploy even when the checkpoint already has an entry.
    pub force_redeploy: bool,
    /// Limit the run to this module and its transitive dependencies.
    pub only: Option<String>,
}

impl DeployOptions {
    fn forces(&self, name: &str) -> bool {
        self.force_redeploy && self.only.as_deref().is_none_or(|only| only == name)
    }
}

#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    pub name: String,
    pub required: bool,
    pub state: ModuleState,
    pub address: Option<Address>,
}

/// Summary of a run.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub run_id: String,
    /// In resolved order.
    pub outcomes: Vec<ModuleOutcome>,
    /// Required module whose failure stopped the run.
    pub aborted_by: Option<String>,
    /// The abort flag was raised before the run finished.
    pub cancelled: bool,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.aborted_by.is_none()
            && !self.cancelled
            && self.outcomes.iter().all(|o| o.state.is_available())
    }

    pub fn state_of(&self, name: &str) -> Option<&ModuleState> {
        self.outcomes.iter().find(|o| o.name == name).map(|o| &o.state)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ModuleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.state, ModuleState::Failed { .. }))
    }

    pub fn recorded_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == ModuleState::Recorded)
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == ModuleState::Skipped)
            .count()
    }
}

/// Drives deployments for one registry against one chain.
pub struct Orchestrator {
    registry: ModuleRegistry,
    chain: Arc<dyn ChainClient>,
    config: LaunchConfig,
    confirmation_timeout: Duration,
    abort: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(registry: ModuleRegistry, chain: Arc<dyn ChainClient>, config: LaunchConfig) -> Self {
        let confirmation_timeout = Duration::from_secs(config.confirmation_timeout_secs);
        Self {
            registry,
            chain,
            config,
            confirmation_timeout,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Share an externally owned abort flag (e.g. one set by a signal handler).
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Deploy every module that is not yet recorded.
    ///
    /// Registry problems (cycles, unknown `only` module) are returned as
    /// errors before any chain interaction. Per-module failures, including a
    /// checkpoint write that fails after confirmation, are reported in the
    /// [`DeployReport`].
    pub async fn run(
        &self,
        checkpoint: &mut Checkpoint,
        options: &DeployOptions,
    ) -> Result<DeployReport, LaunchError> {
        let order = match &options.only {
            Some(name) => self.registry.closure(name)?,
            None => self.registry.resolve_order()?,
        };
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("deploy", run_id = %run_id, network = %self.config.network);
        self.run_order(order, checkpoint, options, run_id)
            .instrument(span)
            .await
    }

    async fn run_order(
        &self,
        order: Vec<&ModuleSpec>,
        checkpoint: &mut Checkpoint,
        options: &DeployOptions,
        run_id: String,
    ) -> Result<DeployReport, LaunchError> {
        info!(modules = order.len(), forced = options.force_redeploy, "deployment run started");

        let mut states: HashMap<String, ModuleState> = order
            .iter()
            .map(|m| (m.name.clone(), ModuleState::Pending))
            .collect();
        let mut aborted_by = None;
        let mut cancelled = false;
        let signer = self.chain.signer();

        for spec in &order {
            if self.abort.load(Ordering::SeqCst) {
                warn!("abort requested, stopping before {}", spec.name);
                cancelled = true;
                break;
            }

            if checkpoint.has(&spec.name) && !options.forces(&spec.name) {
                info!(module = %spec.name, "already deployed, skipping");
                states.insert(spec.name.clone(), ModuleState::Skipped);
                continue;
            }

            states.insert(spec.name.clone(), ModuleState::Resolving);
            let outcome = match self.resolve_dependencies(spec, &states, checkpoint) {
                Ok(deps) => {
                    let ctx = BuildContext {
                        deps: &deps,
                        config: &self.config,
                        signer: &signer,
                    };
                    match (spec.init_args)(&ctx) {
                        Ok(args) => {
                            states.insert(spec.name.clone(), ModuleState::Deploying);
                            self.deploy_one(spec, args, options, checkpoint).await
                        }
                        Err(e) => Err(deployment_error(spec, format!("could not build init args: {e}"))),
                    }
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    states.insert(spec.name.clone(), ModuleState::Recorded);
                }
                Err(error) if spec.required => {
                    error!(module = %spec.name, %error, "required module failed, aborting run");
                    states.insert(spec.name.clone(), ModuleState::Failed { error });
                    aborted_by = Some(spec.name.clone());
                    break;
                }
                Err(error) => {
                    let affected = self.registry.dependents(&spec.name);
                    warn!(
                        module = %spec.name,
                        %error,
                        ?affected,
                        "optional module failed, continuing without it"
                    );
                    states.insert(spec.name.clone(), ModuleState::Failed { error });
                }
            }
        }

        let outcomes: Vec<ModuleOutcome> = order
            .iter()
            .map(|spec| {
                let state = states.remove(&spec.name).unwrap_or(ModuleState::Pending);
                let address = if state.is_available() {
                    checkpoint.address_of(&spec.name).ok()
                } else {
                    None
                };
                ModuleOutcome {
                    name: spec.name.clone(),
                    required: spec.required,
                    state,
                    address,
                }
            })
            .collect();

        let report = DeployReport {
            run_id,
            outcomes,
            aborted_by,
            cancelled,
        };
        info!(
            recorded = report.recorded_count(),
            skipped = report.skipped_count(),
            failed = report.failed().count(),
            success = report.is_success(),
            "deployment run finished"
        );
        Ok(report)
    }

    /// Addresses of `spec`'s dependencies, or why it cannot proceed.
    fn resolve_dependencies(
        &self,
        spec: &ModuleSpec,
        states: &HashMap<String, ModuleState>,
        checkpoint: &Checkpoint,
    ) -> Result<BTreeMap<String, Address>, LaunchError> {
        let mut deps = BTreeMap::new();
        for dep in &spec.dependencies {
            match states.get(dep) {
                Some(ModuleState::Failed { .. }) => {
                    return Err(deployment_error(spec, format!("dependency '{dep}' failed")));
                }
                Some(state) if !state.is_available() => {
                    return Err(deployment_error(spec, format!("dependency '{dep}' is not deployed")));
                }
                _ => {}
            }
            let address = checkpoint.address_of(dep).map_err(|_| {
                deployment_error(spec, format!("dependency '{dep}' has no checkpoint entry"))
            })?;
            deps.insert(dep.clone(), address);
        }
        Ok(deps)
    }

    /// Submit, confirm and record one module.
    ///
    /// Nothing is written to the checkpoint unless confirmation arrives.
    async fn deploy_one(
        &self,
        spec: &ModuleSpec,
        args: InitArgs,
        options: &DeployOptions,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), LaunchError> {
        info!(module = %spec.name, artifact = %spec.artifact, kind = ?spec.kind, "deploying");
        let submitted = match spec.kind {
            ModuleKind::Simple => self.chain.deploy_simple(&spec.artifact, &args).await,
            ModuleKind::Upgradeable => self.chain.deploy_upgradeable(&spec.artifact, &args).await,
        };
        let tx = submitted.map_err(|e| deployment_error(spec, e.to_string()))?;
        let receipt = confirm_within(self.chain.as_ref(), &tx, self.confirmation_timeout)
            .await
            .map_err(|e| match e {
                LaunchError::Timeout { .. } => e,
                other => deployment_error(spec, other.to_string()),
            })?;
        let address = receipt
            .contract_address
            .ok_or_else(|| deployment_error(spec, "receipt carries no contract address".into()))?;

        let record = DeploymentRecord::new(&spec.name, address.clone(), spec.kind)
            .with_implementation(receipt.implementation_address)
            .with_args(args);
        let stored = if options.forces(&spec.name) {
            checkpoint.put_forced(record)
        } else {
            checkpoint.put(record)
        };
        if let Err(e) = stored {
            error!(module = %spec.name, %address, "deployed but not recorded: {e}");
            return Err(deployment_error(
                spec,
                format!("deployed at {address} but checkpoint write failed: {e}"),
            ));
        }
        info!(module = %spec.name, %address, tx = %receipt.tx_hash, "deployed");
        Ok(())
    }
}

fn deployment_error(spec: &ModuleSpec, reason: String) -> LaunchError {
    LaunchError::Deployment {
        module: spec.name.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launch_chain::SimulatedChain;
    use launch_core::config::KEY_VAULT_ADMIN;
    use serde_json::json;

    fn config() -> LaunchConfig {
        let values = BTreeMap::from([(
            KEY_VAULT_ADMIN.to_string(),
            "0x00000000000000000000000000000000000000aa".to_string(),
        )]);
        LaunchConfig::from_map(&values).unwrap()
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry
            .register(ModuleSpec::upgradeable("token", "Token").with_args(|ctx| {
                Ok(vec![json!(ctx.config.token_name), json!(ctx.signer.as_str())])
            }))
            .unwrap();
        registry
            .register(
                ModuleSpec::simple("vault", "Vault")
                    .depends_on(&["token"])
                    .with_args(|ctx| Ok(vec![json!(ctx.dep("token")?.as_str())])),
            )
            .unwrap();
        registry
            .register(ModuleSpec::simple("bridge", "Bridge").depends_on(&["token"]).optional())
            .unwrap();
        registry
            .register(
                ModuleSpec::simple("bridge_relay", "Relay")
                    .depends_on(&["bridge"])
                    .optional(),
            )
            .unwrap();
        registry
            .register(ModuleSpec::simple("rewards", "Rewards").depends_on(&["vault"]))
            .unwrap();
        registry
    }

    fn setup() -> (tempfile::TempDir, Arc<SimulatedChain>, Checkpoint) {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(tmp.path().join("hardhat.json")).unwrap();
        (tmp, Arc::new(SimulatedChain::new()), checkpoint)
    }

    fn orchestrator(chain: &Arc<SimulatedChain>) -> Orchestrator {
        Orchestrator::new(registry(), chain.clone(), config())
    }

    #[tokio::test]
    async fn fresh_run_records_everything_with_real_addresses() {
        let (_tmp, chain, mut checkpoint) = setup();
        let report = orchestrator(&chain)
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.recorded_count(), 5);
        let token = checkpoint.get("token").unwrap();
        assert!(token.implementation_address.is_some());
        let vault = checkpoint.get("vault").unwrap();
        assert_eq!(vault.args, vec![json!(token.address.as_str())]);
    }

    #[tokio::test]
    async fn second_run_deploys_nothing() {
        let (_tmp, chain, mut checkpoint) = setup();
        let orchestrator = orchestrator(&chain);
        orchestrator
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();
        let report = orchestrator
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();

        assert_eq!(report.skipped_count(), 5);
        assert_eq!(chain.deploy_count("Token"), 1);
        assert_eq!(chain.deploy_count("Rewards"), 1);
    }

    #[tokio::test]
    async fn optional_failure_marks_dependents_and_continues() {
        let (_tmp, chain, mut checkpoint) = setup();
        chain.fail_deploys_of("Bridge");
        let report = orchestrator(&chain)
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(report.aborted_by.is_none());
        assert!(matches!(report.state_of("bridge"), Some(ModuleState::Failed { .. })));
        assert!(matches!(
            report.state_of("bridge_relay"),
            Some(ModuleState::Failed {
                error: LaunchError::Deployment { module, reason }
            }) if module == "bridge_relay" && reason.contains("bridge")
        ));
        assert_eq!(chain.deploy_count("Relay"), 0);
        assert_eq!(report.state_of("rewards"), Some(&ModuleState::Recorded));
    }

    #[tokio::test]
    async fn required_failure_aborts_and_leaves_rest_pending() {
        let (_tmp, chain, mut checkpoint) = setup();
        chain.fail_deploys_of("Vault");
        let report = orchestrator(&chain)
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();

        assert_eq!(report.aborted_by.as_deref(), Some("vault"));
        assert_eq!(report.state_of("token"), Some(&ModuleState::Recorded));
        assert_eq!(report.state_of("rewards"), Some(&ModuleState::Pending));
        assert!(!checkpoint.has("vault"));

        chain.clear_faults();
        let rerun = orchestrator(&chain)
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();
        assert!(rerun.is_success());
        assert_eq!(rerun.state_of("token"), Some(&ModuleState::Skipped));
        assert_eq!(chain.deploy_count("Token"), 1);
    }

    #[tokio::test]
    async fn timeout_is_not_recorded_or_retried() {
        let (_tmp, chain, mut checkpoint) = setup();
        chain.stall_confirmations_of("Vault");
        let report = orchestrator(&chain)
            .with_confirmation_timeout(Duration::from_millis(50))
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            report.state_of("vault"),
            Some(ModuleState::Failed {
                error: LaunchError::Timeout { .. }
            })
        ));
        assert_eq!(chain.deploy_count("Vault"), 1);
        assert!(!checkpoint.has("vault"));
    }

    #[tokio::test]
    async fn force_redeploy_of_one_module_replaces_only_it() {
        let (_tmp, chain, mut checkpoint) = setup();
        let orchestrator = orchestrator(&chain);
        orchestrator
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();
        let before = checkpoint.address_of("vault").unwrap();
        let token_before = checkpoint.address_of("token").unwrap();

        let options = DeployOptions {
            force_redeploy: true,
            only: Some("vault".into()),
        };
        let report = orchestrator.run(&mut checkpoint, &options).await.unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.state_of("token"), Some(&ModuleState::Skipped));
        assert_ne!(checkpoint.address_of("vault").unwrap(), before);
        assert_eq!(checkpoint.address_of("token").unwrap(), token_before);
        assert_eq!(chain.deploy_count("Token"), 1);
    }

    #[tokio::test]
    async fn abort_flag_stops_before_next_module() {
        let (_tmp, chain, mut checkpoint) = setup();
        let orchestrator = orchestrator(&chain);
        orchestrator.abort_handle().store(true, Ordering::SeqCst);
        let report = orchestrator
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.recorded_count(), 0);
        assert_eq!(chain.deploy_count("Token"), 0);
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_any_deployment() {
        let (_tmp, chain, mut checkpoint) = setup();
        let mut registry = ModuleRegistry::new();
        registry
            .register_all(vec![
                ModuleSpec::simple("A", "A").depends_on(&["B"]),
                ModuleSpec::simple("B", "B").depends_on(&["A"]),
            ])
            .unwrap();
        let result = Orchestrator::new(registry, chain.clone(), config())
            .run(&mut checkpoint, &DeployOptions::default())
            .await;

        assert!(matches!(result, Err(LaunchError::CyclicDependency { .. })));
        assert_eq!(chain.deploy_count("A") + chain.deploy_count("B"), 0);
    }
}
