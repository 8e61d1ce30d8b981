use std::collections::BTreeMap;
use std::sync::Arc;

use launch_chain::SimulatedChain;
use launch_core::LaunchConfig;
use launch_core::config::{KEY_USDC, KEY_VAULT_ADMIN};
use launch_deploy::manifest::{self, atlas_grants, atlas_registry};
use launch_deploy::*;

const ADMIN: &str = "0x00000000000000000000000000000000000000aa";
const USDC: &str = "0x00000000000000000000000000000000000000cc";

fn config() -> LaunchConfig {
    let values = BTreeMap::from([
        (KEY_VAULT_ADMIN.to_string(), ADMIN.to_string()),
        (KEY_USDC.to_string(), USDC.to_string()),
    ]);
    LaunchConfig::from_map(&values).unwrap()
}

#[tokio::test]
async fn test_interrupted_launch_resumes_without_redeploying() {
    let tmp = tempfile::tempdir().unwrap();
    let checkpoint_path = tmp.path().join("deployments").join("hardhat.json");
    let chain_path = tmp.path().join("deployments").join("hardhat.chain.json");
    let config = config();

    // First attempt: the vault reverts, stopping the run.
    let first_token = {
        let chain = Arc::new(SimulatedChain::open(&chain_path).unwrap());
        chain.fail_deploys_of("vaults/AtlasVault");
        let mut checkpoint = Checkpoint::open(&checkpoint_path).unwrap();
        let orchestrator =
            Orchestrator::new(atlas_registry(&config).unwrap(), chain.clone(), config.clone());
        let report = orchestrator
            .run(&mut checkpoint, &DeployOptions::default())
            .await
            .unwrap();
        assert_eq!(report.aborted_by.as_deref(), Some(manifest::VAULT));
        assert!(checkpoint.has(manifest::TOKEN));
        assert!(!checkpoint.has(manifest::REWARDS));
        checkpoint.address_of(manifest::TOKEN).unwrap()
    };

    // Second attempt in a fresh process view of the same files.
    let chain = Arc::new(SimulatedChain::open(&chain_path).unwrap());
    let mut checkpoint = Checkpoint::open(&checkpoint_path).unwrap();
    let orchestrator =
        Orchestrator::new(atlas_registry(&config).unwrap(), chain.clone(), config.clone());
    let report = orchestrator
        .run(&mut checkpoint, &DeployOptions::default())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.state_of(manifest::TOKEN), Some(&ModuleState::Skipped));
    assert_eq!(report.state_of(manifest::VAULT), Some(&ModuleState::Recorded));
    assert_eq!(chain.deploy_count("token/AtlasToken"), 0);
    assert_eq!(checkpoint.address_of(manifest::TOKEN).unwrap(), first_token);

    let wiring = Wiring::new(chain.clone(), std::time::Duration::from_secs(5))
        .apply(&atlas_grants(&config), orchestrator.registry(), &checkpoint)
        .await
        .unwrap();
    assert_eq!(wiring.applied_count(), 5);

    let token = checkpoint.address_of(manifest::TOKEN).unwrap();
    let vault = checkpoint.address_of(manifest::VAULT).unwrap();
    assert!(chain.has_role(&token, manifest::MINTER_ROLE, &vault));
}

#[tokio::test]
async fn test_every_recorded_dependency_address_is_real() {
    let tmp = tempfile::tempdir().unwrap();
    let chain = Arc::new(SimulatedChain::new());
    let mut checkpoint = Checkpoint::open(tmp.path().join("c.json")).unwrap();
    let config = config();
    let report = Orchestrator::new(atlas_registry(&config).unwrap(), chain.clone(), config)
        .run(&mut checkpoint, &DeployOptions::default())
        .await
        .unwrap();
    assert!(report.is_success());

    for record in checkpoint.modules() {
        assert!(!record.address.is_zero());
        assert!(chain.contract_artifact(&record.address).is_some());
        for arg in &record.args {
            if let Some(raw) = arg.as_str().filter(|s| s.starts_with("0x")) {
                let address = raw.parse().unwrap();
                let known = chain.contract_artifact(&address).is_some()
                    || raw == ADMIN
                    || raw == USDC;
                assert!(known, "{} was built with unknown address {raw}", record.module_name);
            }
        }
    }
}

#[tokio::test]
async fn test_deploying_one_module_requires_recorded_dependencies() {
    let tmp = tempfile::tempdir().unwrap();
    let chain = Arc::new(SimulatedChain::new());
    let mut checkpoint = Checkpoint::open(tmp.path().join("c.json")).unwrap();
    let config = config();
    let orchestrator =
        Orchestrator::new(atlas_registry(&config).unwrap(), chain.clone(), config.clone());

    let options = DeployOptions {
        force_redeploy: false,
        only: Some(manifest::PRESALE.to_string()),
    };
    let report = orchestrator.run(&mut checkpoint, &options).await.unwrap();
    let names: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec![manifest::TOKEN, manifest::VESTING, manifest::PRESALE]);
    assert!(report.is_success());
    assert!(!checkpoint.has(manifest::VAULT));
}
