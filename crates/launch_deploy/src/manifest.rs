//! The Atlas launch: modules, their dependencies, and post-deploy grants.

use serde_json::{Value, json};

use launch_core::config::{SINK_LP_REWARDS, SINK_PRESALE, SINK_STAKING_REWARDS};
use launch_core::{Address, LaunchConfig, LaunchError};

use crate::registry::{ModuleRegistry, ModuleSpec};
use crate::wiring::{CapabilityGrant, Grantee};

pub const TOKEN: &str = "AtlasToken";
pub const VESTING: &str = "Vesting";
pub const PRESALE: &str = SINK_PRESALE;
pub const LAUNCHPAD: &str = "Launchpad";
pub const BRIDGE: &str = "AtlasBridge";
pub const VAULT: &str = "AtlasVault";
pub const WETH: &str = "WETH";
pub const FACTORY: &str = "AtlasFactory";
pub const ROUTER: &str = "AtlasRouter";
pub const REWARDS: &str = "RewardDistributorV2";
pub const LP_SINK: &str = SINK_LP_REWARDS;
pub const STAKING_SINK: &str = SINK_STAKING_REWARDS;

pub const MINTER_ROLE: &str = "MINTER_ROLE";
pub const BRIDGE_ROLE: &str = "BRIDGE_ROLE";

fn addr(address: &Address) -> Value {
    json!(address.as_str())
}

/// Presale cap: the amount allocated to the presale sink, `"0"` if none.
fn presale_cap(config: &LaunchConfig) -> &str {
    config
        .allocations
        .iter()
        .find(|(sink, _)| sink == PRESALE)
        .map_or("0", |(_, amount)| amount.as_str())
}

/// Build the registry for `config`. A WETH module is only registered when no
/// external WETH address is configured.
pub fn atlas_registry(config: &LaunchConfig) -> Result<ModuleRegistry, LaunchError> {
    let mut registry = ModuleRegistry::new();

    registry.register(
        ModuleSpec::upgradeable(TOKEN, "token/AtlasToken").with_args(|ctx| {
            Ok(vec![
                json!(ctx.config.token_name),
                json!(ctx.config.token_symbol),
                addr(&ctx.config.vault_admin),
            ])
        }),
    )?;

    registry.register(
        ModuleSpec::simple(VESTING, "presale/Vesting")
            .depends_on(&[TOKEN])
            .with_args(|ctx| Ok(vec![addr(ctx.dep(TOKEN)?), addr(&ctx.config.vault_admin)])),
    )?;

    // Without USDC_ADDRESS the sale takes the native currency (zero address).
    registry.register(
        ModuleSpec::simple(PRESALE, "presale/Presale")
            .depends_on(&[TOKEN, VESTING])
            .with_args(|ctx| {
                let payment = ctx.config.payment_token.clone().unwrap_or_else(Address::zero);
                Ok(vec![
                    addr(ctx.dep(TOKEN)?),
                    addr(ctx.dep(VESTING)?),
                    addr(&ctx.config.vault_admin),
                    addr(&payment),
                    json!(ctx.config.presale_price),
                    json!(presale_cap(ctx.config)),
                    json!(ctx.config.vesting.cliff_seconds),
                    json!(ctx.config.vesting.duration_seconds),
                ])
            }),
    )?;

    registry.register(
        ModuleSpec::simple(LAUNCHPAD, "launchpad/Launchpad")
            .depends_on(&[TOKEN])
            .optional()
            .with_args(|ctx| Ok(vec![addr(ctx.dep(TOKEN)?), addr(&ctx.config.vault_admin)])),
    )?;

    registry.register(
        ModuleSpec::simple(BRIDGE, "token/AtlasBridge")
            .depends_on(&[TOKEN])
            .optional()
            .with_args(|ctx| Ok(vec![addr(ctx.dep(TOKEN)?)])),
    )?;

    registry.register(
        ModuleSpec::upgradeable(VAULT, "vaults/AtlasVault")
            .depends_on(&[TOKEN])
            .with_args(|ctx| Ok(vec![addr(ctx.dep(TOKEN)?), addr(&ctx.config.vault_admin)])),
    )?;

    let mut router_deps = vec![FACTORY];
    if config.weth.is_none() {
        registry.register(ModuleSpec::simple(WETH, "WETH9"))?;
        router_deps.push(WETH);
    }

    registry.register(
        ModuleSpec::simple(FACTORY, "amm/AtlasFactory")
            .with_args(|ctx| Ok(vec![addr(&ctx.config.fee_to_setter)])),
    )?;

    registry.register(
        ModuleSpec::simple(ROUTER, "amm/AtlasRouter")
            .depends_on(&router_deps)
            .with_args(|ctx| {
                let weth = match &ctx.config.weth {
                    Some(external) => external,
                    None => ctx.dep(WETH)?,
                };
                Ok(vec![addr(ctx.dep(FACTORY)?), addr(weth)])
            }),
    )?;

    registry.register(
        ModuleSpec::upgradeable(REWARDS, "rewards/RewardDistributorV2")
            .depends_on(&[VAULT, TOKEN])
            .with_args(|ctx| Ok(vec![addr(ctx.dep(VAULT)?), addr(ctx.dep(TOKEN)?)])),
    )?;

    for (name, artifact) in [
        (LP_SINK, "rewards/LPRewardSink"),
        (STAKING_SINK, "rewards/StakingRewardSink"),
    ] {
        registry.register(
            ModuleSpec::upgradeable(name, artifact)
                .depends_on(&[VAULT])
                .with_args(|ctx| Ok(vec![addr(ctx.dep(VAULT)?)])),
        )?;
    }

    Ok(registry)
}

/// Grants applied after deployment, in order.
pub fn atlas_grants(config: &LaunchConfig) -> Vec<CapabilityGrant> {
    vec![
        CapabilityGrant::role(BRIDGE_ROLE, TOKEN, BRIDGE).optional(),
        CapabilityGrant::role(MINTER_ROLE, TOKEN, VAULT),
        CapabilityGrant::setter(
            "setFeeTo",
            FACTORY,
            Grantee::Account(config.fee_to_setter.clone()),
        ),
        CapabilityGrant::setter("setLpSink", REWARDS, Grantee::Module(LP_SINK.to_string()))
            .optional(),
        CapabilityGrant::setter(
            "setStakingSink",
            REWARDS,
            Grantee::Module(STAKING_SINK.to_string()),
        )
        .optional(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BuildContext;
    use launch_core::config::{KEY_PRESALE_PRICE, KEY_USDC, KEY_VAULT_ADMIN, KEY_WETH};
    use std::collections::BTreeMap;

    const USDC: &str = "0x00000000000000000000000000000000000000cc";

    fn presale_args(config: &LaunchConfig) -> Vec<Value> {
        let registry = atlas_registry(config).unwrap();
        let deps = BTreeMap::from([
            (TOKEN.to_string(), Address::from_bytes(&[1; 20])),
            (VESTING.to_string(), Address::from_bytes(&[2; 20])),
        ]);
        let signer = Address::zero();
        let ctx = BuildContext {
            deps: &deps,
            config,
            signer: &signer,
        };
        (registry.get(PRESALE).unwrap().init_args)(&ctx).unwrap()
    }

    fn config(weth: Option<&str>) -> LaunchConfig {
        let mut values = BTreeMap::from([(
            KEY_VAULT_ADMIN.to_string(),
            "0x00000000000000000000000000000000000000aa".to_string(),
        )]);
        if let Some(w) = weth {
            values.insert(KEY_WETH.to_string(), w.to_string());
        }
        LaunchConfig::from_map(&values).unwrap()
    }

    #[test]
    fn registry_resolves_without_cycles() {
        let registry = atlas_registry(&config(None)).unwrap();
        let order: Vec<String> = registry
            .resolve_order()
            .unwrap()
            .into_iter()
            .map(|m| m.name.clone())
            .collect();
        assert_eq!(order.first().map(String::as_str), Some(TOKEN));
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos(WETH) < pos(ROUTER));
        assert!(pos(FACTORY) < pos(ROUTER));
        assert!(pos(VAULT) < pos(REWARDS));
        assert!(pos(VESTING) < pos(PRESALE));
    }

    #[test]
    fn external_weth_skips_weth_module() {
        let registry =
            atlas_registry(&config(Some("0x00000000000000000000000000000000000000bb"))).unwrap();
        assert!(!registry.contains(WETH));
        assert_eq!(registry.get(ROUTER).unwrap().dependencies, vec![FACTORY]);
    }

    #[test]
    fn optional_modules_are_marked() {
        let registry = atlas_registry(&config(None)).unwrap();
        assert!(!registry.get(BRIDGE).unwrap().required);
        assert!(!registry.get(LAUNCHPAD).unwrap().required);
        assert!(registry.get(VAULT).unwrap().required);
    }

    #[test]
    fn presale_receives_payment_token_price_and_cap() {
        let mut values = BTreeMap::from([
            (
                KEY_VAULT_ADMIN.to_string(),
                "0x00000000000000000000000000000000000000aa".to_string(),
            ),
            (KEY_USDC.to_string(), USDC.to_string()),
            (KEY_PRESALE_PRICE.to_string(), "75000000".to_string()),
        ]);
        let args = presale_args(&LaunchConfig::from_map(&values).unwrap());
        assert_eq!(args[3], json!(USDC));
        assert_eq!(args[4], json!("75000000"));
        assert_eq!(args[5], json!("300000000"));
        assert_eq!(args[7], json!(2_592_000));

        values.remove(KEY_USDC);
        let args = presale_args(&LaunchConfig::from_map(&values).unwrap());
        assert_eq!(args[3], json!(Address::zero().as_str()));
        assert_eq!(args[4], json!("50000000"));
    }

    #[test]
    fn minter_grant_is_required() {
        let grants = atlas_grants(&config(None));
        let minter = grants
            .iter()
            .find(|g| g.label().contains(MINTER_ROLE))
            .unwrap();
        assert!(!minter.optional);
        assert_eq!(grants.iter().filter(|g| g.optional).count(), 3);
    }
}
