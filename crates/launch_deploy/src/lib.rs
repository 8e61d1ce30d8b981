// Module registry, checkpoint store, orchestration and wiring

pub mod checkpoint;
pub mod manifest;
pub mod orchestrator;
pub mod registry;
pub mod wiring;

pub use checkpoint::{
    Checkpoint, CheckpointData, DeploymentRecord, FundedMark, FundingState, VestingMark,
};
pub use orchestrator::{DeployOptions, DeployReport, ModuleOutcome, ModuleState, Orchestrator};
pub use registry::{BuildContext, InitArgsBuilder, ModuleKind, ModuleRegistry, ModuleSpec};
pub use wiring::{Capability, CapabilityGrant, GrantOutcome, Grantee, Wiring, WiringReport};
