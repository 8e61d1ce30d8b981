// Chain collaborator seam + network profiles

pub mod client;
pub mod network;
pub mod simulated;

pub use client::{
    BatchCall, ChainClient, ChainError, InitArgs, PendingTx, Receipt, confirm_within,
};
pub use network::{Network, NetworkProfile, NetworkProfiles, validate_url};
pub use simulated::SimulatedChain;
