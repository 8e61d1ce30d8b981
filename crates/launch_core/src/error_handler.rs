use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type shared by every launch component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("Module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },

    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("No checkpoint entry for '{0}'")]
    NotFound(String),

    #[error("Deployment of '{module}' failed: {reason}")]
    Deployment { module: String, reason: String },

    #[error("Timed out after {secs}s waiting for confirmation of {operation}")]
    Timeout { operation: String, secs: u64 },

    #[error("Capability grant '{grant}' failed: {reason}")]
    Wiring { grant: String, reason: String },

    #[error(
        "Allocation exceeds total supply by {excess} units ({requested} requested of {total}): {}",
        format_entries(entries)
    )]
    OverAllocation {
        total: u128,
        requested: u128,
        excess: u128,
        entries: Vec<(String, u128)>,
    },

    #[error("Insufficient balance at {holder}: need {required} units, have {available}")]
    InsufficientBalance {
        holder: String,
        required: u128,
        available: u128,
    },

    #[error("Arity mismatch: {beneficiaries} beneficiaries but {amounts} amounts")]
    ArityMismatch { beneficiaries: usize, amounts: usize },

    #[error("Invalid amount for '{entry}': {reason}")]
    InvalidAmount { entry: String, reason: String },

    #[error("Duplicate vesting beneficiary {0}")]
    DuplicateBeneficiary(String),

    #[error("Checkpoint already records '{module}' at {recorded}; refusing to replace with {attempted}")]
    CheckpointConflict {
        module: String,
        recorded: String,
        attempted: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Chain error: {0}")]
    Chain(String),
}

fn format_entries(entries: &[(String, u128)]) -> String {
    entries
        .iter()
        .map(|(name, units)| format!("{name}={units}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Where in the launch pipeline an error belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Raised before any external call; the run never started.
    Preflight,
    /// Scoped to a single module deployment.
    Module,
    /// Scoped to a single capability grant.
    Wiring,
    /// Allocation or vesting validation and transfers.
    Funding,
    /// Checkpoint persistence.
    Storage,
    /// Raw failure reported by the chain collaborator.
    Chain,
}

impl LaunchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::DuplicateModule(_)
            | Self::UnknownDependency { .. }
            | Self::CyclicDependency { .. } => ErrorCategory::Preflight,
            Self::Deployment { .. } | Self::Timeout { .. } => ErrorCategory::Module,
            Self::Wiring { .. } => ErrorCategory::Wiring,
            Self::OverAllocation { .. }
            | Self::InsufficientBalance { .. }
            | Self::ArityMismatch { .. }
            | Self::InvalidAmount { .. }
            | Self::DuplicateBeneficiary(_) => ErrorCategory::Funding,
            Self::NotFound(_) | Self::CheckpointConflict { .. } | Self::Storage(_) => {
                ErrorCategory::Storage
            }
            Self::Chain(_) => ErrorCategory::Chain,
        }
    }

    /// Pre-flight errors abort before anything touches the chain.
    pub fn is_preflight(&self) -> bool {
        self.category() == ErrorCategory::Preflight
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Preflight => "preflight",
            Self::Module => "module",
            Self::Wiring => "wiring",
            Self::Funding => "funding",
            Self::Storage => "storage",
            Self::Chain => "chain",
        };
        f.write_str(label)
    }
}

impl From<std::io::Error> for LaunchError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LaunchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("malformed JSON: {err}"))
    }
}
