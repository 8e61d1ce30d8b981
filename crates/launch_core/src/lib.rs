pub mod address;
pub mod config;
pub mod error_handler;
pub mod logging;

pub use address::Address;
pub use config::{FundingStrategyKind, LaunchConfig, VerifySettings, VestingSettings};
pub use error_handler::{ErrorCategory, LaunchError};
