pub mod allocation;
pub mod units;
pub mod vesting;

pub use allocation::{
    AllocationLedger, AllocationPlan, FundingContext, FundingReport, FundingStrategy,
    MintPerSink, MintThenTransfer, SinkAllocation, strategy_for, token_decimals,
};
pub use units::{DEFAULT_DECIMALS, UnitsError, format_units, parse_units};
pub use vesting::{VestingBatch, VestingBatchBuilder, VestingSchedule, VestingScheduler};
