pub mod controller;
pub mod http;

pub use controller::{
    ModuleVerification, RetryController, RetryPolicy, VerificationReport, VerificationStatus,
    Verifier, VerifyOutcome, VerifyRequest,
};
pub use http::{HttpVerifier, classify};
