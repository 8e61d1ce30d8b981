//! Explorer-style verification endpoint over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use launch_chain::validate_url;
use launch_core::LaunchError;

use crate::controller::{Verifier, VerifyOutcome, VerifyRequest};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody<'a> {
    module: &'a str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    implementation: Option<&'a str>,
    constructor_arguments: &'a [serde_json::Value],
}

pub struct HttpVerifier {
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpVerifier {
    pub fn new(api_url: &str, api_key: Option<String>) -> Result<Self, LaunchError> {
        if !validate_url(api_url) {
            return Err(LaunchError::Config(format!(
                "invalid verification URL: {api_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LaunchError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            api_url: api_url.to_string(),
            api_key,
            client,
        })
    }
}

/// Map a response to an outcome. Explorers often answer 200 with the real
/// status in the body, so the body is checked first.
pub fn classify(status: u16, body: &str) -> VerifyOutcome {
    let lower = body.to_ascii_lowercase();
    if lower.contains("already verified") {
        return VerifyOutcome::AlreadyVerified;
    }
    if status == 429 || lower.contains("rate limit") {
        return VerifyOutcome::RateLimited;
    }
    match status {
        200..=299 => VerifyOutcome::Verified,
        408 | 500..=599 => VerifyOutcome::RateLimited,
        _ => VerifyOutcome::Fatal(format!("HTTP {status}: {}", body.trim())),
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, request: &VerifyRequest) -> VerifyOutcome {
        let body = VerifyBody {
            module: &request.module,
            address: request.address.as_str(),
            implementation: request.implementation.as_ref().map(|a| a.as_str()),
            constructor_arguments: &request.args,
        };

        let mut builder = self.client.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.query(&[("apikey", key)]);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() || e.is_connect() => {
                debug!(module = %request.module, "transient verification error: {e}");
                return VerifyOutcome::RateLimited;
            }
            Err(e) => return VerifyOutcome::Fatal(format!("request failed: {e}")),
        };
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        debug!(module = %request.module, status, "verification response");
        classify(status, &text)
    }
}
