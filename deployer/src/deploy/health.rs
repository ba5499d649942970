//! Post-start HTTP health probes

use std::time::Duration;

use tracing::{info, warn};
use url::Url;

use crate::deploy::outcome::Outcome;

/// An HTTP endpoint expected to answer with a success status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEndpoint {
    pub name: String,
    pub url: Url,
}

/// Probe every endpoint once. Failures are warnings: services may still be
/// starting up.
pub async fn probe_endpoints(endpoints: &[HealthEndpoint], timeout: Duration) -> Vec<Outcome> {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot build HTTP client for health checks: {}", e);
            return vec![Outcome::warning(format!("health checks not run: {}", e))];
        }
    };

    let mut outcomes = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let outcome = match client.get(endpoint.url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                info!("{} is healthy ({})", endpoint.name, endpoint.url);
                Outcome::ok(format!("{} answered {}", endpoint.name, response.status()))
            }
            Ok(response) => {
                warn!("{} answered {} at {}", endpoint.name, response.status(), endpoint.url);
                Outcome::warning(format!(
                    "{} answered {} at {}; it may still be starting",
                    endpoint.name,
                    response.status(),
                    endpoint.url
                ))
            }
            Err(e) => {
                warn!("{} unreachable at {}: {}", endpoint.name, endpoint.url, e);
                Outcome::warning(format!(
                    "{} unreachable at {}; it may still be starting",
                    endpoint.name, endpoint.url
                ))
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}
