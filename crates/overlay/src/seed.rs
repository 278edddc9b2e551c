//! Seed discovery: one-shot bootstrap peer list over HTTP.
//!
//! The seed endpoint returns plain text, one `host:port` per line. Blank
//! lines and lines beginning with `#` are ignored; a line that does not
//! parse is logged and skipped so a single bad entry cannot poison the
//! bootstrap.

use crate::{OverlayError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for the whole seed fetch.
const SEED_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// An endpoint parsed from the seed list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedEndpoint {
    /// Host literal or DNS name.
    pub host: String,
    /// Advertised listening port.
    pub port: u16,
}

/// Fetches and parses the seed list from `seed_url`.
///
/// # Errors
///
/// Fails if the HTTP request cannot be built or completed within 30 s, or
/// if the endpoint returns a non-success status. Unparseable lines are
/// skipped, not errors.
pub async fn fetch_seed_list(seed_url: &str) -> Result<Vec<SeedEndpoint>> {
    debug!("contacting seed URL {}", seed_url);

    let client = reqwest::Client::builder()
        .timeout(SEED_FETCH_TIMEOUT)
        .build()?;

    let response = client.get(seed_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(OverlayError::SeedStatus {
            url: seed_url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response.text().await?;
    let seeds = parse_seed_body(&body, seed_url);
    debug!("seed URL {} yielded {} peers", seed_url, seeds.len());
    Ok(seeds)
}

/// Parses a seed list body into endpoints, skipping comments and bad lines.
pub fn parse_seed_body(body: &str, origin: &str) -> Vec<SeedEndpoint> {
    let mut seeds = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_seed_line(line) {
            Some(seed) => seeds.push(seed),
            None => warn!("bad peer in {} [{}]", origin, line),
        }
    }
    seeds
}

/// Parses one `host:port` line.
///
/// The split is on the last colon so bracketed IPv6 literals and hostnames
/// with embedded colons still resolve to the right port field.
fn parse_seed_line(line: &str) -> Option<SeedEndpoint> {
    let (host, port) = line.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(SeedEndpoint {
        host: host.trim_matches(|c| c == '[' || c == ']').to_string(),
        port,
    })
}
