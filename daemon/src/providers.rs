//! Threat-intelligence feed providers.
//!
//! Each provider fetches one or more HTTP endpoints and returns raw
//! indicator strings, one per line, comments stripped. A fetch succeeds
//! as long as at least one endpoint yielded data; per-URL failures are
//! aggregated into the error otherwise.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

/// Per-request timeout for feed downloads.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed fetch failed: {0}")]
    FetchFailure(String),
}

/// A named external source of indicators with a refresh schedule.
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Default refresh schedule, standard 5-field cron.
    fn schedule(&self) -> &'static str;

    fn default_params(&self) -> HashMap<String, String>;

    async fn fetch(&self, params: &HashMap<String, String>) -> Result<Vec<String>, FeedError>;
}

/// Shared HTTP client for all providers.
pub fn http_client() -> reqwest::Result<Client> {
    Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(concat!("ingress-daemon/", env!("CARGO_PKG_VERSION")))
        .build()
}

async fn fetch_text(client: &Client, url: &str) -> Result<String, String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| format!("failed to fetch {url}: {err}"))?;
    if !response.status().is_success() {
        return Err(format!("failed to fetch {url}: HTTP {}", response.status()));
    }
    response
        .text()
        .await
        .map_err(|err| format!("failed to read body of {url}: {err}"))
}

/// One indicator per line, skipping blanks and `#` comments.
fn parse_plain_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Spamhaus DROP format: `network ; SBL id`, `;` starts a comment.
fn parse_spamhaus_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .filter_map(|line| {
            let indicator = line.split(';').next()?.trim();
            (!indicator.is_empty()).then(|| indicator.to_string())
        })
        .collect()
}

// =============================================================================
// AbuseIPDB
// =============================================================================

/// Mirrored AbuseIPDB confidence lists (https://github.com/borestad/blocklist-abuseipdb).
const ABUSEIPDB_BASE_URL: &str =
    "https://raw.githubusercontent.com/borestad/blocklist-abuseipdb/refs/heads/main";

/// s100 lists carry ~100% confidence; s99 is the hall of shame.
fn abuseipdb_source_file(source: &str) -> Option<&'static str> {
    Some(match source {
        "s1001d" => "abuseipdb-s100-1d.ipv4",
        "s1003d" => "abuseipdb-s100-3d.ipv4",
        "s1007d" => "abuseipdb-s100-7d.ipv4",
        "s10014d" => "abuseipdb-s100-14d.ipv4",
        "s10030d" => "abuseipdb-s100-30d.ipv4",
        "s10060d" => "abuseipdb-s100-60d.ipv4",
        "s10090d" => "abuseipdb-s100-90d.ipv4",
        "s100120d" => "abuseipdb-s100-120d.ipv4",
        "s991d" => "abuseipdb-s99-hall-of-shame-1d.ipv4",
        "s993d" => "abuseipdb-s99-hall-of-shame-3d.ipv4",
        "s997d" => "abuseipdb-s99-hall-of-shame-7d.ipv4",
        "s9914d" => "abuseipdb-s99-hall-of-shame-14d.ipv4",
        "s9930d" => "abuseipdb-s99-hall-of-shame-30d.ipv4",
        "s9960d" => "abuseipdb-s99-hall-of-shame-60d.ipv4",
        "s9990d" => "abuseipdb-s99-hall-of-shame-90d.ipv4",
        "s99120d" => "abuseipdb-s99-hall-of-shame-120d.ipv4",
        _ => return None,
    })
}

pub struct AbuseIpDb {
    client: Client,
}

impl AbuseIpDb {
    pub fn new(client: Client) -> AbuseIpDb {
        AbuseIpDb { client }
    }
}

#[async_trait]
impl ThreatFeed for AbuseIpDb {
    fn name(&self) -> &'static str {
        "abuseipdb"
    }

    fn description(&self) -> &'static str {
        "AbuseIPDB is a platform that provides information about IP addresses \
         that are known to be involved in malicious activities."
    }

    fn schedule(&self) -> &'static str {
        "30 2,18 * * *"
    }

    fn default_params(&self) -> HashMap<String, String> {
        HashMap::from([
            ("baseURL".to_string(), ABUSEIPDB_BASE_URL.to_string()),
            // 30-day windows of both confidence tiers
            ("source".to_string(), "s10030d,s9930d".to_string()),
        ])
    }

    async fn fetch(&self, params: &HashMap<String, String>) -> Result<Vec<String>, FeedError> {
        let base_url = params
            .get("baseURL")
            .map(String::as_str)
            .filter(|url| !url.is_empty())
            .unwrap_or(ABUSEIPDB_BASE_URL)
            .trim_end_matches('/');
        let sources = params.get("source").map(String::as_str).unwrap_or_default();

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for source in sources.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some(file) = abuseipdb_source_file(source) else {
                failures.push(format!("invalid source: {source}"));
                continue;
            };
            match fetch_text(&self.client, &format!("{base_url}/{file}")).await {
                Ok(body) => results.extend(parse_plain_lines(&body)),
                Err(err) => failures.push(err),
            }
        }
        if results.is_empty() {
            return Err(FeedError::FetchFailure(failures.join("; ")));
        }
        Ok(results)
    }
}

// =============================================================================
// Spamhaus
// =============================================================================

const SPAMHAUS_DROP_URLS: [&str; 2] = [
    "https://www.spamhaus.org/drop/drop.txt",
    "https://www.spamhaus.org/drop/edrop.txt",
];

pub struct Spamhaus {
    client: Client,
}

impl Spamhaus {
    pub fn new(client: Client) -> Spamhaus {
        Spamhaus { client }
    }
}

#[async_trait]
impl ThreatFeed for Spamhaus {
    fn name(&self) -> &'static str {
        "spamhaus"
    }

    fn description(&self) -> &'static str {
        "Spamhaus Project is the authority on IP and domain reputation. The \
         DROP lists contain netblocks hijacked or leased by professional \
         spam and cyber-crime operations."
    }

    fn schedule(&self) -> &'static str {
        "30 2 * * *"
    }

    fn default_params(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn fetch(&self, _params: &HashMap<String, String>) -> Result<Vec<String>, FeedError> {
        let mut results = Vec::new();
        let mut failures = Vec::new();
        for url in SPAMHAUS_DROP_URLS {
            match fetch_text(&self.client, url).await {
                Ok(body) => results.extend(parse_spamhaus_lines(&body)),
                Err(err) => failures.push(err),
            }
        }
        if results.is_empty() {
            return Err(FeedError::FetchFailure(failures.join("; ")));
        }
        Ok(results)
    }
}

// =============================================================================
// Tests
// =============================================================================
