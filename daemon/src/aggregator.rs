//! Threat-intelligence aggregator.
//!
//! Schedules feed refreshes, keeps one cache file per feed under
//! `<data>/threatintel/`, and rebuilds the LPM trie from every enabled
//! feed's cache. The trie is published as an immutable `Arc` snapshot, so
//! packet workers query it without ever observing a partial rebuild.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::iptrie::IpTrie;
use crate::providers::{http_client, AbuseIpDb, Spamhaus, ThreatFeed};

const CACHE_DIR: &str = "threatintel";

/// Persisted per-feed settings; lives inside the processor config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub name: String,
    pub description: String,
    /// Standard 5-field cron expression; validated while the feed is enabled.
    pub schedule: String,
    pub enabled: bool,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

struct AggregatorInner {
    cache_dir: PathBuf,
    feeds: HashMap<String, Arc<dyn ThreatFeed>>,
    metadata: RwLock<HashMap<String, FeedMetadata>>,
    jobs: tokio::sync::Mutex<HashMap<String, CancellationToken>>,
    trie: RwLock<Arc<IpTrie>>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle; the scheduler tasks share the inner state.
#[derive(Clone)]
pub struct ThreatAggregator {
    inner: Arc<AggregatorInner>,
}

impl ThreatAggregator {
    /// Create the aggregator with the built-in providers registered.
    pub fn new(data_dir: &Path) -> Result<ThreatAggregator> {
        let client = http_client().context("failed to create HTTP client")?;
        Self::with_feeds(
            data_dir,
            vec![
                Arc::new(AbuseIpDb::new(client.clone())),
                Arc::new(Spamhaus::new(client)),
            ],
        )
    }

    /// Register an explicit provider set; schedules are cron-validated here.
    pub fn with_feeds(
        data_dir: &Path,
        providers: Vec<Arc<dyn ThreatFeed>>,
    ) -> Result<ThreatAggregator> {
        let cache_dir = data_dir.join(CACHE_DIR);
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create {}", cache_dir.display()))?;

        let mut feeds: HashMap<String, Arc<dyn ThreatFeed>> = HashMap::new();
        for feed in providers {
            validate_schedule(feed.schedule())
                .with_context(|| format!("feed {} has an invalid schedule", feed.name()))?;
            feeds.insert(feed.name().to_lowercase(), feed);
        }

        Ok(ThreatAggregator {
            inner: Arc::new(AggregatorInner {
                cache_dir,
                feeds,
                metadata: RwLock::new(HashMap::new()),
                jobs: tokio::sync::Mutex::new(HashMap::new()),
                trie: RwLock::new(Arc::new(IpTrie::new())),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Default metadata for every registered provider, all disabled.
    pub fn generate_feeds_metadata(&self) -> HashMap<String, FeedMetadata> {
        self.inner
            .feeds
            .iter()
            .map(|(key, feed)| {
                (
                    key.clone(),
                    FeedMetadata {
                        name: feed.name().to_string(),
                        description: feed.description().to_string(),
                        schedule: feed.schedule().to_string(),
                        enabled: false,
                        params: feed.default_params(),
                    },
                )
            })
            .collect()
    }

    /// Load persisted metadata; enabled feeds are scheduled and synced once
    /// immediately.
    pub async fn initialize(&self, metadata: HashMap<String, FeedMetadata>) -> Result<()> {
        for (name, info) in metadata {
            let name = name.to_lowercase();
            let enabled = info.enabled;
            let schedule = info.schedule.clone();
            self.inner.metadata.write().unwrap().insert(name.clone(), info);
            if enabled {
                self.schedule(&name, &schedule)
                    .await
                    .with_context(|| format!("failed to schedule feed {name}"))?;
            }
        }
        Ok(())
    }

    pub fn get_feed_metadata(&self, name: &str) -> Option<FeedMetadata> {
        self.inner
            .metadata
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn get_feeds_metadata(&self) -> HashMap<String, FeedMetadata> {
        self.inner.metadata.read().unwrap().clone()
    }

    /// Apply new feed settings, reconciling the scheduler and cache state
    /// with the enabled/schedule/params transitions.
    pub async fn update_feed_metadata(&self, name: &str, metadata: FeedMetadata) -> Result<()> {
        let name = name.to_lowercase();
        if !self.inner.feeds.contains_key(&name) {
            bail!("feed not found: {name}");
        }
        // the schedule only has to be valid while the feed is enabled;
        // a disable must go through regardless of the schedule string
        if metadata.enabled && !metadata.schedule.is_empty() {
            validate_schedule(&metadata.schedule)?;
        }

        let previous = {
            let mut stored = self.inner.metadata.write().unwrap();
            let Some(previous) = stored.get(&name).cloned() else {
                bail!("feed metadata not found: {name}");
            };
            stored.insert(name.clone(), metadata.clone());
            previous
        };

        let result = match (previous.enabled, metadata.enabled) {
            (false, true) => self.schedule(&name, &metadata.schedule).await,
            (true, false) => {
                self.inner.disable_feed(&name).await;
                Ok(())
            }
            (true, true) if previous.schedule != metadata.schedule => {
                self.schedule(&name, &metadata.schedule).await
            }
            (true, true) if previous.params != metadata.params => {
                self.inner.sync_feed(&name).await;
                Ok(())
            }
            _ => Ok(()),
        };

        if result.is_err() {
            // roll the stored metadata back so a bad schedule is not sticky
            self.inner.metadata.write().unwrap().insert(name, previous);
        }
        result
    }

    /// Fetch one feed now, persist the surviving indicators, and rebuild.
    pub async fn sync_feed(&self, name: &str) {
        self.inner.sync_feed(&name.to_lowercase()).await;
    }

    /// Whether any enabled feed lists this address. False for an empty trie.
    pub fn contains(&self, ip: &str) -> bool {
        if ip.is_empty() {
            return false;
        }
        let snapshot = self.inner.trie.read().unwrap().clone();
        if snapshot.is_empty() {
            return false;
        }
        snapshot.contains(ip)
    }

    /// Number of indicators in the current snapshot.
    pub fn indicator_count(&self) -> usize {
        self.inner.trie.read().unwrap().len()
    }

    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.jobs.lock().await.clear();
    }

    /// (Re)schedule a feed's refresh job and run an initial sync.
    async fn schedule(&self, name: &str, schedule: &str) -> Result<()> {
        let cron = parse_schedule(schedule)?;

        let mut jobs = self.inner.jobs.lock().await;
        if let Some(previous) = jobs.remove(name) {
            previous.cancel();
        }
        let token = self.inner.shutdown.child_token();
        jobs.insert(name.to_string(), token.clone());
        drop(jobs);

        let inner = Arc::clone(&self.inner);
        let feed_name = name.to_string();
        tokio::spawn(async move {
            loop {
                let Some(next) = cron.upcoming(chrono::Utc).next() else {
                    return;
                };
                let wait = (next - chrono::Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(wait) => inner.sync_feed(&feed_name).await,
                }
            }
        });

        self.inner.sync_feed(name).await;
        Ok(())
    }
}

impl AggregatorInner {
    async fn sync_feed(&self, name: &str) {
        let Some(feed) = self.feeds.get(name) else {
            return;
        };
        let params = {
            let metadata = self.metadata.read().unwrap();
            match metadata.get(name) {
                Some(info) if info.enabled => info.params.clone(),
                _ => return,
            }
        };

        let indicators = match feed.fetch(&params).await {
            Ok(indicators) => indicators,
            Err(err) => {
                // previous cache stays in effect until the next success
                warn!(feed = name, "failed to fetch feed: {err}");
                return;
            }
        };

        let valid: Vec<String> = indicators
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| is_ip_indicator(line))
            .collect();
        if valid.is_empty() {
            warn!(feed = name, "no valid indicators retrieved");
            return;
        }
        info!(feed = name, count = valid.len(), "retrieved indicators");

        let path = self.cache_file(name);
        if let Err(err) = fs::write(&path, valid.join("\n")) {
            warn!(feed = name, "failed to save indicators: {err}");
            return;
        }

        self.aggregate();
    }

    /// Rebuild the trie from every enabled feed's cache file and publish
    /// the fresh snapshot atomically.
    fn aggregate(&self) {
        let enabled: Vec<String> = {
            let metadata = self.metadata.read().unwrap();
            metadata
                .iter()
                .filter(|(_, info)| info.enabled)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut trie = IpTrie::new();
        let mut total = 0usize;
        for name in enabled {
            let path = self.cache_file(&name);
            let data = match fs::read_to_string(&path) {
                Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(feed = %name, "failed to read cache file: {err}");
                    continue;
                }
            };
            for line in data.lines() {
                if trie.insert(line.trim()).is_ok() {
                    total += 1;
                }
            }
        }

        *self.trie.write().unwrap() = Arc::new(trie);
        info!(total, "aggregated threat intelligence indicators");
    }

    /// Unschedule, drop the cache file, and rebuild without this feed.
    async fn disable_feed(&self, name: &str) {
        if let Some(token) = self.jobs.lock().await.remove(name) {
            token.cancel();
        }
        let path = self.cache_file(name);
        if path.exists() {
            if let Err(err) = fs::remove_file(&path) {
                warn!(feed = name, "failed to remove cache file: {err}");
            }
        }
        self.aggregate();
    }

    fn cache_file(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.txt"))
    }
}

/// Indicators must parse as an IP address or CIDR; anything else is dropped.
fn is_ip_indicator(value: &str) -> bool {
    value.parse::<ipnet::IpNet>().is_ok() || value.parse::<std::net::IpAddr>().is_ok()
}

fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        bail!("invalid schedule expression {expr:?}: expected 5 fields, got {fields}");
    }
    // the cron crate wants a leading seconds field; pin it to zero
    cron::Schedule::from_str(&format!("0 {expr}"))
        .with_context(|| format!("invalid schedule expression {expr:?}"))
}

pub fn validate_schedule(expr: &str) -> Result<()> {
    parse_schedule(expr).map(|_| ())
}

// =============================================================================
// Tests
// =============================================================================
