//! Block rules and the persisted processor configuration.
//!
//! The rule list lives inside `ProcessorConfig`, which is serialized to
//! `<data>/processor.json`. Mutations go through the processor's single
//! update closure; this module only defines the shapes and file handling.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregator::FeedMetadata;

pub const PROCESSOR_CONFIG_FILE: &str = "processor.json";

const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 15;
const DEFAULT_BLOCK_DURATION_SECS: u64 = 7 * 24 * 3600;
const DEFAULT_MATCH_WINDOW_SECS: u64 = 24 * 3600;
const DEFAULT_MATCH_THRESHOLD: i32 = 3;

/// Where a block rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    User,
    Intel,
    Analyzer,
}

/// What to do when a packet's source matches threat intelligence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Record the match without blocking.
    Monitor,
    /// Install an enabled block rule unconditionally.
    Block,
    /// Count matches per source; block once the window threshold is hit.
    Threshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRule {
    pub id: String,
    /// IP, CIDR, or MAC in standard notation.
    pub value: String,
    #[serde(default)]
    pub note: String,
    pub source: BlockSource,
    pub create_time: i64,
    /// Epoch seconds; zero means the rule never expires.
    #[serde(default)]
    pub expire_time: i64,
    pub enabled: bool,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl BlockRule {
    /// A rule is effective while enabled and unexpired.
    pub fn is_effective(&self, now: i64) -> bool {
        self.enabled && (self.expire_time == 0 || now < self.expire_time)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_time > 0 && self.expire_time <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistConfig {
    pub default_block_duration_secs: u64,
    pub rules: Vec<BlockRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIntelConfig {
    /// Skip the threat-intel check for locally-scoped source addresses.
    pub ignore_local_network: bool,
    pub match_mode: MatchMode,
    /// Matches within the window before a source is blocked.
    pub match_threshold: i32,
    pub match_window_secs: u64,
    /// How long a matched source stays blocked; zero blocks forever.
    pub block_duration_secs: u64,
    pub feeds: HashMap<String, FeedMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub cleanup_interval_secs: u64,
    pub blocklist: BlocklistConfig,
    pub threat_intel: ThreatIntelConfig,
}

impl ProcessorConfig {
    pub fn default_with_feeds(feeds: HashMap<String, FeedMetadata>) -> ProcessorConfig {
        ProcessorConfig {
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            blocklist: BlocklistConfig {
                default_block_duration_secs: DEFAULT_BLOCK_DURATION_SECS,
                rules: Vec::new(),
            },
            threat_intel: ThreatIntelConfig {
                ignore_local_network: true,
                match_mode: MatchMode::Threshold,
                match_threshold: DEFAULT_MATCH_THRESHOLD,
                match_window_secs: DEFAULT_MATCH_WINDOW_SECS,
                block_duration_secs: DEFAULT_BLOCK_DURATION_SECS,
                feeds,
            },
        }
    }

    pub fn load(path: &Path) -> Result<ProcessorConfig> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))
    }
}
