//! Packet processor and block-rule engine.
//!
//! Every record from the pool runs decode → enrich → collect → filter →
//! threat-intel check. Matches drive the block-rule engine, which owns the
//! persisted rule list and keeps the kernel maps in sync with it. The
//! config snapshot is only mutated through `update_config`, so readers
//! always see a complete state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use ingress_filter::{format_mac, MatchType, PacketInfo, RuleSink};
use ipnet::IpNet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::{FeedMetadata, ThreatAggregator};
use crate::rules::{BlockRule, BlockSource, MatchMode, ProcessorConfig, PROCESSOR_CONFIG_FILE};

/// Country/city label for locally-scoped source addresses.
pub const LOCAL_LABEL: &str = "local";

const INTEL_NOTE: &str = "Matched threat intelligence";

// =============================================================================
// Collaborator contracts
// =============================================================================

/// A decoded, enriched packet as handed to the metrics sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub timestamp: i64,
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub size: u32,
    pub eth_proto: u16,
    pub ip_proto: u16,
    pub country: String,
    pub city: String,
    pub match_type: MatchType,
}

#[derive(Debug, Clone)]
pub struct GeoInfo {
    pub country: String,
    pub city: String,
}

/// GeoIP database lookup, provided by an external collaborator.
pub trait GeoResolver: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Metrics collector contract; every decoded packet is forwarded here.
pub trait MetricsSink: Send + Sync {
    fn collect(&self, packet: &Packet);
}

/// Minimal sink counting traffic totals; stands in for the full collector.
#[derive(Default)]
pub struct CountingSink {
    packets: AtomicU64,
    bytes: AtomicU64,
    kernel_drops: AtomicU64,
}

impl CountingSink {
    pub fn new() -> CountingSink {
        CountingSink::default()
    }

    /// (packets, bytes, kernel drops) seen so far.
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.packets.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.kernel_drops.load(Ordering::Relaxed),
        )
    }
}

impl MetricsSink for CountingSink {
    fn collect(&self, packet: &Packet) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(u64::from(packet.size), Ordering::Relaxed);
        if packet.match_type != MatchType::None {
            self.kernel_drops.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Window state (threshold mode)
// =============================================================================

/// Per-source match counter; `count` is bumped atomically from any worker.
pub struct WindowState {
    pub count: AtomicI32,
    pub first_time: i64,
}

// =============================================================================
// Processor
// =============================================================================

pub struct Processor {
    data_dir: PathBuf,
    kernel: Arc<dyn RuleSink>,
    aggregator: ThreatAggregator,
    sink: Arc<dyn MetricsSink>,
    geo: Option<Arc<dyn GeoResolver>>,
    config: RwLock<Arc<ProcessorConfig>>,
    window_states: RwLock<HashMap<String, Arc<WindowState>>>,
    shutdown: CancellationToken,
}

impl Processor {
    pub async fn new(
        data_dir: &Path,
        kernel: Arc<dyn RuleSink>,
        aggregator: ThreatAggregator,
        sink: Arc<dyn MetricsSink>,
        geo: Option<Arc<dyn GeoResolver>>,
    ) -> Result<Arc<Processor>> {
        let config_path = data_dir.join(PROCESSOR_CONFIG_FILE);
        let config = if config_path.exists() {
            ProcessorConfig::load(&config_path)?
        } else {
            let config = ProcessorConfig::default_with_feeds(aggregator.generate_feeds_metadata());
            config.save(&config_path)?;
            config
        };

        let processor = Arc::new(Processor {
            data_dir: data_dir.to_path_buf(),
            kernel,
            aggregator: aggregator.clone(),
            sink,
            geo,
            config: RwLock::new(Arc::new(config)),
            window_states: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        aggregator
            .initialize(processor.config().threat_intel.feeds.clone())
            .await?;

        tokio::spawn(Arc::clone(&processor).cleanup_loop());
        Ok(processor)
    }

    /// Current immutable config snapshot.
    pub fn config(&self) -> Arc<ProcessorConfig> {
        self.config.read().unwrap().clone()
    }

    pub fn aggregator(&self) -> &ThreatAggregator {
        &self.aggregator
    }

    /// Process one packet record; this is the pool's worker entry point.
    pub fn process(&self, record: PacketInfo) {
        let packet = self.decode(&record);
        self.sink.collect(&packet);

        if packet.match_type != MatchType::None {
            // already dropped by the XDP program
            return;
        }

        if packet.src_ip.is_empty() {
            return;
        }
        let config = self.config();
        let local_and_ignored =
            config.threat_intel.ignore_local_network && is_local_ip(&packet.src_ip);
        if !local_and_ignored && self.aggregator.contains(&packet.src_ip) {
            self.handle_intel_match(&packet.src_ip, &config);
        }
    }

    /// Persist config and stop background work. Called once at shutdown.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Err(err) = self.config().save(&self.config_path()) {
            warn!("failed to persist processor config: {err:#}");
        }
        self.aggregator.close().await;
    }

    // =========================================================================
    // Decode + enrich
    // =========================================================================

    fn decode(&self, record: &PacketInfo) -> Packet {
        let src_ip = record.src_addr().map(|addr| addr.to_string()).unwrap_or_default();
        let dst_ip = record.dst_addr().map(|addr| addr.to_string()).unwrap_or_default();

        let mut packet = Packet {
            timestamp: epoch_now(),
            src_mac: format_mac(&record.src_mac),
            dst_mac: format_mac(&record.dst_mac),
            src_ip,
            dst_ip,
            src_port: record.src_port,
            dst_port: record.dst_port,
            size: record.pkt_size,
            eth_proto: record.eth_proto,
            ip_proto: record.ip_proto,
            country: String::new(),
            city: String::new(),
            match_type: record.match_type(),
        };

        if !packet.src_ip.is_empty() {
            if is_local_ip(&packet.src_ip) {
                packet.country = LOCAL_LABEL.to_string();
                packet.city = LOCAL_LABEL.to_string();
            } else if let Some(geo) = &self.geo {
                if let Ok(addr) = packet.src_ip.parse::<IpAddr>() {
                    if let Some(info) = geo.lookup(addr) {
                        packet.country = info.country;
                        packet.city = info.city;
                    }
                }
            }
        }
        packet
    }

    // =========================================================================
    // Threat-intel match handling
    // =========================================================================

    fn handle_intel_match(&self, src_ip: &str, config: &ProcessorConfig) {
        let intel = &config.threat_intel;
        let now = epoch_now();

        let enabled = match intel.match_mode {
            MatchMode::Monitor => false,
            MatchMode::Block => true,
            MatchMode::Threshold => {
                let window = intel.match_window_secs as i64;
                // get-or-reset and increment under one lock: concurrent
                // matches for a source serialize against the window reset,
                // so the threshold is crossed exactly once
                let count = {
                    let mut states = self.window_states.write().unwrap();
                    let state = match states.get(src_ip) {
                        Some(state) if now - state.first_time <= window => Arc::clone(state),
                        _ => {
                            let fresh = Arc::new(WindowState {
                                count: AtomicI32::new(0),
                                first_time: now,
                            });
                            states.insert(src_ip.to_string(), Arc::clone(&fresh));
                            fresh
                        }
                    };
                    state.count.fetch_add(1, Ordering::SeqCst) + 1
                };
                count >= intel.match_threshold
            }
        };

        let expire_time = if intel.block_duration_secs > 0 {
            now + intel.block_duration_secs as i64
        } else {
            0
        };

        let rule = BlockRule {
            id: String::new(),
            value: src_ip.to_string(),
            note: INTEL_NOTE.to_string(),
            source: BlockSource::Intel,
            create_time: now,
            expire_time,
            enabled,
            extra: HashMap::new(),
        };
        if let Err(err) = self.add_block_rule(rule) {
            warn!(ip = src_ip, "failed to add block rule: {err:#}");
        }
    }

    // =========================================================================
    // Block-rule engine
    // =========================================================================

    /// Add a rule; enabled rules are pushed to the kernel first. Returns
    /// the freshly assigned rule id.
    pub fn add_block_rule(&self, rule: BlockRule) -> Result<String> {
        let mut rule = rule;
        rule.id = Uuid::new_v4().to_string();
        let id = rule.id.clone();
        self.update_config(|config| {
            self.push_rule_to_kernel(&mut rule)?;
            config.blocklist.rules.push(rule.clone());
            Ok(())
        })?;
        Ok(id)
    }

    /// Replace a rule; an enabled-state flip propagates to the kernel.
    pub fn update_block_rule(&self, id: &str, rule: BlockRule) -> Result<()> {
        let mut rule = rule;
        rule.id = id.to_string();
        self.update_config(|config| {
            let Some(stored) = config.blocklist.rules.iter_mut().find(|r| r.id == id) else {
                return Err(anyhow!("rule not found: {id}"));
            };
            if stored.enabled != rule.enabled {
                if rule.enabled {
                    self.push_rule_to_kernel(&mut rule)?;
                } else {
                    self.kernel
                        .delete_rule(&rule.value)
                        .map_err(|err| anyhow!("failed to remove rule from kernel: {err}"))?;
                }
            }
            *stored = rule.clone();
            Ok(())
        })
    }

    /// Remove a rule; effective rules are also deleted from the kernel.
    pub fn delete_block_rule(&self, id: &str) -> Result<()> {
        self.update_config(|config| {
            let Some(position) = config.blocklist.rules.iter().position(|r| r.id == id) else {
                return Err(anyhow!("rule not found: {id}"));
            };
            let rule = config.blocklist.rules.remove(position);
            if rule.is_effective(epoch_now()) {
                if let Err(err) = self.kernel.delete_rule(&rule.value) {
                    warn!(value = %rule.value, "failed to remove rule from kernel: {err}");
                }
            }
            Ok(())
        })
    }

    /// Page through the rule list; returns the page and the total count.
    pub fn get_block_rules(&self, page: usize, page_size: usize) -> (Vec<BlockRule>, usize) {
        let page = page.max(1);
        let page_size = if page_size == 0 { 20 } else { page_size };
        let config = self.config();
        let total = config.blocklist.rules.len();
        let start = (page - 1) * page_size;
        if start >= total {
            return (Vec::new(), total);
        }
        let end = (start + page_size).min(total);
        (config.blocklist.rules[start..end].to_vec(), total)
    }

    /// Re-install persisted effective rules after the kernel maps come up
    /// empty (fresh boot or stack restart). Rules that expired while the
    /// daemon was down are disabled instead.
    pub fn sync_rules_to_kernel(&self) -> Result<()> {
        let now = epoch_now();
        self.update_config(|config| {
            for rule in config.blocklist.rules.iter_mut() {
                if rule.enabled && rule.is_expired(now) {
                    rule.enabled = false;
                    continue;
                }
                if rule.is_effective(now) {
                    if let Err(err) = self.kernel.add_rule(&rule.value) {
                        warn!(value = %rule.value, "failed to install persisted rule: {err}");
                    }
                }
            }
            Ok(())
        })
    }

    /// Update feed settings in the aggregator and persist them.
    pub async fn update_feed_metadata(&self, name: &str, metadata: FeedMetadata) -> Result<()> {
        self.aggregator.update_feed_metadata(name, metadata.clone()).await?;
        self.update_config(|config| {
            config.threat_intel.feeds.insert(name.to_lowercase(), metadata);
            Ok(())
        })
    }

    /// Push an enabled rule to the kernel. A rule already past its expiry
    /// is disabled instead of installed.
    fn push_rule_to_kernel(&self, rule: &mut BlockRule) -> Result<()> {
        if !rule.enabled {
            return Ok(());
        }
        if rule.is_expired(epoch_now()) {
            rule.enabled = false;
            return Ok(());
        }
        self.kernel
            .add_rule(&rule.value)
            .map_err(|err| anyhow!("failed to push rule to kernel: {err}"))
    }

    /// Single-writer config mutation; readers keep their snapshots. Each
    /// successful mutation is persisted, and a failed write only logs: the
    /// next successful one heals the file.
    fn update_config<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ProcessorConfig) -> Result<()>,
    {
        let mut guard = self.config.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next)?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        drop(guard);

        if let Err(err) = next.save(&self.config_path()) {
            warn!("failed to persist processor config: {err:#}");
        }
        Ok(())
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join(PROCESSOR_CONFIG_FILE)
    }

    // =========================================================================
    // Periodic cleanup
    // =========================================================================

    async fn cleanup_loop(self: Arc<Processor>) {
        let interval = Duration::from_secs(self.config().cleanup_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    self.cleanup_window_states();
                    self.cleanup_block_rules();
                }
            }
        }
    }

    fn cleanup_window_states(&self) {
        let now = epoch_now();
        let window = self.config().threat_intel.match_window_secs as i64;
        self.window_states
            .write()
            .unwrap()
            .retain(|_, state| now - state.first_time <= window);
    }

    fn cleanup_block_rules(&self) {
        let now = epoch_now();
        if !self.config().blocklist.rules.iter().any(|rule| rule.is_expired(now)) {
            return;
        }
        let result = self.update_config(|config| {
            config.blocklist.rules.retain(|rule| {
                if !rule.is_expired(now) {
                    return true;
                }
                if rule.enabled {
                    if let Err(err) = self.kernel.delete_rule(&rule.value) {
                        warn!(value = %rule.value, "failed to remove expired rule from kernel: {err}");
                        // kept so the next sweep retries the kernel delete
                        return true;
                    }
                }
                debug!(value = %rule.value, "expired block rule removed");
                false
            });
            Ok(())
        });
        if let Err(err) = result {
            warn!("block rule cleanup failed: {err:#}");
        }
    }

    #[cfg(test)]
    fn window_state_count(&self, src_ip: &str) -> Option<i32> {
        self.window_states
            .read()
            .unwrap()
            .get(src_ip)
            .map(|state| state.count.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Local network classification
// =============================================================================

const LOCAL_NETWORKS: [&str; 21] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "233.252.0.0/24",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::1/128",
    "fe80::/10",
    "fc00::/7",
    "ff00::/8",
];

/// Whether an address falls in a locally-scoped or reserved range.
pub fn is_local_ip(ip: &str) -> bool {
    static NETS: OnceLock<Vec<IpNet>> = OnceLock::new();
    let nets = NETS.get_or_init(|| {
        LOCAL_NETWORKS
            .iter()
            .map(|net| net.parse().expect("local network table is well-formed"))
            .collect()
    });
    let Ok(addr) = ip.trim().parse::<IpAddr>() else {
        return false;
    };
    nets.iter().any(|net| net.contains(&addr))
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{FeedError, ThreatFeed};
    use async_trait::async_trait;
    use ingress_filter::{FilterError, ETH_PROTO_IPV4};
    use std::sync::Mutex;

    struct MockKernel {
        adds: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
    }

    impl MockKernel {
        fn new() -> Arc<MockKernel> {
            Arc::new(MockKernel {
                adds: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            })
        }

        fn adds(&self) -> Vec<String> {
            self.adds.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<String> {
            self.deletes.lock().unwrap().clone()
        }
    }

    impl RuleSink for MockKernel {
        fn add_rule(&self, value: &str) -> Result<(), FilterError> {
            self.adds.lock().unwrap().push(value.to_string());
            Ok(())
        }

        fn delete_rule(&self, value: &str) -> Result<(), FilterError> {
            self.deletes.lock().unwrap().push(value.to_string());
            Ok(())
        }
    }

    struct StaticFeed {
        lines: Vec<String>,
    }

    #[async_trait]
    impl ThreatFeed for StaticFeed {
        fn name(&self) -> &'static str {
            "static"
        }

        fn description(&self) -> &'static str {
            "fixture feed"
        }

        fn schedule(&self) -> &'static str {
            "0 3 * * *"
        }

        fn default_params(&self) -> HashMap<String, String> {
            HashMap::new()
        }

        async fn fetch(&self, _params: &HashMap<String, String>) -> Result<Vec<String>, FeedError> {
            Ok(self.lines.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        packets: Mutex<Vec<Packet>>,
    }

    impl MetricsSink for RecordingSink {
        fn collect(&self, packet: &Packet) {
            self.packets.lock().unwrap().push(packet.clone());
        }
    }

    async fn build_processor(
        dir: &Path,
        indicators: &[&str],
    ) -> (Arc<Processor>, Arc<MockKernel>, Arc<RecordingSink>) {
        let feed = Arc::new(StaticFeed {
            lines: indicators.iter().map(|s| s.to_string()).collect(),
        });
        let aggregator = ThreatAggregator::with_feeds(dir, vec![feed]).unwrap();
        let kernel = MockKernel::new();
        let sink = Arc::new(RecordingSink::default());
        let processor = Processor::new(
            dir,
            kernel.clone() as Arc<dyn RuleSink>,
            aggregator,
            sink.clone() as Arc<dyn MetricsSink>,
            None,
        )
        .await
        .unwrap();

        if !indicators.is_empty() {
            // enable the fixture feed so its indicators land in the trie
            let mut metadata = processor.aggregator().get_feed_metadata("static").unwrap();
            metadata.enabled = true;
            processor.update_feed_metadata("static", metadata).await.unwrap();
        }
        (processor, kernel, sink)
    }

    fn packet_from(src: [u8; 4]) -> PacketInfo {
        PacketInfo {
            src_ip: src,
            dst_ip: [192, 168, 0, 10],
            src_ipv6: [0; 16],
            dst_ipv6: [0; 16],
            src_port: 40000,
            dst_port: 22,
            src_mac: [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22],
            dst_mac: [0x02, 0x42, 0xac, 0x11, 0x00, 0x02],
            eth_proto: ETH_PROTO_IPV4,
            ip_proto: 6,
            pkt_size: 120,
            match_type: 0,
        }
    }

    fn set_match_mode(processor: &Processor, mode: MatchMode) {
        processor
            .update_config(|config| {
                config.threat_intel.match_mode = mode;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_is_local_ip() {
        for local in ["10.1.2.3", "192.168.1.1", "127.0.0.1", "172.16.5.5", "::1", "fe80::1"] {
            assert!(is_local_ip(local), "{local}");
        }
        for public in ["8.8.8.8", "5.5.5.5", "2001:db8::1", "not-an-ip", ""] {
            assert!(!is_local_ip(public), "{public}");
        }
    }

    #[tokio::test]
    async fn test_decode_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _kernel, sink) = build_processor(dir.path(), &[]).await;

        processor.process(packet_from([192, 168, 1, 50]));
        let packets = sink.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert_eq!(packet.src_ip, "192.168.1.50");
        assert_eq!(packet.dst_ip, "192.168.0.10");
        assert_eq!(packet.src_mac, "aa:bb:cc:00:11:22");
        assert_eq!(packet.country, LOCAL_LABEL);
        assert_eq!(packet.city, LOCAL_LABEL);
        assert_eq!(packet.match_type, MatchType::None);
    }

    #[tokio::test]
    async fn test_kernel_matched_packet_stops_after_collect() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, sink) = build_processor(dir.path(), &["5.5.5.5"]).await;
        set_match_mode(&processor, MatchMode::Block);

        let mut record = packet_from([5, 5, 5, 5]);
        record.match_type = 2; // dropped by the CIDR map already
        processor.process(record);

        assert_eq!(sink.packets.lock().unwrap().len(), 1);
        assert!(kernel.adds().is_empty());
        assert!(processor.config().blocklist.rules.is_empty());
    }

    #[tokio::test]
    async fn test_block_mode_installs_enabled_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &["5.5.5.5"]).await;
        set_match_mode(&processor, MatchMode::Block);

        processor.process(packet_from([5, 5, 5, 5]));

        let config = processor.config();
        assert_eq!(config.blocklist.rules.len(), 1);
        let rule = &config.blocklist.rules[0];
        assert!(rule.enabled);
        assert_eq!(rule.value, "5.5.5.5");
        assert_eq!(rule.source, BlockSource::Intel);
        assert_eq!(rule.note, INTEL_NOTE);
        assert!(rule.expire_time > rule.create_time);
        assert_eq!(kernel.adds(), ["5.5.5.5"]);
    }

    #[tokio::test]
    async fn test_monitor_mode_records_disabled_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &["5.5.5.5"]).await;
        set_match_mode(&processor, MatchMode::Monitor);

        processor.process(packet_from([5, 5, 5, 5]));

        let config = processor.config();
        assert_eq!(config.blocklist.rules.len(), 1);
        assert!(!config.blocklist.rules[0].enabled);
        assert!(kernel.adds().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_mode_blocks_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &["5.5.5.5"]).await;
        // defaults: threshold mode, match_threshold 3, window 24h

        for _ in 0..3 {
            processor.process(packet_from([5, 5, 5, 5]));
        }

        assert_eq!(processor.window_state_count("5.5.5.5"), Some(3));
        let config = processor.config();
        let enabled: Vec<_> = config.blocklist.rules.iter().filter(|r| r.enabled).collect();
        assert_eq!(enabled.len(), 1, "exactly one enabled rule expected");
        assert_eq!(enabled[0].value, "5.5.5.5");
        assert_eq!(enabled[0].source, BlockSource::Intel);
        assert_eq!(kernel.adds(), ["5.5.5.5"], "exactly one kernel add expected");
        // sub-threshold matches are recorded as disabled rules
        assert_eq!(config.blocklist.rules.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_threshold_concurrent_matches_cross_once() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &["5.5.5.5"]).await;

        let mut workers = Vec::new();
        for _ in 0..3 {
            let processor = Arc::clone(&processor);
            workers.push(tokio::task::spawn_blocking(move || {
                processor.process(packet_from([5, 5, 5, 5]));
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(processor.window_state_count("5.5.5.5"), Some(3));
        let config = processor.config();
        let enabled = config.blocklist.rules.iter().filter(|r| r.enabled).count();
        assert_eq!(enabled, 1, "racing workers must cross the threshold once");
        assert_eq!(kernel.adds(), ["5.5.5.5"]);
    }

    #[tokio::test]
    async fn test_ignore_local_network_skips_intel_check() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &["192.168.1.0/24"]).await;
        set_match_mode(&processor, MatchMode::Block);

        processor.process(packet_from([192, 168, 1, 77]));
        assert!(kernel.adds().is_empty());
        assert!(processor.config().blocklist.rules.is_empty());

        // with the guard off, local sources are matched like any other
        processor
            .update_config(|config| {
                config.threat_intel.ignore_local_network = false;
                Ok(())
            })
            .unwrap();
        processor.process(packet_from([192, 168, 1, 77]));
        assert_eq!(kernel.adds(), ["192.168.1.77"]);
    }

    #[tokio::test]
    async fn test_add_rule_assigns_unique_ids_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _kernel, _sink) = build_processor(dir.path(), &[]).await;

        let first = processor
            .add_block_rule(user_rule("1.2.3.4", true, 0))
            .unwrap();
        let second = processor
            .add_block_rule(user_rule("4.3.2.1", true, 0))
            .unwrap();
        assert_ne!(first, second);

        let persisted = ProcessorConfig::load(&dir.path().join(PROCESSOR_CONFIG_FILE)).unwrap();
        assert_eq!(persisted.blocklist.rules.len(), 2);
    }

    #[tokio::test]
    async fn test_toggle_enabled_keeps_kernel_membership() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &[]).await;

        let id = processor
            .add_block_rule(user_rule("9.9.9.9", true, 0))
            .unwrap();
        let mut rule = processor.config().blocklist.rules[0].clone();

        rule.enabled = false;
        processor.update_block_rule(&id, rule.clone()).unwrap();
        rule.enabled = true;
        processor.update_block_rule(&id, rule).unwrap();

        // add, delete, add: net membership unchanged
        assert_eq!(kernel.adds(), ["9.9.9.9", "9.9.9.9"]);
        assert_eq!(kernel.deletes(), ["9.9.9.9"]);
        assert!(processor.config().blocklist.rules[0].enabled);
    }

    #[tokio::test]
    async fn test_update_unknown_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _kernel, _sink) = build_processor(dir.path(), &[]).await;
        assert!(processor
            .update_block_rule("missing", user_rule("1.1.1.1", true, 0))
            .is_err());
    }

    #[tokio::test]
    async fn test_delete_effective_rule_cleans_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &[]).await;

        let id = processor
            .add_block_rule(user_rule("7.7.7.7", true, 0))
            .unwrap();
        processor.delete_block_rule(&id).unwrap();
        assert_eq!(kernel.deletes(), ["7.7.7.7"]);
        assert!(processor.config().blocklist.rules.is_empty());

        // disabled rules never reach the kernel, so deleting one is list-only
        let id = processor
            .add_block_rule(user_rule("8.8.4.4", false, 0))
            .unwrap();
        processor.delete_block_rule(&id).unwrap();
        assert_eq!(kernel.deletes(), ["7.7.7.7"]);
    }

    #[tokio::test]
    async fn test_expired_rule_auto_disabled_at_enable_time() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &[]).await;

        let expired = epoch_now() - 10;
        processor
            .add_block_rule(user_rule("6.6.6.6", true, expired))
            .unwrap();
        assert!(kernel.adds().is_empty(), "expired rule must not reach the kernel");
        assert!(!processor.config().blocklist.rules[0].enabled);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &[]).await;

        processor
            .add_block_rule(user_rule("3.3.3.3", true, epoch_now() + 1))
            .unwrap();
        processor
            .add_block_rule(user_rule("4.4.4.4", true, 0))
            .unwrap();
        assert_eq!(kernel.adds(), ["3.3.3.3", "4.4.4.4"]);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        processor.cleanup_block_rules();

        let config = processor.config();
        assert_eq!(config.blocklist.rules.len(), 1);
        assert_eq!(config.blocklist.rules[0].value, "4.4.4.4");
        assert_eq!(kernel.deletes(), ["3.3.3.3"]);
    }

    #[tokio::test]
    async fn test_cleanup_purges_stale_window_states() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _kernel, _sink) = build_processor(dir.path(), &["5.5.5.5"]).await;

        processor.process(packet_from([5, 5, 5, 5]));
        assert_eq!(processor.window_state_count("5.5.5.5"), Some(1));

        // shrink the window so the state is already stale
        processor
            .update_config(|config| {
                config.threat_intel.match_window_secs = 0;
                Ok(())
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        processor.cleanup_window_states();
        assert_eq!(processor.window_state_count("5.5.5.5"), None);
    }

    #[tokio::test]
    async fn test_sync_rules_to_kernel_reinstalls_effective() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, kernel, _sink) = build_processor(dir.path(), &[]).await;

        processor
            .add_block_rule(user_rule("1.0.0.1", true, 0))
            .unwrap();
        processor
            .add_block_rule(user_rule("1.0.0.2", false, 0))
            .unwrap();
        processor
            .add_block_rule(user_rule("1.0.0.3", true, epoch_now() + 3600))
            .unwrap();

        let before = kernel.adds().len();
        processor.sync_rules_to_kernel().unwrap();
        let added: Vec<String> = kernel.adds()[before..].to_vec();
        assert_eq!(added, ["1.0.0.1", "1.0.0.3"]);
    }

    #[tokio::test]
    async fn test_get_block_rules_paging() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _kernel, _sink) = build_processor(dir.path(), &[]).await;
        for i in 0..5 {
            processor
                .add_block_rule(user_rule(&format!("10.0.0.{i}"), false, 0))
                .unwrap();
        }
        let (page, total) = processor.get_block_rules(1, 2);
        assert_eq!((page.len(), total), (2, 5));
        let (page, _) = processor.get_block_rules(3, 2);
        assert_eq!(page.len(), 1);
        let (page, _) = processor.get_block_rules(4, 2);
        assert!(page.is_empty());
    }

    fn user_rule(value: &str, enabled: bool, expire_time: i64) -> BlockRule {
        BlockRule {
            id: String::new(),
            value: value.to_string(),
            note: "manual".to_string(),
            source: BlockSource::User,
            create_time: epoch_now(),
            expire_time,
            enabled,
            extra: HashMap::new(),
        }
    }
}
