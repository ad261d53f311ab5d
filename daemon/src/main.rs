//! Ingress firewall control plane.
//!
//! Wires the kernel interface, the elastic worker pool, the packet
//! processor, and the threat-intelligence aggregator together, then runs
//! until a signal or a fatal kernel failure. Teardown closes components
//! in order with a one-second budget each.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use ingress_filter::{IngressFilter, KernelConfig, PacketInfo, RuleSink};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ingress_daemon::aggregator::ThreatAggregator;
use ingress_daemon::config::AppConfig;
use ingress_daemon::pool::{ElasticPool, PoolConfig};
use ingress_daemon::processor::{CountingSink, MetricsSink, Processor};

#[derive(Parser, Debug)]
#[command(name = "ingress-daemon")]
#[command(about = "XDP ingress firewall control plane")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    info!(
        "current configuration:\n{}",
        serde_yaml::to_string(&config).unwrap_or_default()
    );

    let pool = Arc::new(ElasticPool::<PacketInfo>::new(PoolConfig {
        queue_size: 1024,
        min_workers: 3,
        max_workers: std::thread::available_parallelism().map_or(8, |n| n.get() * 2),
        ..PoolConfig::default()
    }));

    let sink = Arc::new(CountingSink::new());
    let aggregator = ThreatAggregator::new(&config.data_dir)?;
    let (firewall, events_rx) = IngressFilter::new(KernelConfig {
        interface: config.interface.clone(),
        object_path: config.bpf_object.clone(),
    });

    let processor = Processor::new(
        &config.data_dir,
        Arc::new(firewall.clone()) as Arc<dyn RuleSink>,
        aggregator,
        sink.clone() as Arc<dyn MetricsSink>,
        None,
    )
    .await?;

    firewall.start().context("failed to start the XDP stack")?;
    // kernel maps start empty on every boot; re-install persisted rules
    processor.sync_rules_to_kernel()?;

    pool.set_producer(move |submit| async move {
        let mut events_rx = events_rx;
        while let Some(record) = events_rx.recv().await {
            if !submit.submit(record).await {
                return;
            }
        }
    });
    let pool_processor = Arc::clone(&processor);
    pool.set_processor(move |record| pool_processor.process(record));
    pool.start().context("failed to start the worker pool")?;

    let fatal = firewall.fatal_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        _ = fatal.cancelled() => error!("kernel interface failed permanently, shutting down"),
    }
    let failed = fatal.is_cancelled();

    close_with_timeout("kernel-interface", async { firewall.close() }).await;
    close_with_timeout("processor", processor.close()).await;
    close_with_timeout("pool", async { pool.close() }).await;

    let (packets, bytes, kernel_drops) = sink.totals();
    info!(packets, bytes, kernel_drops, "final traffic counters");

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Run a component's close path with a one-second budget; overruns are
/// logged and shutdown proceeds.
async fn close_with_timeout<F>(name: &str, close: F)
where
    F: Future<Output = ()>,
{
    let started = Instant::now();
    match tokio::time::timeout(Duration::from_secs(1), close).await {
        Ok(()) => info!(component = name, elapsed = ?started.elapsed(), "component closed"),
        Err(_) => warn!(component = name, "close timed out after 1s"),
    }
}
