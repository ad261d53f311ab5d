//! Elastic worker pool between the perf-event producer and the packet
//! processor.
//!
//! A single producer task feeds a bounded queue; workers scale between
//! `min_workers` and `max_workers` based on queue depth and retire after
//! sitting idle. Processor panics are confined to the task that hit them.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool is not configured: {0} not registered")]
    NotConfigured(&'static str),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// How often the monitor samples queue depth.
    pub scale_interval: Duration,
    /// How long a worker may sit idle before retiring.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            queue_size: 1024,
            min_workers: 1,
            max_workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            scale_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

type Processor<T> = Arc<dyn Fn(T) + Send + Sync>;
type ProducerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Producer<T> = Box<dyn FnOnce(PoolSender<T>) -> ProducerFuture + Send>;

/// Handle the producer uses to push records into the queue.
pub struct PoolSender<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl<T> Clone for PoolSender<T> {
    fn clone(&self) -> PoolSender<T> {
        PoolSender {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> PoolSender<T> {
    /// Push one record, blocking while the queue is full. Returns false
    /// once the pool is closed.
    pub async fn submit(&self, item: T) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.tx.send(item) => {
                if sent.is_ok() {
                    self.depth.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// Shared state cloned into every worker and the monitor.
struct WorkerShared<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    depth: Arc<AtomicUsize>,
    workers: Arc<AtomicUsize>,
    min_workers: usize,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    processor: Processor<T>,
}

impl<T> Clone for WorkerShared<T> {
    fn clone(&self) -> WorkerShared<T> {
        WorkerShared {
            rx: self.rx.clone(),
            depth: self.depth.clone(),
            workers: self.workers.clone(),
            min_workers: self.min_workers,
            idle_timeout: self.idle_timeout,
            shutdown: self.shutdown.clone(),
            processor: self.processor.clone(),
        }
    }
}

pub struct ElasticPool<T> {
    config: PoolConfig,
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    depth: Arc<AtomicUsize>,
    workers: Arc<AtomicUsize>,
    producer: std::sync::Mutex<Option<Producer<T>>>,
    processor: std::sync::Mutex<Option<Processor<T>>>,
    shutdown: CancellationToken,
}

impl<T: Send + 'static> ElasticPool<T> {
    pub fn new(config: PoolConfig) -> ElasticPool<T> {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        ElasticPool {
            config,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: Arc::new(AtomicUsize::new(0)),
            workers: Arc::new(AtomicUsize::new(0)),
            producer: std::sync::Mutex::new(None),
            processor: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register the task that feeds the queue. Runs once, on `start`.
    pub fn set_producer<F, Fut>(&self, producer: F)
    where
        F: FnOnce(PoolSender<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.producer.lock().unwrap() =
            Some(Box::new(move |sender| Box::pin(producer(sender)) as ProducerFuture));
    }

    /// Register the per-record processor executed by the workers.
    pub fn set_processor<F>(&self, processor: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        *self.processor.lock().unwrap() = Some(Arc::new(processor));
    }

    /// Spawn the initial workers, the producer, and the scale monitor.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut producer_slot = self.producer.lock().unwrap();
        if producer_slot.is_none() {
            return Err(PoolError::NotConfigured("producer"));
        }
        let processor = self
            .processor
            .lock()
            .unwrap()
            .clone()
            .ok_or(PoolError::NotConfigured("processor"))?;
        let producer = producer_slot.take().expect("checked above");
        drop(producer_slot);

        let shared = WorkerShared {
            rx: self.rx.clone(),
            depth: self.depth.clone(),
            workers: self.workers.clone(),
            min_workers: self.config.min_workers,
            idle_timeout: self.config.idle_timeout,
            shutdown: self.shutdown.clone(),
            processor,
        };

        for _ in 0..self.config.min_workers {
            Self::spawn_worker(shared.clone());
        }

        let sender = PoolSender {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(producer(sender));

        self.spawn_monitor(shared);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Signal every task to stop. Pending queue items are not drained.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    fn spawn_monitor(&self, shared: WorkerShared<T>) {
        let queue_size = self.config.queue_size;
        let max_workers = self.config.max_workers;
        let scale_interval = self.config.scale_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scale_interval);
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if shared.depth.load(Ordering::SeqCst) > queue_size / 2
                            && shared.workers.load(Ordering::SeqCst) < max_workers
                        {
                            debug!("queue depth above threshold, scaling up");
                            Self::spawn_worker(shared.clone());
                        }
                    }
                }
            }
        });
    }

    fn spawn_worker(shared: WorkerShared<T>) {
        // counted before the task runs so the monitor sees it immediately
        shared.workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                let rx = shared.rx.clone();
                let recv = async move { rx.lock().await.recv().await };
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    received = tokio::time::timeout(shared.idle_timeout, recv) => match received {
                        Ok(Some(item)) => {
                            shared.depth.fetch_sub(1, Ordering::SeqCst);
                            // a panicking processor must not take the worker down
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (shared.processor)(item))) {
                                error!("worker recovered from processor panic: {}", panic_message(&panic));
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            // idle: retire only while staying at or above the floor
                            if Self::try_retire(&shared.workers, shared.min_workers) {
                                return;
                            }
                        }
                    }
                }
            }
            shared.workers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Decrement the worker count if doing so keeps it at `min` or above.
    /// The CAS keeps the observable count inside [min, max] even when
    /// several workers time out at once.
    fn try_retire(workers: &AtomicUsize, min: usize) -> bool {
        let mut current = workers.load(Ordering::SeqCst);
        while current > min {
            match workers.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

// =============================================================================
// Tests
// =============================================================================
