//! XDP program lifecycle and kernel map updates.
//!
//! Owns the loaded eBPF objects and the perf-event readers. The six
//! indicator maps and the `events` perf ring are the contract with the
//! XDP program; everything here is the userspace half of that contract.

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::{Xdp, XdpFlags};
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{FilterError, PacketInfo, RuleValue, PACKET_INFO_SIZE};

/// Name of the entry program inside the XDP object file.
const XDP_PROGRAM: &str = "xdp_prog";

/// Perf buffer size per CPU, in pages. The kernel contract sizes the ring
/// to one system page.
const PERF_PAGES: usize = 1;

/// Capacity of the decoded-record channel feeding the worker pool.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Configuration and attach modes
// =============================================================================

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Interface the XDP program attaches to.
    pub interface: String,
    /// Path of the pre-built XDP object file.
    pub object_path: PathBuf,
}

/// XDP attach mode, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    Offload,
    Driver,
    Generic,
}

impl XdpMode {
    /// Modes are tried in this order; the first success wins.
    pub const ATTACH_ORDER: [XdpMode; 3] = [XdpMode::Offload, XdpMode::Driver, XdpMode::Generic];

    pub fn as_str(&self) -> &'static str {
        match self {
            XdpMode::Offload => "offload",
            XdpMode::Driver => "driver",
            XdpMode::Generic => "generic",
        }
    }

    fn flags(&self) -> XdpFlags {
        match self {
            XdpMode::Offload => XdpFlags::HW_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Generic => XdpFlags::SKB_MODE,
        }
    }
}

// =============================================================================
// Indicator maps
// =============================================================================

struct Maps {
    ipv4_list: BpfHashMap<MapData, [u8; 4], u32>,
    ipv4_cidr_trie: LpmTrie<MapData, [u8; 4], u32>,
    ipv6_list: BpfHashMap<MapData, [u8; 16], u32>,
    ipv6_cidr_trie: LpmTrie<MapData, [u8; 16], u32>,
    mac_list: BpfHashMap<MapData, [u8; 6], u32>,
}

impl Maps {
    fn take(bpf: &mut Ebpf) -> Result<Maps, FilterError> {
        fn take_map(bpf: &mut Ebpf, name: &'static str) -> Result<aya::maps::Map, FilterError> {
            bpf.take_map(name).ok_or(FilterError::MapNotFound(name))
        }
        Ok(Maps {
            ipv4_list: BpfHashMap::try_from(take_map(bpf, "ipv4_list")?)?,
            ipv4_cidr_trie: LpmTrie::try_from(take_map(bpf, "ipv4_cidr_trie")?)?,
            ipv6_list: BpfHashMap::try_from(take_map(bpf, "ipv6_list")?)?,
            ipv6_cidr_trie: LpmTrie::try_from(take_map(bpf, "ipv6_cidr_trie")?)?,
            mac_list: BpfHashMap::try_from(take_map(bpf, "mac_list")?)?,
        })
    }

    /// Dispatch a parsed value to its map. CIDR keys are prefix-length
    /// prefixed, which `lpm_trie::Key` lays out as the kernel expects.
    fn update(&mut self, value: &RuleValue, add: bool) -> Result<(), FilterError> {
        match value {
            RuleValue::V4(addr) => {
                let key = addr.octets();
                if add {
                    self.ipv4_list.insert(key, 1u32, 0)?;
                } else {
                    self.ipv4_list.remove(&key)?;
                }
            }
            RuleValue::V4Cidr(net) => {
                let key = Key::new(u32::from(net.prefix_len()), net.network().octets());
                if add {
                    self.ipv4_cidr_trie.insert(&key, 1u32, 0)?;
                } else {
                    self.ipv4_cidr_trie.remove(&key)?;
                }
            }
            RuleValue::V6(addr) => {
                let key = addr.octets();
                if add {
                    self.ipv6_list.insert(key, 1u32, 0)?;
                } else {
                    self.ipv6_list.remove(&key)?;
                }
            }
            RuleValue::V6Cidr(net) => {
                let key = Key::new(u32::from(net.prefix_len()), net.network().octets());
                if add {
                    self.ipv6_cidr_trie.insert(&key, 1u32, 0)?;
                } else {
                    self.ipv6_cidr_trie.remove(&key)?;
                }
            }
            RuleValue::Mac(mac) => {
                if add {
                    self.mac_list.insert(*mac, 1u32, 0)?;
                } else {
                    self.mac_list.remove(mac)?;
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Rule sink seam
// =============================================================================

/// Kernel-map side of the block-rule engine. The rule engine pushes values
/// through this seam, so tests can substitute a recording sink.
pub trait RuleSink: Send + Sync {
    fn add_rule(&self, value: &str) -> Result<(), FilterError>;
    fn delete_rule(&self, value: &str) -> Result<(), FilterError>;
}

// =============================================================================
// IngressFilter
// =============================================================================

/// One loaded generation of the XDP stack. Fields drop in declaration
/// order: readers are cancelled, then maps close, then the program detaches.
struct Loaded {
    cancel: CancellationToken,
    mode: XdpMode,
    maps: Maps,
    _events: AsyncPerfEventArray<MapData>,
    _bpf: Ebpf,
}

struct FilterShared {
    config: KernelConfig,
    loaded: Mutex<Option<Loaded>>,
    events_tx: mpsc::Sender<PacketInfo>,
    ring_closed_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    fatal: CancellationToken,
}

/// Cheaply cloneable handle to the XDP stack.
#[derive(Clone)]
pub struct IngressFilter {
    shared: Arc<FilterShared>,
    ring_closed_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
    supervisor_spawned: Arc<AtomicBool>,
}

impl IngressFilter {
    /// Create the filter and the channel its perf readers publish into.
    pub fn new(config: KernelConfig) -> (IngressFilter, mpsc::Receiver<PacketInfo>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (ring_closed_tx, ring_closed_rx) = mpsc::channel(8);
        let filter = IngressFilter {
            shared: Arc::new(FilterShared {
                config,
                loaded: Mutex::new(None),
                events_tx,
                ring_closed_tx,
                shutdown: CancellationToken::new(),
                fatal: CancellationToken::new(),
            }),
            ring_closed_rx: Arc::new(Mutex::new(Some(ring_closed_rx))),
            supervisor_spawned: Arc::new(AtomicBool::new(false)),
        };
        (filter, events_rx)
    }

    /// Load, attach and start reading events. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), FilterError> {
        self.shared.start_stack()?;
        if !self.supervisor_spawned.swap(true, Ordering::SeqCst) {
            if let Some(rx) = self.ring_closed_rx.lock().unwrap().take() {
                tokio::spawn(Arc::clone(&self.shared).supervise(rx));
            }
        }
        Ok(())
    }

    /// The attach mode of the currently loaded stack.
    pub fn mode(&self) -> Option<XdpMode> {
        self.shared.loaded.lock().unwrap().as_ref().map(|loaded| loaded.mode)
    }

    /// Cancelled when the stack dies and cannot be restarted.
    pub fn fatal_token(&self) -> CancellationToken {
        self.shared.fatal.clone()
    }

    pub fn add_rule(&self, value: &str) -> Result<(), FilterError> {
        self.shared.update_map(value, true)
    }

    pub fn delete_rule(&self, value: &str) -> Result<(), FilterError> {
        self.shared.update_map(value, false)
    }

    /// Detach the XDP program and release all kernel objects.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.teardown();
    }
}

impl RuleSink for IngressFilter {
    fn add_rule(&self, value: &str) -> Result<(), FilterError> {
        IngressFilter::add_rule(self, value)
    }

    fn delete_rule(&self, value: &str) -> Result<(), FilterError> {
        IngressFilter::delete_rule(self, value)
    }
}

impl FilterShared {
    fn update_map(&self, value: &str, add: bool) -> Result<(), FilterError> {
        // parse once, dispatch on the parsed type
        let parsed: RuleValue = value.parse()?;
        let mut guard = self.loaded.lock().unwrap();
        let loaded = guard.as_mut().ok_or(FilterError::NotRunning)?;
        loaded.maps.update(&parsed, add)
    }

    fn start_stack(&self) -> Result<(), FilterError> {
        let interface = &self.config.interface;
        let name = CString::new(interface.as_str())
            .map_err(|_| FilterError::InterfaceNotFound(interface.clone()))?;
        if unsafe { libc::if_nametoindex(name.as_ptr()) } == 0 {
            return Err(FilterError::InterfaceNotFound(interface.clone()));
        }

        raise_memlock_limit();

        let mut bpf = Ebpf::load_file(&self.config.object_path)?;
        let program: &mut Xdp = bpf
            .program_mut(XDP_PROGRAM)
            .ok_or(FilterError::ProgramNotFound(XDP_PROGRAM))?
            .try_into()?;
        program.load()?;
        let mode = attach(program, interface)?;
        info!(interface = %interface, mode = mode.as_str(), "XDP program attached");

        let maps = Maps::take(&mut bpf)?;
        let mut events = AsyncPerfEventArray::try_from(
            bpf.take_map("events").ok_or(FilterError::MapNotFound("events"))?,
        )?;

        let cancel = self.shutdown.child_token();
        let cpus =
            online_cpus().map_err(|(msg, err)| FilterError::OnlineCpus(format!("{msg}: {err}")))?;
        for cpu_id in cpus {
            let buf = events.open(cpu_id, Some(PERF_PAGES))?;
            self.spawn_reader(cpu_id, buf, cancel.clone());
        }

        *self.loaded.lock().unwrap() = Some(Loaded {
            cancel,
            mode,
            maps,
            _events: events,
            _bpf: bpf,
        });
        Ok(())
    }

    fn spawn_reader(
        &self,
        cpu_id: u32,
        mut buf: AsyncPerfEventArrayBuffer<MapData>,
        cancel: CancellationToken,
    ) {
        let events_tx = self.events_tx.clone();
        let ring_closed_tx = self.ring_closed_tx.clone();
        tokio::spawn(async move {
            let mut buffers = (0..16)
                .map(|_| BytesMut::with_capacity(PACKET_INFO_SIZE * 4))
                .collect::<Vec<_>>();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = buf.read_events(&mut buffers) => match result {
                        Ok(events) => {
                            for event_buf in buffers.iter().take(events.read) {
                                if let Some(packet) = PacketInfo::from_bytes(event_buf) {
                                    if events_tx.send(packet).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            debug!(cpu_id, "perf reader stopped: {err}");
                            let _ = ring_closed_tx.try_send(());
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Restart the load-attach-read cycle once per closed-ring error. A
    /// restart that itself fails is fatal for the daemon.
    async fn supervise(self: Arc<FilterShared>, mut ring_closed: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                signal = ring_closed.recv() => if signal.is_none() { return },
            }
            // collapse signals from sibling per-cpu readers
            while ring_closed.try_recv().is_ok() {}

            warn!("perf event ring closed, restarting the XDP stack");
            self.teardown();
            match self.start_stack() {
                Ok(()) => info!("XDP stack restarted"),
                Err(err) => {
                    error!("failed to restart XDP stack: {err}");
                    self.fatal.cancel();
                    return;
                }
            }
        }
    }

    fn teardown(&self) {
        if let Some(loaded) = self.loaded.lock().unwrap().take() {
            loaded.cancel.cancel();
            drop(loaded);
        }
    }
}

fn attach(program: &mut Xdp, interface: &str) -> Result<XdpMode, FilterError> {
    let mut failures = Vec::new();
    for mode in XdpMode::ATTACH_ORDER {
        match program.attach(interface, mode.flags()) {
            Ok(_) => return Ok(mode),
            Err(err) => failures.push(format!(
                "failed to attach XDP program in {} mode: {err}",
                mode.as_str()
            )),
        }
    }
    Err(FilterError::AttachFailed(failures.join("\n")))
}

fn raise_memlock_limit() {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        warn!("failed to raise memlock rlimit (ret {ret})");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_order() {
        assert_eq!(
            XdpMode::ATTACH_ORDER,
            [XdpMode::Offload, XdpMode::Driver, XdpMode::Generic]
        );
    }

    #[test]
    fn test_mode_names() {
        let names: Vec<_> = XdpMode::ATTACH_ORDER.iter().map(|m| m.as_str()).collect();
        assert_eq!(names, ["offload", "driver", "generic"]);
    }

    #[tokio::test]
    async fn test_rules_rejected_while_stopped() {
        let (filter, _events) = IngressFilter::new(KernelConfig {
            interface: "lo".to_string(),
            object_path: "xdp_firewall.o".into(),
        });
        assert!(matches!(
            filter.add_rule("10.0.0.1"),
            Err(FilterError::NotRunning)
        ));
        assert!(matches!(
            filter.delete_rule("10.0.0.1"),
            Err(FilterError::NotRunning)
        ));
        assert!(filter.mode().is_none());
    }

    #[tokio::test]
    async fn test_invalid_value_rejected_before_state_check() {
        let (filter, _events) = IngressFilter::new(KernelConfig {
            interface: "lo".to_string(),
            object_path: "xdp_firewall.o".into(),
        });
        assert!(matches!(
            filter.add_rule("not-a-value"),
            Err(FilterError::InvalidValue(_))
        ));
    }
}
