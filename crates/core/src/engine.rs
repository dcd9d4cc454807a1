//! `Engine`: the root struct §9 recommends in place of the original's
//! module-level globals (`RTL_TCP`, `SERVER`, `sample_rate`,
//! `rtl_tcp_resetting`). One `Engine` is created per process and handed by
//! `Arc` reference to every task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, mpsc, watch};

use crate::command::FRAME_LEN;
use crate::config::Config;
use crate::ip_filter::IpAccessFilter;
use crate::session::Session;

/// Bound on each session's outbound buffer queue (§3).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 250;

/// One fan-out chunk: either real (upstream/DSP) bytes or watchdog fill.
pub type Chunk = Arc<[u8]>;

/// Shared, process-wide state (§3 "Server State" + §9 `Engine`).
pub struct Engine {
    pub config: Config,
    pub ip_filter: IpAccessFilter,

    /// §3 "a session is in `clients` iff its socket is registered with the
    /// event loop" — `DashMap` gives us the concurrent map `clients_mutex`
    /// would otherwise protect, matching the teacher's `concurrent-sessions`
    /// daemon feature (`dashmap`).
    clients: DashMap<u64, Arc<Session>>,
    next_ident: AtomicU64,

    /// Process-global, torn-read-tolerant per §5 ("it only parameterizes
    /// the fill rate").
    sample_rate: AtomicU32,

    /// Upstream command queue shared between every session (producer) and
    /// the upstream link (consumer).
    pub commands_tx: mpsc::Sender<[u8; FRAME_LEN]>,
    pub commands_rx: Mutex<mpsc::Receiver<[u8; FRAME_LEN]>>,

    /// The 12-byte descriptor of the *current* upstream connection. `None`
    /// until the first byte arrives from upstream; replaced on reconnect.
    /// A `watch` channel lets newly admitted sessions await the first
    /// descriptor instead of polling.
    dongle_identifier_tx: watch::Sender<Option<Chunk>>,
    dongle_identifier_rx: watch::Receiver<Option<Chunk>>,

    /// Whether the current upstream connection is live (§3 "Upstream
    /// Link"). Read by the watchdog, written by the upstream task.
    connected: AtomicBool,

    /// Collapses concurrent reconnect attempts into one (§4.4, §9's
    /// "process-global reset flag... is a lock in disguise"). The upstream
    /// task is the sole reconnect loop in this design, so "collapsing
    /// concurrent attempts" becomes "the watchdog's forced reset wakes
    /// whichever wait the upstream task is already parked in, instead of
    /// racing a second connection attempt into existence."
    pub reset_requested: Notify,

    /// Bytes received from upstream since the watchdog last reset this
    /// counter (§3, §4.6). `Ordering::Relaxed` throughout: the watchdog
    /// only needs an eventually-consistent count, not a synchronization
    /// point.
    bytes_since_watchdog_tick: AtomicU64,
}

impl Engine {
    pub fn new(config: Config, ip_filter: IpAccessFilter) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (dongle_identifier_tx, dongle_identifier_rx) = watch::channel(None);
        let initial_rate = config.initial_sample_rate;
        Arc::new(Self {
            config,
            ip_filter,
            clients: DashMap::new(),
            next_ident: AtomicU64::new(0),
            sample_rate: AtomicU32::new(initial_rate),
            commands_tx,
            commands_rx: Mutex::new(commands_rx),
            dongle_identifier_tx,
            dongle_identifier_rx,
            connected: AtomicBool::new(false),
            reset_requested: Notify::new(),
            bytes_since_watchdog_tick: AtomicU64::new(0),
        })
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Relaxed);
    }

    /// Assigns the next monotonic, never-reused session identifier (§3).
    pub fn next_ident(&self) -> u64 {
        self.next_ident.fetch_add(1, Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    pub fn register_client(&self, session: Arc<Session>) {
        let ident = session.ident;
        let count = {
            self.clients.insert(ident, Arc::clone(&session));
            self.clients.len()
        };
        tracing::info!(ident, addr = %session.address, port = session.port, count, "client accepted");
    }

    pub fn remove_client(&self, ident: u64) {
        if self.clients.remove(&ident).is_some() {
            tracing::info!(ident, count = self.clients.len(), "client disconnected");
        }
    }

    /// §4.3 `broadcast(buf)`: enqueues `buf` into every live session's
    /// outbound queue exactly once. Sessions whose queue overflowed under
    /// `DROP_CLIENT` are removed after the scan so we never mutate the map
    /// while iterating it.
    pub fn broadcast(&self, data: Chunk) {
        let mut to_drop_client = Vec::new();
        for entry in &self.clients {
            if entry.value().add_data(Arc::clone(&data), self.config.cache_full_behaviour) {
                to_drop_client.push(*entry.key());
            }
        }
        for ident in to_drop_client {
            if let Some((_, session)) = self.clients.remove(&ident) {
                session.mark_closing();
            }
        }
    }

    pub fn set_dongle_identifier(&self, bytes: Chunk) {
        let _ = self.dongle_identifier_tx.send(Some(bytes));
    }

    /// Awaits the descriptor of the upstream connection active now or at
    /// any point in the future — the contract §8 requires for sessions
    /// admitted before any upstream link has connected yet.
    pub async fn wait_for_dongle_identifier(&self) -> Chunk {
        let mut rx = self.dongle_identifier_rx.clone();
        loop {
            if let Some(id) = rx.borrow().clone() {
                return id;
            }
            if rx.changed().await.is_err() {
                // Sender dropped only on process shutdown; park forever
                // rather than spin.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn record_upstream_bytes(&self, n: usize) {
        self.bytes_since_watchdog_tick
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Reads and resets the watchdog counter (§4.6 "reads and resets").
    pub fn take_watchdog_counter(&self) -> u64 {
        self.bytes_since_watchdog_tick.swap(0, Ordering::Relaxed)
    }

    /// Peeks the watchdog counter without resetting it, for early-abandon
    /// checks mid-fill (§4.6 "if at any point real upstream bytes arrive").
    pub fn watchdog_counter_is_nonzero(&self) -> bool {
        self.bytes_since_watchdog_tick.load(Ordering::Relaxed) != 0
    }
}
