//! The lifecycle facade: wires the bus socket, the filesystem watch, the
//! mutex-protected shared state and the multiplexer worker together, and
//! exposes the init → run → shutdown surface described in §5/§9.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Interest, Poll};

use crate::error::{GatewayError, SendError};
use crate::frame::CanFrame;
use crate::mux::{self, BUS_TOKEN, WATCH_TOKEN};
use crate::protocol::{CTL_FILTER, CTL_MASK, UUID_FILTER, UUID_MASK};
use crate::socket::CanBus;
use crate::table::PortTable;
use crate::watch::Watcher;

/// The handful of values the distilled spec treats as build-time constants.
#[derive(Debug, Clone)]
pub struct Config {
    pub interface: String,
    pub symlink_dir: PathBuf,
    pub symlink_prefix: String,
    pub poll_timeout: Duration,
    pub recv_buffer_bytes: i32,
    /// Ping credit a newly (re-)discovered port starts with, and is reset to
    /// on every frame received from it; see the liveness sweep in §4.5.
    pub pings_before_disconnect: u8,
    /// Upper bound on simultaneously addressable ports; bounds the range
    /// `derive_port_number` reduces into.
    pub max_ports: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            symlink_dir: PathBuf::from("/tmp"),
            symlink_prefix: "ttyCAN0_".to_string(),
            poll_timeout: Duration::from_millis(1000),
            recv_buffer_bytes: 512,
            pings_before_disconnect: crate::table::PINGS_BEFORE_DISCONNECT,
            max_ports: crate::protocol::MAX_PORTS,
        }
    }
}

pub(crate) struct GatewayState {
    pub bus: CanBus,
    pub table: PortTable,
    pub watcher: Watcher,
    pub ping_cursor: usize,
    pub registry: mio::Registry,
    pub config: Config,
}

/// The single owning struct for a running gateway instance, per §9
/// ("a single owning struct passed to callers" rather than process globals).
pub struct Gateway {
    pub(crate) state: Arc<Mutex<GatewayState>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Binds the bus, installs filters, stands up the filesystem watch, and
    /// spawns the multiplexer worker. Any failure here unwinds cleanly: the
    /// bus socket closes via `Drop` before the error propagates.
    pub fn init(config: Config) -> Result<Self, GatewayError> {
        fn open_err(e: std::io::Error) -> GatewayError {
            GatewayError::Open(crate::error::OpenError::Io(e))
        }

        let bus = CanBus::open(&config.interface)?;
        bus.setup_filters(&[
            crate::frame::CanFilter::new(UUID_FILTER, UUID_MASK),
            crate::frame::CanFilter::new(CTL_FILTER, CTL_MASK),
        ])
        .map_err(open_err)?;
        bus.error_filter_drop_all().map_err(open_err)?;
        bus.set_recv_buffer_size(config.recv_buffer_bytes)
            .map_err(open_err)?;
        // Zero send buffer: writes block rather than silently drop frames
        // once the kernel queue is full (§6).
        bus.set_send_buffer_size(0).map_err(open_err)?;
        bus.set_read_timeout(Duration::from_secs(1)).map_err(open_err)?;
        bus.set_nonblocking().map_err(open_err)?;

        let watcher = Watcher::new().map_err(GatewayError::Watch)?;

        let poll = Poll::new().map_err(GatewayError::Spawn)?;
        let registry = poll.registry().try_clone().map_err(GatewayError::Spawn)?;
        registry
            .register(&mut SourceFd(&bus.as_raw_fd()), BUS_TOKEN, Interest::READABLE)
            .map_err(GatewayError::Spawn)?;
        registry
            .register(
                &mut SourceFd(&watcher.as_raw_fd()),
                WATCH_TOKEN,
                Interest::READABLE,
            )
            .map_err(GatewayError::Spawn)?;

        let table = PortTable::new(bus.as_raw_fd());

        let state = Arc::new(Mutex::new(GatewayState {
            bus,
            table,
            watcher,
            ping_cursor: 0,
            registry,
            config: config.clone(),
        }));

        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("can-mux".into())
                .spawn(move || mux::run(state, shutdown, poll))
                .map_err(GatewayError::Spawn)?
        };

        Ok(Self {
            state,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Sends a frame addressed to `id` with `payload` on the bus. Serialized
    /// by the same mutex that protects the port table, per §5.
    pub fn send(&self, id: u32, payload: &[u8]) -> Result<(), SendError> {
        let frame = CanFrame::new(id, payload).map_err(SendError::Frame)?;
        let state = self.state.lock().unwrap();
        state.bus.send(&frame).map_err(SendError::Io)
    }

    /// Runs one liveness/ping sweep (§4.5). The caller owns the cadence.
    pub fn ping_tick(&self) {
        crate::liveness::tick(&self.state);
    }

    /// Signals the worker to stop and blocks until it exits. Idempotent;
    /// a second call is a no-op.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
