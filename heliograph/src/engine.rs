//! Engine façade: configuration, startup, write submission, teardown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use heliograph_resp::Command;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::host::{load_host_file, Host, HostAddr};
use crate::pool::ReaderPool;
use crate::queue::WriteQueue;
use crate::reader::Reader;
use crate::writer;

/// Default bound on pooled reader handles.
pub const DEFAULT_READER_MAX: usize = 10;

/// Default reader retry budget per call.
pub const DEFAULT_READER_RETRY: u32 = 1;

/// Default blocking-I/O timeout for reader connections.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Word-sized engine flags. The loop thread owns most transitions;
/// submission paths read them to decide whether to signal the loop.
#[derive(Debug, Default)]
pub(crate) struct Flags {
    ready: AtomicBool,
    shutdown: AtomicBool,
    in_run: AtomicBool,
    in_thread: AtomicBool,
    send_pending: AtomicBool,
}

impl Flags {
    pub(crate) fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn in_run(&self) -> bool {
        self.in_run.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_run(&self, v: bool) {
        self.in_run.store(v, Ordering::Release);
    }

    pub(crate) fn in_thread(&self) -> bool {
        self.in_thread.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_thread(&self, v: bool) {
        self.in_thread.store(v, Ordering::Release);
    }

    /// Arm the wake-up re-entrancy guard; true when it was clear.
    pub(crate) fn arm_send_pending(&self) -> bool {
        !self.send_pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn force_send_pending(&self) {
        self.send_pending.store(true, Ordering::Release);
    }

    pub(crate) fn clear_send_pending(&self) {
        self.send_pending.store(false, Ordering::Release);
    }
}

/// State shared between caller threads, reader handles and the writer
/// loop.
pub(crate) struct Shared {
    pub(crate) hosts: RwLock<Vec<Arc<Host>>>,
    pub(crate) wqueue: WriteQueue,
    pub(crate) pool: ReaderPool,
    pub(crate) flags: Flags,
    pub(crate) wake_tx: flume::Sender<()>,
    pub(crate) sync_timeout: Mutex<Option<Duration>>,
    pub(crate) reader_max: AtomicUsize,
    pub(crate) reader_retry: AtomicU32,
    pub(crate) post_connect: Mutex<Vec<Bytes>>,
}

impl Shared {
    /// Snapshot of the host list, preferred host first.
    pub(crate) fn host_snapshot(&self) -> Vec<Arc<Host>> {
        self.hosts.read().clone()
    }

    /// Submission-side wake-up: only when the engine is Ready, not
    /// shutting down, and no wake-up is already pending.
    pub(crate) fn trigger(&self) {
        if self.flags.ready() && !self.flags.shutdown() && self.flags.arm_send_pending() {
            let _ = self.wake_tx.try_send(());
        }
    }

    /// Loop-side wake-up, fired unconditionally (Ready latch, host
    /// connect) so queued traffic drains without a fresh submission.
    pub(crate) fn fire_wake(&self) {
        self.flags.force_send_pending();
        let _ = self.wake_tx.try_send(());
    }
}

/// The mirrored-writer engine.
///
/// One engine owns an ordered list of backend hosts, a write queue
/// drained by a single event loop, and a pool of synchronous reader
/// handles. Configure it fully before starting the loop with
/// [`run`](Engine::run) or [`run_thread`](Engine::run_thread).
///
/// # Examples
///
/// ```no_run
/// use heliograph::{Engine, HostAddr, Command};
///
/// # fn main() -> heliograph::Result<()> {
/// let engine = Engine::new();
/// engine.host_add(HostAddr::tcp("10.0.0.1", 6379))?;
/// engine.host_add(HostAddr::tcp("10.0.0.2", 6379))?;
/// engine.run_thread()?;
///
/// // Mirrored fire-and-forget write.
/// engine.write(Command::new("SET").arg("k").arg("v"))?;
///
/// // Synchronous read with failover.
/// let mut reader = engine.reader();
/// if let Some(reply) = reader.cmd(Command::new("GET").arg("k")) {
///     println!("{reply}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    wake_rx: Mutex<Option<flume::Receiver<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build a new engine with default configuration.
    #[must_use]
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        let shared = Arc::new(Shared {
            hosts: RwLock::new(Vec::new()),
            wqueue: WriteQueue::new(),
            pool: ReaderPool::new(),
            flags: Flags::default(),
            wake_tx,
            sync_timeout: Mutex::new(Some(DEFAULT_SYNC_TIMEOUT)),
            reader_max: AtomicUsize::new(DEFAULT_READER_MAX),
            reader_retry: AtomicU32::new(DEFAULT_READER_RETRY),
            post_connect: Mutex::new(Vec::new()),
        });
        Self {
            shared,
            wake_rx: Mutex::new(Some(wake_rx)),
            thread: Mutex::new(None),
        }
    }

    /// Register a backend. The first host added becomes the preferred
    /// host: reader handles re-bind to it whenever it is reachable.
    ///
    /// # Errors
    ///
    /// [`Error::Running`] once the event loop has started.
    pub fn host_add(&self, addr: HostAddr) -> Result<()> {
        if self.shared.flags.in_run() {
            return Err(Error::Running);
        }
        debug!(host = %addr, "adding host");
        self.shared.hosts.write().push(Arc::new(Host::new(addr)));
        Ok(())
    }

    /// Register backends from a host file (one `target[:port]` per line,
    /// `#` comments). Returns the number of hosts loaded.
    ///
    /// # Errors
    ///
    /// I/O failures, an over-sized file, or [`Error::Running`].
    pub fn host_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let addrs = load_host_file(path.as_ref())?;
        let count = addrs.len();
        for addr in addrs {
            self.host_add(addr)?;
        }
        Ok(count)
    }

    /// Set the blocking-I/O timeout applied to reader connections
    /// (TCP only). `Duration::ZERO` disables the timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.shared.sync_timeout.lock() = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
    }

    /// Bound the reader pool (default [`DEFAULT_READER_MAX`]).
    pub fn set_reader_max(&self, max: usize) {
        self.shared.reader_max.store(max.max(1), Ordering::Relaxed);
    }

    /// Retry budget for reader calls that held a connection at entry
    /// (default [`DEFAULT_READER_RETRY`]).
    pub fn set_reader_retry(&self, retry: u32) {
        self.shared.reader_retry.store(retry, Ordering::Relaxed);
    }

    /// Register a post-connect command (authentication, `SELECT`, ...)
    /// replayed on every successful connect, async and sync alike,
    /// ahead of user traffic.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommand`] if the command does not encode, or
    /// [`Error::Running`] once the loop has started.
    pub fn post_connect(&self, command: Command) -> Result<()> {
        if self.shared.flags.in_run() {
            return Err(Error::Running);
        }
        let frame = command.into_bytes().map_err(|_| Error::InvalidCommand)?;
        self.shared.post_connect.lock().push(frame);
        Ok(())
    }

    /// Submit a command for mirrored delivery to every connected host.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommand`] if the command does not encode; queueing
    /// itself cannot fail.
    pub fn write(&self, command: Command) -> Result<()> {
        let frame = command.into_bytes().map_err(|_| Error::InvalidCommand)?;
        self.write_raw(frame)
    }

    /// Submit from an argument vector, name first.
    pub fn write_args<I, A>(&self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.write(Command::from_args(args))
    }

    /// Submit a preformatted wire frame. On success the engine owns the
    /// frame until it is delivered or dropped.
    pub fn write_raw(&self, frame: Bytes) -> Result<()> {
        if frame.is_empty() {
            return Err(Error::InvalidCommand);
        }
        self.shared.wqueue.push(frame);
        self.shared.trigger();
        Ok(())
    }

    /// Number of commands still queued for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.wqueue.len()
    }

    /// Run the event loop on the calling thread. Blocks until
    /// [`shutdown`](Engine::shutdown) completes.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if the loop was started before, or an
    /// I/O error from event-loop setup.
    pub fn run(&self) -> Result<()> {
        let wake_rx = self
            .wake_rx
            .lock()
            .take()
            .ok_or(Error::AlreadyRunning)?;
        self.shared.flags.set_in_run(true);
        let res = writer::run(self.shared.clone(), wake_rx, None);
        self.shared.flags.set_in_run(false);
        res
    }

    /// Run the event loop on a dedicated thread. Returns once the loop
    /// is live, synchronised through a one-shot start barrier.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] if the loop was started before, or an
    /// I/O error from thread spawn.
    pub fn run_thread(&self) -> Result<()> {
        if self.shared.flags.in_thread() {
            return Ok(());
        }
        let Some(wake_rx) = self.wake_rx.lock().take() else {
            // Repeated thread starts are idempotent; anything else is a
            // second start of an already-running loop.
            return if self.thread.lock().is_some() {
                Ok(())
            } else {
                Err(Error::AlreadyRunning)
            };
        };

        let (started_tx, started_rx) = flume::bounded(1);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("heliograph-writer".into())
            .spawn(move || {
                shared.flags.set_in_thread(true);
                shared.flags.set_in_run(true);
                if let Err(err) = writer::run(shared.clone(), wake_rx, Some(started_tx)) {
                    error!(%err, "writer loop failed");
                }
                shared.flags.set_in_run(false);
                shared.flags.set_in_thread(false);
            })?;
        *self.thread.lock() = Some(handle);

        // Block until the loop signals it is running (or died trying).
        let _ = started_rx.recv();
        Ok(())
    }

    /// Acquire a reader handle from the pool, blocking while the pool is
    /// exhausted. The handle returns to the pool on drop.
    #[must_use]
    pub fn reader(&self) -> Reader {
        Reader::acquire(self.shared.clone())
    }

    /// Request shutdown. This is a latch: the event loop observes it at
    /// the next timer tick, disconnects every host, and exits once none
    /// remains connected.
    pub fn shutdown(&self) {
        debug!("shutdown requested");
        self.shared.flags.set_shutdown();
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    /// Teardown: request shutdown and join the loop thread if one was
    /// started. Commands still queued at this point are dropped with the
    /// queue; forced teardown loses unsent writes.
    fn drop(&mut self) {
        self.shared.flags.set_shutdown();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
