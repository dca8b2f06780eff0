//! Event-loop writer: mirror fan-out, host reconnection, shutdown.
//!
//! One loop owns everything async: a 1 Hz timer driving the host state
//! machines, a wake-up channel whose handler drains the write queue, and
//! a host-event channel on which spawned tasks report connect
//! conclusions and disconnects.
//!
//! One connected host == one write-pump task owning the stream and fed
//! over its own channel, which is what preserves per-connection FIFO.
//! The loop never blocks on a slow host; it hands the frame to the pump
//! and moves on.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, Sender};
use futures::FutureExt as _;
use tracing::{debug, error, warn};

use crate::engine::Shared;
use crate::host::{Host, HostAddr, HostState};
use crate::tcp::enable_tcp_keepalive;

/// Cadence of the connect/shutdown timer.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands kept queued while no host is connected. One past this bound,
/// undeliverable frames are dropped instead of re-queued.
pub const QUEUE_MAX_UNSHIFT: usize = 10_000;

/// Messages from the loop to a write pump.
enum PumpCmd {
    /// Send a preformatted frame
    Write(Bytes),
    /// Flush and hang up
    Close,
}

/// Conclusions reported back to the loop by spawned connection tasks.
enum HostEvent {
    ConnectFinished {
        idx: usize,
        gen: u64,
        result: io::Result<WriterStream>,
    },
    Disconnected {
        idx: usize,
        gen: u64,
    },
}

enum WriterStream {
    Tcp(compio::net::TcpStream),
    #[cfg(unix)]
    Unix(compio::net::UnixStream),
}

impl WriterStream {
    async fn connect(addr: &HostAddr) -> io::Result<Self> {
        match addr {
            HostAddr::Tcp { host, port } => {
                use std::net::ToSocketAddrs as _;
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "host resolved to no address")
                    })?;
                let stream = compio::net::TcpStream::connect(addr).await?;
                if let Err(err) = enable_tcp_keepalive(&stream) {
                    debug!(%err, "tcp keepalive not applied");
                }
                Ok(Self::Tcp(stream))
            }
            #[cfg(unix)]
            HostAddr::Unix(path) => {
                Ok(Self::Unix(compio::net::UnixStream::connect(path).await?))
            }
            #[cfg(not(unix))]
            HostAddr::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets not supported on this platform",
            )),
        }
    }

    async fn write_all(&mut self, buf: Vec<u8>) -> io::Result<()> {
        use compio::buf::BufResult;
        use compio::io::AsyncWriteExt;

        let BufResult(res, _) = match self {
            Self::Tcp(s) => s.write_all(buf).await,
            #[cfg(unix)]
            Self::Unix(s) => s.write_all(buf).await,
        };
        res.map(|_| ())
    }
}

/// Kernel-facing half of one host connection: frames in channel order go
/// out in stream order. Exits (reporting a disconnect) on write failure,
/// on `Close`, or when the loop drops its sender.
async fn write_pump(
    mut stream: WriterStream,
    cmds: Receiver<PumpCmd>,
    events: Sender<HostEvent>,
    idx: usize,
    gen: u64,
) {
    while let Ok(cmd) = cmds.recv_async().await {
        match cmd {
            PumpCmd::Write(frame) => {
                if let Err(err) = stream.write_all(frame.to_vec()).await {
                    debug!(%err, "write pump error");
                    break;
                }
            }
            PumpCmd::Close => break,
        }
    }
    let _ = events.send(HostEvent::Disconnected { idx, gen });
}

/// One host's loop-local connection slot. `gen` increments per connect
/// attempt so conclusions from superseded attempts are ignored.
struct HostSlot {
    conn: Option<Sender<PumpCmd>>,
    gen: u64,
}

struct WriterLoop {
    shared: Arc<Shared>,
    hosts: Vec<Arc<Host>>,
    slots: Vec<HostSlot>,
    hosts_connected: usize,
    events_tx: Sender<HostEvent>,
    events_rx: Receiver<HostEvent>,
    wake_rx: Receiver<()>,
}

enum Step {
    Event(HostEvent),
    Drain,
    Tick,
    Closed,
}

/// Run the writer loop to completion on the calling thread.
pub(crate) fn run(
    shared: Arc<Shared>,
    wake_rx: Receiver<()>,
    started: Option<Sender<()>>,
) -> crate::Result<()> {
    let rt = compio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let hosts = shared.host_snapshot();
        let slots = hosts
            .iter()
            .map(|_| HostSlot { conn: None, gen: 0 })
            .collect();
        let (events_tx, events_rx) = flume::unbounded();
        let mut wl = WriterLoop {
            shared,
            hosts,
            slots,
            hosts_connected: 0,
            events_tx,
            events_rx,
            wake_rx,
        };

        // Release the start barrier: the loop is live from here on.
        if let Some(tx) = started {
            let _ = tx.send(());
        }

        wl.event_loop().await;
    });
    Ok(())
}

impl WriterLoop {
    async fn event_loop(&mut self) {
        let events_rx = self.events_rx.clone();
        let wake_rx = self.wake_rx.clone();
        let mut next_tick = Instant::now();

        loop {
            if Instant::now() >= next_tick {
                if self.tick() {
                    break;
                }
                next_tick = Instant::now() + TICK_INTERVAL;
            }

            let wait = next_tick.saturating_duration_since(Instant::now());
            let step = {
                let sleep = compio::time::sleep(wait).fuse();
                futures::pin_mut!(sleep);
                futures::select! {
                    ev = events_rx.recv_async().fuse() => match ev {
                        Ok(ev) => Step::Event(ev),
                        Err(_) => Step::Closed,
                    },
                    wake = wake_rx.recv_async().fuse() => match wake {
                        Ok(()) => Step::Drain,
                        Err(_) => Step::Closed,
                    },
                    _ = sleep => Step::Tick,
                }
            };

            match step {
                Step::Event(ev) => self.handle_event(ev),
                Step::Drain => self.drain(),
                Step::Tick => {}
                Step::Closed => break,
            }
        }
        debug!("writer loop stopped");
    }

    /// Timer tick: shutdown sequencing, reconnect attempts, Ready latch.
    /// Returns true when the loop should exit.
    fn tick(&mut self) -> bool {
        if self.shared.flags.shutdown() {
            return self.shutdown_tick();
        }

        for idx in 0..self.hosts.len() {
            if self.hosts[idx].tick_due() {
                self.spawn_connect(idx);
            }
        }

        if !self.shared.flags.ready()
            && self.hosts.iter().all(|h| h.is_init())
        {
            debug!("all hosts concluded a first attempt; engine ready");
            self.shared.flags.set_ready();
            self.shared.fire_wake();
        }
        false
    }

    /// Shutdown sequencing: first pass hangs up every connected host;
    /// the loop exits once none remains connected.
    fn shutdown_tick(&mut self) -> bool {
        if self.hosts_connected == 0 {
            return true;
        }
        let mut live = 0;
        for (idx, host) in self.hosts.iter().enumerate() {
            if host.state() == HostState::Connected {
                if let Some(conn) = &self.slots[idx].conn {
                    live += 1;
                    let _ = conn.send(PumpCmd::Close);
                }
            }
        }
        self.hosts_connected = live;
        self.hosts_connected == 0
    }

    fn spawn_connect(&mut self, idx: usize) {
        let host = &self.hosts[idx];
        host.begin_attempt();
        self.slots[idx].gen += 1;
        let gen = self.slots[idx].gen;
        let addr = host.addr().clone();
        let events = self.events_tx.clone();
        debug!(host = %addr, "connecting");
        compio::runtime::spawn(async move {
            let result = WriterStream::connect(&addr).await;
            let _ = events.send(HostEvent::ConnectFinished { idx, gen, result });
        })
        .detach();
    }

    fn handle_event(&mut self, ev: HostEvent) {
        match ev {
            HostEvent::ConnectFinished { idx, gen, result } => {
                if gen != self.slots[idx].gen {
                    return;
                }
                let host = self.hosts[idx].clone();
                match result {
                    Ok(stream) => self.host_connected(idx, gen, &host, stream),
                    Err(err) => {
                        debug!(host = %host.addr(), %err, "connect failed");
                        host.connect_failed();
                        self.slots[idx].conn = None;
                    }
                }
            }
            HostEvent::Disconnected { idx, gen } => {
                if gen != self.slots[idx].gen {
                    return;
                }
                let host = &self.hosts[idx];
                warn!(host = %host.addr(), "host disconnected");
                if host.state() == HostState::Connected {
                    self.hosts_connected -= 1;
                } else {
                    error!(host = %host.addr(), "disconnect event on host not marked connected");
                }
                host.connection_lost();
                self.slots[idx].conn = None;
            }
        }
    }

    fn host_connected(&mut self, idx: usize, gen: u64, host: &Arc<Host>, stream: WriterStream) {
        debug!(host = %host.addr(), "connected");

        // Post-connect commands go to the queue head, reversed, so they
        // run ahead of any user traffic queued before this connect.
        {
            let post_connect = self.shared.post_connect.lock();
            for frame in post_connect.iter().rev() {
                self.shared.wqueue.unshift(frame.clone());
            }
        }

        let (tx, rx) = flume::unbounded();
        compio::runtime::spawn(write_pump(stream, rx, self.events_tx.clone(), idx, gen)).detach();
        self.slots[idx].conn = Some(tx);
        host.connect_succeeded();
        self.hosts_connected += 1;

        // Anything buffered while this host was away can move now. Before
        // Ready, dispatch stays suppressed; the latch fires the first wake.
        if self.shared.flags.ready() && !self.shared.flags.shutdown() {
            self.shared.fire_wake();
        }
    }

    /// Drain the write queue, mirroring every frame to every connected
    /// host. A frame nobody accepted is pushed back (and draining stops)
    /// while the queue is under the overflow bound; past the bound it is
    /// dropped.
    fn drain(&mut self) {
        self.shared.flags.clear_send_pending();

        while let Some(frame) = self.shared.wqueue.shift() {
            let mut accepted = 0;
            for (idx, host) in self.hosts.iter().enumerate() {
                if host.state() != HostState::Connected {
                    continue;
                }
                if let Some(conn) = &self.slots[idx].conn {
                    if conn.send(PumpCmd::Write(frame.clone())).is_ok() {
                        accepted += 1;
                    }
                }
            }

            if accepted == 0 && self.shared.wqueue.len() < QUEUE_MAX_UNSHIFT {
                self.shared.wqueue.unshift(frame);
                break;
            }
            // Frame delivered to `accepted` pumps, or dropped on overflow.
        }
    }
}
