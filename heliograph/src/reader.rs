//! Synchronous reader handles: pipelining, failover, pub/sub.
//!
//! A reader wraps one blocking connection. Commands are appended without
//! I/O, then flushed lazily when a reply is requested, so a batch goes
//! out in one write and replies are consumed one at a time through the
//! `requested`/`replied` cursors. Host selection is lazy too: nothing
//! connects until the first reply call, and an I/O failure mid-call
//! fails over to a freshly selected host when the retry budget allows.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use heliograph_resp::{Command, Connection, Reply, RespError, DEFAULT_MAX_BUF};
use smallvec::SmallVec;
use tracing::{debug, error};

use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::host::{Host, HostAddr};

/// Pooled state of one reader: the connection, the bound host index and
/// the pipeline buffer. Lives in the pool between leases.
pub(crate) struct ReaderCore {
    conn: Option<Connection>,
    pub(crate) host: Option<usize>,
    cmds: SmallVec<[Bytes; 8]>,
    requested: usize,
    replied: usize,
    reply: Option<Reply>,
}

impl ReaderCore {
    pub(crate) fn new() -> Self {
        Self {
            conn: None,
            host: None,
            cmds: SmallVec::new(),
            requested: 0,
            replied: 0,
            reply: None,
        }
    }

    fn drop_conn(&mut self) {
        self.conn = None;
        self.host = None;
        self.reply = None;
    }
}

/// A leased reader handle.
///
/// Obtained from [`Engine::reader`](crate::Engine::reader); dropping the
/// handle clears it and returns it to the pool. Two handles never share
/// a connection and fail over independently.
pub struct Reader {
    core: ReaderCore,
    shared: Arc<Shared>,
}

impl Reader {
    pub(crate) fn acquire(shared: Arc<Shared>) -> Self {
        let max = shared.reader_max.load(Ordering::Relaxed);
        let core = shared.pool.acquire(max);
        Self { core, shared }
    }

    /// Append one command to the pipeline. Never performs I/O.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCommand`] if the command does not encode.
    pub fn append(&mut self, command: Command) -> Result<()> {
        let frame = command.into_bytes().map_err(|_| Error::InvalidCommand)?;
        self.append_raw(frame)
    }

    /// Append from an argument vector, name first.
    pub fn append_args<I, A>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.append(Command::from_args(args))
    }

    /// Append a preformatted wire frame.
    pub fn append_raw(&mut self, frame: Bytes) -> Result<()> {
        if frame.is_empty() {
            return Err(Error::InvalidCommand);
        }
        self.core.cmds.push(frame);
        Ok(())
    }

    /// Read the next pipelined reply, connecting or failing over as
    /// needed. Returns `None` when every appended command was already
    /// replied (API misuse, logged), when no host is reachable, or when
    /// the transport failed beyond the retry budget.
    pub fn reply(&mut self) -> Option<&Reply> {
        if self.core.replied >= self.core.cmds.len() {
            error!(
                replied = self.core.replied,
                appended = self.core.cmds.len(),
                "api misuse: all commands already replied"
            );
            return None;
        }

        // One retry against a fresh host, but only when this call
        // started out connected.
        let mut retry = if self.core.conn.is_some() {
            self.shared.reader_retry.load(Ordering::Relaxed)
        } else {
            0
        };

        loop {
            if !self.send_tail() {
                return None;
            }
            match self.core.conn.as_mut()?.read_reply() {
                Ok(reply) => {
                    // A successful read means the whole tail went out.
                    self.core.requested = self.core.cmds.len();
                    self.core.replied += 1;
                    self.core.reply = Some(reply);
                    return self.core.reply.as_ref();
                }
                Err(err) => {
                    debug!(%err, "reader transport error");
                    self.core.drop_conn();
                    if !err.is_retryable() || retry == 0 {
                        return None;
                    }
                    retry -= 1;
                }
            }
        }
    }

    /// Block for one reply without touching the pipelining cursors.
    /// Meant for subscription flows waiting on server-pushed messages.
    pub fn reply_blocking(&mut self) -> Option<&Reply> {
        if !self.ensure_conn() {
            return None;
        }
        match self.core.conn.as_mut()?.read_reply() {
            Ok(reply) => {
                self.core.reply = Some(reply);
                self.core.reply.as_ref()
            }
            Err(err) => {
                debug!(%err, "blocking read failed");
                self.core.drop_conn();
                None
            }
        }
    }

    /// Enter a pub/sub read loop. Requires at least one appended
    /// SUBSCRIBE-family command; acknowledgement replies are drained and
    /// discarded, then each call blocks for one pushed message. On
    /// reconnect the cursors reset so the subscriptions are re-sent.
    pub fn subscribe(&mut self) -> Option<&Reply> {
        if self.core.cmds.is_empty() {
            error!("api misuse: subscribe needs at least one appended command");
            return None;
        }

        let mut retry = if self.core.conn.is_some() {
            self.shared.reader_retry.load(Ordering::Relaxed)
        } else {
            0
        };

        loop {
            if !self.send_tail() {
                return None;
            }
            match self.subscribe_round() {
                Ok(reply) => {
                    self.core.reply = Some(reply);
                    return self.core.reply.as_ref();
                }
                Err(err) => {
                    debug!(%err, "subscribe transport error");
                    self.core.drop_conn();
                    // Reset so the subscribe commands go out again.
                    self.core.requested = 0;
                    self.core.replied = 0;
                    if !err.is_retryable() || retry == 0 {
                        return None;
                    }
                    retry -= 1;
                }
            }
        }
    }

    /// Drain subscription acknowledgements, then block for one message.
    fn subscribe_round(&mut self) -> heliograph_resp::Result<Reply> {
        let ReaderCore {
            conn: Some(conn),
            cmds,
            requested,
            replied,
            ..
        } = &mut self.core
        else {
            return Err(RespError::Eof);
        };

        while *replied < cmds.len() {
            let _ack = conn.read_reply()?;
            *replied += 1;
        }
        *requested = cmds.len();
        conn.read_reply()
    }

    /// Transfer ownership of the last reply to the caller. The handle
    /// forgets it and will not free it on reuse.
    pub fn reply_detach(&mut self) -> Option<Reply> {
        self.core.reply.take()
    }

    /// Append one command and read its reply.
    pub fn cmd(&mut self, command: Command) -> Option<&Reply> {
        if self.append(command).is_err() {
            return None;
        }
        self.reply()
    }

    /// [`cmd`](Self::cmd) from an argument vector, name first.
    pub fn cmd_args<I, A>(&mut self, args: I) -> Option<&Reply>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        if self.append_args(args).is_err() {
            return None;
        }
        self.reply()
    }

    /// Drain any replies the caller never consumed, drop buffered
    /// commands and reset the cursors. Called automatically on release.
    pub fn clear(&mut self) {
        while self.core.replied < self.core.cmds.len() {
            if self.reply().is_none() {
                break;
            }
        }
        self.core.cmds.clear();
        self.core.requested = 0;
        self.core.replied = 0;
    }

    /// Return the handle to the pool. Equivalent to dropping it.
    pub fn release(self) {}

    /// Flush point: make sure a connection exists and the unsent tail of
    /// the pipeline is queued on it.
    fn send_tail(&mut self) -> bool {
        if !self.ensure_conn() {
            return false;
        }
        let ReaderCore {
            conn: Some(conn),
            cmds,
            requested,
            ..
        } = &mut self.core
        else {
            return false;
        };
        for frame in &cmds[*requested..] {
            conn.append(frame);
        }
        true
    }

    /// Connect-or-failover. An existing connection wins. Otherwise, when
    /// the engine is Ready, hosts the writer currently sees as Connected
    /// are tried first; if none succeeds (or the engine is not Ready),
    /// one pass tries every host regardless of state.
    fn ensure_conn(&mut self) -> bool {
        if self.core.conn.is_some() {
            // A live handle invalidates the previously retained reply.
            self.core.reply = None;
            return true;
        }

        let hosts = self.shared.host_snapshot();
        if self.shared.flags.ready() {
            for (idx, host) in hosts.iter().enumerate() {
                if host.is_connected() && self.try_connect(idx, host) {
                    return true;
                }
            }
        }
        for (idx, host) in hosts.iter().enumerate() {
            if self.try_connect(idx, host) {
                return true;
            }
        }
        false
    }

    fn try_connect(&mut self, idx: usize, host: &Host) -> bool {
        let conn = match host.addr() {
            HostAddr::Tcp { host, port } => Connection::connect_tcp(host, *port),
            #[cfg(unix)]
            HostAddr::Unix(path) => Connection::connect_unix(path),
            #[cfg(not(unix))]
            HostAddr::Unix(_) => return false,
        };
        let mut conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                debug!(host = %host.addr(), %err, "sync connect failed");
                return false;
            }
        };

        if host.addr().is_tcp() {
            let _ = conn.enable_keepalive();
            let timeout = *self.shared.sync_timeout.lock();
            if timeout.is_some() {
                let _ = conn.set_timeout(timeout);
            }
        }
        conn.set_max_buf(2 * DEFAULT_MAX_BUF);

        if !replay_post_connect(&self.shared, &mut conn) {
            return false;
        }

        self.core.conn = Some(conn);
        self.core.host = Some(idx);
        self.core.reply = None;
        true
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.clear();

        // A handle that drifted off the preferred host drops its
        // connection once the preferred host is back, so the next
        // acquisition re-binds to it.
        if self.core.host.is_some_and(|idx| idx != 0) {
            let hosts = self.shared.host_snapshot();
            if hosts.first().is_some_and(|h| h.is_connected()) {
                debug!("dropping reader connection bound to non-preferred host");
                self.core.drop_conn();
            }
        }

        let core = std::mem::replace(&mut self.core, ReaderCore::new());
        self.shared.pool.release(core);
    }
}

/// Issue the post-connect commands inline and drain their replies. A
/// transport failure or an error reply aborts the connection attempt.
fn replay_post_connect(shared: &Shared, conn: &mut Connection) -> bool {
    let frames = shared.post_connect.lock().clone();
    for frame in &frames {
        conn.append(frame);
    }
    for _ in &frames {
        match conn.read_reply() {
            Ok(reply) if !reply.is_error() => {}
            Ok(_) => {
                error!("post-connect command rejected by server");
                return false;
            }
            Err(err) => {
                error!(%err, "post-connect command failed");
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Flags, DEFAULT_READER_MAX, DEFAULT_READER_RETRY, DEFAULT_SYNC_TIMEOUT};
    use crate::pool::ReaderPool;
    use crate::queue::WriteQueue;
    use bytes::Bytes;
    use parking_lot::{Mutex, RwLock};
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_shared(addrs: Vec<HostAddr>) -> Arc<Shared> {
        // No loop in these tests: wake-ups are fired into the void.
        let (wake_tx, _wake_rx) = flume::bounded(1);
        Arc::new(Shared {
            hosts: RwLock::new(addrs.into_iter().map(|a| Arc::new(Host::new(a))).collect()),
            wqueue: WriteQueue::new(),
            pool: ReaderPool::new(),
            flags: Flags::default(),
            wake_tx,
            sync_timeout: Mutex::new(Some(DEFAULT_SYNC_TIMEOUT)),
            reader_max: AtomicUsize::new(DEFAULT_READER_MAX),
            reader_retry: AtomicU32::new(DEFAULT_READER_RETRY),
            post_connect: Mutex::new(Vec::new()),
        })
    }

    /// Backend that answers one scripted chunk per request burst, then
    /// parks until the client goes away.
    fn script_server(chunks: Vec<&'static [u8]>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            for chunk in chunks {
                match stream.read(&mut buf) {
                    Ok(n) if n > 0 => {}
                    _ => return,
                }
                if stream.write_all(chunk).is_err() {
                    return;
                }
            }
            let _ = stream.read(&mut buf);
        });
        port
    }

    /// Backend that serves exactly one request and then disappears,
    /// signalling once its port is closed.
    fn one_shot_server(response: &'static [u8]) -> (u16, mpsc::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(response);
            drop(stream);
            drop(listener);
            let _ = done_tx.send(());
        });
        (port, done_rx)
    }

    #[test]
    fn pipelined_replies_then_misuse_returns_none() {
        let port = script_server(vec![b"+x-value\r\n+y-value\r\n"]);
        let shared = test_shared(vec![HostAddr::tcp("127.0.0.1", port)]);
        let mut reader = Reader::acquire(shared);

        reader.append_args(["GET", "x"]).unwrap();
        reader.append_args(["GET", "y"]).unwrap();

        assert_eq!(
            reader.reply(),
            Some(&Reply::Status(Bytes::from_static(b"x-value")))
        );
        assert_eq!(reader.core.requested, 2);
        assert_eq!(reader.core.replied, 1);

        assert_eq!(
            reader.reply(),
            Some(&Reply::Status(Bytes::from_static(b"y-value")))
        );
        assert_eq!(reader.core.replied, 2);

        // Third call: everything already replied.
        assert!(reader.reply().is_none());
    }

    #[test]
    fn clear_drains_and_resets_cursors() {
        let port = script_server(vec![b"+a\r\n+b\r\n+c\r\n"]);
        let shared = test_shared(vec![HostAddr::tcp("127.0.0.1", port)]);
        let mut reader = Reader::acquire(shared);

        for key in ["a", "b", "c"] {
            reader.append_args(["GET", key]).unwrap();
        }
        assert!(reader.reply().is_some());

        reader.clear();
        assert!(reader.core.cmds.is_empty());
        assert_eq!(reader.core.requested, 0);
        assert_eq!(reader.core.replied, 0);

        // The connection survives a clear and the next batch reuses it.
        assert!(reader.core.conn.is_some());
    }

    #[test]
    fn detached_reply_survives_the_next_command() {
        let port = script_server(vec![b"$5\r\nfirst\r\n", b"$6\r\nsecond\r\n"]);
        let shared = test_shared(vec![HostAddr::tcp("127.0.0.1", port)]);
        let mut reader = Reader::acquire(shared);

        assert!(reader.cmd(Command::new("GET").arg("x")).is_some());
        let detached = reader.reply_detach().expect("reply to detach");
        assert!(reader.core.reply.is_none());
        assert!(reader.reply_detach().is_none(), "detach transfers exactly once");

        assert_eq!(
            reader.cmd(Command::new("GET").arg("y")),
            Some(&Reply::Bulk(Bytes::from_static(b"second")))
        );
        assert_eq!(detached, Reply::Bulk(Bytes::from_static(b"first")));
    }

    #[test]
    fn io_error_fails_over_to_the_next_host() {
        let (port_a, a_closed) = one_shot_server(b"+from-a\r\n");
        let port_b = script_server(vec![b"+from-b\r\n"]);
        let shared = test_shared(vec![
            HostAddr::tcp("127.0.0.1", port_a),
            HostAddr::tcp("127.0.0.1", port_b),
        ]);
        let mut reader = Reader::acquire(shared);

        assert_eq!(
            reader.cmd_args(["GET", "k"]),
            Some(&Reply::Status(Bytes::from_static(b"from-a")))
        );
        assert_eq!(reader.core.host, Some(0));

        // Wait for host A to be fully gone, then read through the dead
        // connection: EOF, drop, one retry against host B.
        a_closed.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            reader.cmd_args(["GET", "k"]),
            Some(&Reply::Status(Bytes::from_static(b"from-b")))
        );
        assert_eq!(reader.core.host, Some(1));
    }

    #[test]
    fn fresh_connection_failures_are_not_retried() {
        let port = portpicker::pick_unused_port().expect("free port");
        let shared = test_shared(vec![HostAddr::tcp("127.0.0.1", port)]);
        let mut reader = Reader::acquire(shared);

        assert!(reader.cmd_args(["GET", "k"]).is_none());
        assert!(reader.core.conn.is_none());
    }

    #[test]
    fn release_rebinds_to_preferred_host_when_it_returns() {
        let port_a = portpicker::pick_unused_port().expect("free port");
        let port_b = script_server(vec![b"+from-b\r\n"]);
        let shared = test_shared(vec![
            HostAddr::tcp("127.0.0.1", port_a),
            HostAddr::tcp("127.0.0.1", port_b),
        ]);

        let mut reader = Reader::acquire(shared.clone());
        assert!(reader.cmd_args(["GET", "k"]).is_some());
        assert_eq!(reader.core.host, Some(1), "preferred host is down");
        drop(reader);

        // Preferred host still down: the warm connection is kept.
        let reader = Reader::acquire(shared.clone());
        assert_eq!(reader.core.host, Some(1));
        assert!(reader.core.conn.is_some());
        drop(reader);

        // Writer marks the preferred host back up; release now drops the
        // non-preferred connection so the next lease re-binds.
        shared.host_snapshot()[0].connect_succeeded();
        let reader = Reader::acquire(shared.clone());
        drop(reader);

        let reader = Reader::acquire(shared);
        assert!(reader.core.conn.is_none());
        assert!(reader.core.host.is_none());
    }

    #[test]
    fn subscribe_requires_an_appended_command() {
        let shared = test_shared(vec![]);
        let mut reader = Reader::acquire(shared);
        assert!(reader.subscribe().is_none());
    }

    #[test]
    fn subscribe_drains_acks_and_returns_pushed_messages() {
        // One ack for the SUBSCRIBE command, then two pushed messages in
        // separate bursts (the second arrives without any request).
        let port = script_server(vec![
            b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nm1\r\n",
        ]);
        let shared = test_shared(vec![HostAddr::tcp("127.0.0.1", port)]);
        let mut reader = Reader::acquire(shared);

        reader.append_args(["SUBSCRIBE", "news"]).unwrap();
        let msg = reader.subscribe().expect("pushed message").clone();
        let Reply::Array(items) = &msg else {
            panic!("expected array push, got {msg:?}");
        };
        assert_eq!(items[2], Reply::Bulk(Bytes::from_static(b"m1")));
        assert_eq!(reader.core.replied, reader.core.cmds.len());
    }
}
