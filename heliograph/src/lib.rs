//! # Heliograph
//!
//! A mirrored fire-and-forget Redis writer with pooled synchronous
//! readers, for applications that fan writes out to a fleet of
//! Redis-compatible backends and read from whichever one is reachable.
//!
//! ## Architecture
//!
//! Heliograph is structured in two layers:
//!
//! - **`heliograph-resp`**: the wire protocol: reply algebra, decoder,
//!   command encoding, blocking connection
//! - **`heliograph`**: the engine (this crate): write queue, host state
//!   machines, event-loop writer, reader pool
//!
//! ## Writes
//!
//! Writes are mirrored, not sharded: every submitted command is
//! delivered to every currently connected host, fire-and-forget. A
//! single event loop (inline via [`Engine::run`] or on a dedicated
//! thread via [`Engine::run_thread`]) owns all async connections, a 1 Hz
//! timer drives reconnection with a two-speed retry policy, and commands
//! queue without loss while the whole fleet is away (up to
//! [`QUEUE_MAX_UNSHIFT`]).
//!
//! ## Reads
//!
//! Readers are plain blocking connections leased from a bounded pool.
//! Each handle pipelines appended commands, consumes replies one at a
//! time, fails over on transport errors, and re-binds to the preferred
//! host (the first one configured) whenever it is back.
//!
//! ```no_run
//! use heliograph::{Command, Engine, HostAddr};
//!
//! # fn main() -> heliograph::Result<()> {
//! let engine = Engine::new();
//! engine.host_file("/etc/heliograph/hosts.conf")?;
//! engine.post_connect(Command::new("AUTH").arg("s3cret"))?;
//! engine.run_thread()?;
//!
//! engine.write_args(["INCR", "hits"])?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery model
//!
//! Per-connection FIFO; at-most-once per host; no ordering across
//! hosts; above the queue bound, undeliverable commands are dropped.
//! Shutdown is a latch observed by the loop timer, which hangs up every
//! host before the loop exits.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod dev_tracing;
mod engine;
mod error;
mod host;
mod pool;
mod queue;
mod reader;
mod tcp;
mod writer;

pub use engine::{Engine, DEFAULT_READER_MAX, DEFAULT_READER_RETRY, DEFAULT_SYNC_TIMEOUT};
pub use error::{Error, Result};
pub use host::{HostAddr, DISCONNECTED_RETRIES, FAILED_RETRY_AFTER};
pub use reader::Reader;
pub use writer::QUEUE_MAX_UNSHIFT;

// Re-export the protocol layer; `Command` and `Reply` are part of the
// public API surface.
pub use heliograph_resp as resp;
pub use heliograph_resp::{Command, Reply};
