//! Synchronous reader demo.
//!
//! Acquires one pooled reader, issues a pipelined batch and prints each
//! reply. Reads fail over to the next configured host automatically.
//!
//! ```sh
//! cargo run --example pipelined_reader -- 127.0.0.1:6379
//! ```

use heliograph::{Command, Engine, HostAddr};

fn main() -> heliograph::Result<()> {
    heliograph::dev_tracing::init_tracing();

    let addr: HostAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:6379".into())
        .parse()?;

    let engine = Engine::new();
    engine.host_add(addr)?;
    engine.run_thread()?;

    let mut reader = engine.reader();

    if let Some(reply) = reader.cmd(Command::new("SET").arg("demo:greeting").arg("hello")) {
        print!("SET\n{reply}");
    }

    reader.append(Command::new("GET").arg("demo:greeting"))?;
    reader.append(Command::new("INCR").arg("demo:visits"))?;
    for _ in 0..2 {
        match reader.reply() {
            Some(reply) => print!("{reply}"),
            None => {
                eprintln!("no host reachable");
                break;
            }
        }
    }

    drop(reader);
    engine.shutdown();
    Ok(())
}
