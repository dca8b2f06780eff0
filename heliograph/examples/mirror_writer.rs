//! Mirrored write demo.
//!
//! Loads a host file, starts the writer loop on a dedicated thread, fans
//! a burst of writes out to every reachable host and waits for the queue
//! to drain.
//!
//! ```sh
//! cargo run --example mirror_writer -- hosts.conf
//! ```

use std::thread;
use std::time::Duration;

use heliograph::{Command, Engine};

fn main() -> heliograph::Result<()> {
    heliograph::dev_tracing::init_tracing();

    let host_file = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hosts.conf".into());

    let engine = Engine::new();
    let loaded = engine.host_file(&host_file)?;
    println!("loaded {loaded} hosts from {host_file}");

    engine.run_thread()?;

    for i in 0..10_000 {
        engine.write(Command::new("SET").arg(format!("demo:key:{i}")).arg_int(i))?;
    }

    // Fire-and-forget: delivery is asynchronous, so poll the queue.
    while engine.pending() > 0 {
        thread::sleep(Duration::from_millis(100));
    }
    println!("queue drained");

    engine.shutdown();
    Ok(())
}
