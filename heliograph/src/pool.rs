//! Bounded pool of reader cores.
//!
//! The pool is a LIFO free-stack behind a mutex/condvar pair: the most
//! recently released core is handed out first, so its connection is the
//! most likely to still be warm. The pool only ever grows, up to the
//! configured bound; cores live until engine teardown.

use parking_lot::{Condvar, Mutex};

use crate::reader::ReaderCore;

#[derive(Default)]
pub(crate) struct ReaderPool {
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Default)]
struct PoolState {
    free: Vec<ReaderCore>,
    total: usize,
}

impl ReaderPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take a free core, create one below the bound, or block until a
    /// release makes one available.
    pub(crate) fn acquire(&self, max: usize) -> ReaderCore {
        let max = max.max(1);
        let mut state = self.state.lock();
        loop {
            if let Some(core) = state.free.pop() {
                return core;
            }
            if state.total < max {
                state.total += 1;
                return ReaderCore::new();
            }
            self.available.wait(&mut state);
        }
    }

    /// Return a core and wake one blocked acquirer.
    pub(crate) fn release(&self, core: ReaderCore) {
        let mut state = self.state.lock();
        state.free.push(core);
        self.available.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn total(&self) -> usize {
        self.state.lock().total
    }
}
