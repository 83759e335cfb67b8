//! This module contains a bounded pool of sandboxes shared by concurrent
//! workers.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use tracing::debug;

use crate::{
    error::sandbox::{Error, Result},
    program::Program,
    sandbox::{Config, Sandbox},
};

#[derive(Debug, Default)]
struct PoolState {
    idle:    Vec<Sandbox>,
    created: usize,
    closed:  bool,
}

/// A pool of at most `capacity` sandboxes all running the same program.
///
/// Sandboxes are spawned lazily, the first time no idle one is available, and
/// are returned to the pool when the [`PooledSandbox`] handing them out is
/// dropped.
#[derive(Debug)]
pub struct SandboxPool {
    state:     Mutex<PoolState>,
    available: Condvar,
    capacity:  usize,
    config:    Config,
    program:   Arc<Program>,
}

impl SandboxPool {
    /// Constructs an empty pool of at most `capacity` sandboxes.
    #[must_use]
    pub fn new(config: Config, program: Arc<Program>, capacity: usize) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            capacity: capacity.max(1),
            config,
            program,
        }
    }

    /// Takes a sandbox from the pool, spawning one if the pool has room, and
    /// waiting for one to be returned otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the pool is closed or a new sandbox cannot be
    /// spawned.
    pub fn acquire(&self) -> Result<PooledSandbox<'_>> {
        let mut state = self.lock()?;
        loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(sandbox) = state.idle.pop() {
                return Ok(PooledSandbox {
                    pool:    self,
                    sandbox: Some(sandbox),
                });
            }
            if state.created < self.capacity {
                state.created += 1;
                drop(state);
                return match Sandbox::spawn(self.config.clone(), self.program.clone()) {
                    Ok(sandbox) => {
                        debug!(sandbox = %sandbox.id(), "Added sandbox to pool");
                        Ok(PooledSandbox {
                            pool:    self,
                            sandbox: Some(sandbox),
                        })
                    }
                    Err(e) => {
                        self.lock()?.created -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            state = self.available.wait(state).map_err(|_| Error::PoolClosed)?;
        }
    }

    /// Closes the pool, shutting down its idle sandboxes.
    ///
    /// Sandboxes still handed out are shut down when they are returned.
    pub fn close(&self) {
        let idle = match self.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.idle)
            }
            Err(_) => return,
        };
        self.available.notify_all();
        drop(idle);
    }

    /// Gets the number of sandboxes the pool has spawned and not lost.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().map_or(0, |state| state.created)
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| Error::PoolClosed)
    }

    fn release(&self, sandbox: Sandbox) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if state.closed {
            drop(state);
            drop(sandbox);
            return;
        }
        state.idle.push(sandbox);
        drop(state);
        self.available.notify_one();
    }
}

/// A sandbox borrowed from a [`SandboxPool`].
#[derive(Debug)]
pub struct PooledSandbox<'a> {
    pool:    &'a SandboxPool,
    sandbox: Option<Sandbox>,
}

impl Deref for PooledSandbox<'_> {
    type Target = Sandbox;

    fn deref(&self) -> &Self::Target {
        self.sandbox
            .as_ref()
            .unwrap_or_else(|| unreachable!("sandbox taken before drop"))
    }
}

impl DerefMut for PooledSandbox<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.sandbox
            .as_mut()
            .unwrap_or_else(|| unreachable!("sandbox taken before drop"))
    }
}

impl Drop for PooledSandbox<'_> {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            self.pool.release(sandbox);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::{
        error::sandbox::Error,
        program::builder::ProgramBuilder,
        sandbox::{pool::SandboxPool, Config},
    };

    #[test]
    fn a_missing_executable_frees_the_slot() {
        let config = Config::default().with_executable("/nonexistent/stg-sandbox");
        let pool = SandboxPool::new(config, Arc::new(ProgramBuilder::new().finish()), 1);

        assert!(matches!(pool.acquire(), Err(Error::Spawn { .. })));
        assert_eq!(pool.size(), 0);
        assert!(matches!(pool.acquire(), Err(Error::Spawn { .. })));
    }

    #[test]
    fn a_closed_pool_hands_out_nothing() {
        let pool = SandboxPool::new(Config::default(), Arc::new(ProgramBuilder::new().finish()), 2);
        pool.close();

        assert!(matches!(pool.acquire(), Err(Error::PoolClosed)));
    }
}
