use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle};
use tracing::warn;

use chatvault_core::error::VaultError;

const AVAILABILITY_WAIT: Duration = Duration::from_millis(100);

/// Fixed set of pre-opened connections to one backing file. One lease means
/// exclusive use of one connection; leases return themselves on drop.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    free: Vec<Connection>,
    interrupts: Vec<InterruptHandle>,
    disposed: bool,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ConnectionPool {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self, VaultError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut free = Vec::with_capacity(pool_size);
        let mut interrupts = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = Connection::open(path)?;
            // WAL keeps readers on other connections live during a writer's
            // transaction.
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            interrupts.push(conn.get_interrupt_handle());
            free.push(conn);
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    free,
                    interrupts,
                    disposed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Blocks until a connection is free. The wait is bounded; every round
    /// spent with the pool fully checked out logs a starvation warning.
    pub fn take(&self) -> Result<Lease, VaultError> {
        let mut state = self.shared.lock_state();
        loop {
            if state.disposed {
                return Err(VaultError::Disposed("connection pool"));
            }
            if let Some(conn) = state.free.pop() {
                return Ok(Lease {
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                });
            }

            let (guard, timeout) = match self
                .shared
                .available
                .wait_timeout(state, AVAILABILITY_WAIT)
            {
                Ok(pair) => pair,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
            if timeout.timed_out() && state.free.is_empty() && !state.disposed {
                warn!(
                    "thread {:?} is starving for connections",
                    std::thread::current().id()
                );
            }
        }
    }

    /// Closes every free connection immediately and interrupts any statement
    /// running on a still-leased one; those leases discard their connection
    /// when they drop. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.shared.lock_state();
        if state.disposed {
            return;
        }
        state.disposed = true;
        for handle in &state.interrupts {
            handle.interrupt();
        }
        state.interrupts.clear();
        state.free.clear();
        drop(state);
        self.shared.available.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock_state().disposed
    }
}

/// Exclusively held connection handle, returned to the pool on drop.
pub struct Lease {
    conn: Option<Connection>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("lease already released")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("lease already released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.shared.lock_state();
            if state.disposed {
                drop(conn);
            } else {
                state.free.push(conn);
                drop(state);
                self.shared.available.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::thread;

    fn test_pool(pool_size: usize) -> (ConnectionPool, PathBuf) {
        let dir = std::env::temp_dir().join(format!("chatvault_pool_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let pool = ConnectionPool::open(&dir.join("pool.db"), pool_size).unwrap();
        (pool, dir)
    }

    fn cleanup(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_take_and_return_cycle() {
        let (pool, dir) = test_pool(2);
        let first = pool.take().unwrap();
        let second = pool.take().unwrap();
        drop(first);
        drop(second);
        let again = pool.take().unwrap();
        again
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        drop(again);
        cleanup(&dir);
    }

    #[test]
    fn test_take_blocks_until_a_lease_returns() {
        let (pool, dir) = test_pool(1);
        let held = pool.take().unwrap();

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || {
            let lease = waiter_pool.take().unwrap();
            drop(lease);
        });

        thread::sleep(Duration::from_millis(250));
        assert!(!waiter.is_finished());

        drop(held);
        waiter.join().unwrap();
        cleanup(&dir);
    }

    #[test]
    fn test_take_on_disposed_pool_fails() {
        let (pool, dir) = test_pool(1);
        pool.dispose();
        let err = pool.take().unwrap_err();
        assert!(matches!(err, VaultError::Disposed(_)));
        cleanup(&dir);
    }

    #[test]
    fn test_dispose_wakes_blocked_waiters() {
        let (pool, dir) = test_pool(1);
        let held = pool.take().unwrap();

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.take());

        thread::sleep(Duration::from_millis(150));
        pool.dispose();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(VaultError::Disposed(_))));

        drop(held);
        cleanup(&dir);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (pool, dir) = test_pool(1);
        pool.dispose();
        pool.dispose();
        assert!(pool.is_disposed());
        cleanup(&dir);
    }

    #[test]
    fn test_lease_returned_after_dispose_is_discarded() {
        let (pool, dir) = test_pool(1);
        let lease = pool.take().unwrap();
        pool.dispose();
        drop(lease);
        assert!(matches!(pool.take(), Err(VaultError::Disposed(_))));
        cleanup(&dir);
    }
}
