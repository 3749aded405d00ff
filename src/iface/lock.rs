//! Per-interface locking.
//!
//! Each host interface has one [`IfaceLock`], handed out by a registry task
//! that owns the name-to-lock map. Callers never touch the map directly;
//! they send on the registry's mailboxes.
//!
//! [`IfaceLock`] is not a standard rw-lock: acquiring the read side never
//! blocks behind a *waiting* writer. Readers register in a counter before
//! touching the underlying lock, and a writer that has acquired the write
//! half re-confirms the counter is drained within 1 ms; if a reader slipped
//! in, the writer releases and starts over. Long-running selection loops
//! (readers) therefore always make progress, while deletion (the only
//! writer) gets in opportunistically and is retried by its callers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify, RwLock, RwLockWriteGuard};

/// How long a writer waits for its drain re-confirmation before backing off.
const WRITE_CONFIRM: Duration = Duration::from_millis(1);

#[derive(Default)]
pub struct IfaceLock {
    readers: AtomicUsize,
    drained: Notify,
    inner: RwLock<()>,
}

pub struct IfaceReadGuard<'a> {
    lock: &'a IfaceLock,
    _inner: tokio::sync::RwLockReadGuard<'a, ()>,
}

impl Drop for IfaceReadGuard<'_> {
    fn drop(&mut self) {
        if self.lock.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lock.drained.notify_waiters();
        }
    }
}

impl IfaceLock {
    /// Acquire the read side. Registers in the reader counter first, so a
    /// writer stuck in its confirmation window yields to us.
    pub async fn read(&self) -> IfaceReadGuard<'_> {
        self.readers.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.read().await;
        IfaceReadGuard {
            lock: self,
            _inner: inner,
        }
    }

    async fn drain(&self) {
        loop {
            let notified = self.drained.notified();
            if self.readers.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Acquire the write side: wait for in-flight readers, take the lock,
    /// and re-confirm no reader registered meanwhile. On confirmation
    /// timeout the lock is released and the whole sequence retried.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        loop {
            self.drain().await;
            let guard = self.inner.write().await;
            match tokio::time::timeout(WRITE_CONFIRM, self.drain()).await {
                Ok(()) => return guard,
                Err(_) => drop(guard),
            }
        }
    }
}

struct GetReq {
    name: String,
    resp: oneshot::Sender<Arc<IfaceLock>>,
}

/// Handle to the registry task. Cheap to clone.
#[derive(Clone)]
pub struct LockRegistry {
    get_tx: mpsc::Sender<GetReq>,
    del_tx: mpsc::Sender<String>,
}

impl LockRegistry {
    /// Spawn the owning task. It lives until every handle is dropped.
    pub fn spawn() -> Self {
        let (get_tx, mut get_rx) = mpsc::channel::<GetReq>(16);
        let (del_tx, mut del_rx) = mpsc::channel::<String>(16);

        tokio::spawn(async move {
            let mut locks: std::collections::HashMap<String, Arc<IfaceLock>> =
                std::collections::HashMap::new();
            loop {
                tokio::select! {
                    req = get_rx.recv() => {
                        let Some(req) = req else { break };
                        let lock = locks
                            .entry(req.name)
                            .or_insert_with(|| Arc::new(IfaceLock::default()))
                            .clone();
                        let _ = req.resp.send(lock);
                    }
                    name = del_rx.recv() => {
                        let Some(name) = name else { break };
                        locks.remove(&name);
                    }
                }
            }
        });

        Self { get_tx, del_tx }
    }

    /// Lock for `name`, created lazily on first request.
    pub async fn get(&self, name: &str) -> Arc<IfaceLock> {
        let (resp, rx) = oneshot::channel();
        // The registry task outlives every handle; a failed send can only
        // happen during process teardown, where a fresh lock is as good.
        let req = GetReq {
            name: name.to_string(),
            resp,
        };
        if self.get_tx.send(req).await.is_err() {
            return Arc::new(IfaceLock::default());
        }
        match rx.await {
            Ok(lock) => lock,
            Err(_) => Arc::new(IfaceLock::default()),
        }
    }

    /// Drop the lock for a destroyed interface.
    pub async fn delete(&self, name: &str) {
        let _ = self.del_tx.send(name.to_string()).await;
    }
}
