use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// Strict FIFO mutual exclusion per tenant, implemented as a
/// future-chained tail pointer rather than a
/// `tokio::sync::Mutex` guard: a `Mutex` can only be released by the task
/// that acquired it, which makes a true force-release of a hung holder
/// (the timeout grace phase's max-lock-hold) impossible. Here the holder decides for itself
/// when to signal release, independent of whether its underlying work has
/// actually finished.
#[derive(Default)]
pub struct TenantLock {
    tail: AsyncMutex<Option<oneshot::Receiver<()>>>,
}

/// Held by whoever currently owns the tenant's serialization slot. Releasing
/// it (explicitly or via `Drop`) unblocks the next `acquire` in FIFO order.
pub struct TenantLockGuard {
    release: Option<oneshot::Sender<()>>,
}

impl TenantLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers behind whichever receiver is currently at the tail, then
    /// waits for it. A dropped prior guard (task panicked) still unblocks us,
    /// since `Drop` sends the release signal too.
    pub async fn acquire(&self) -> TenantLockGuard {
        let (tx, rx) = oneshot::channel();
        let previous = {
            let mut tail = self.tail.lock().await;
            tail.replace(rx)
        };

        if let Some(previous) = previous {
            // Resolves as soon as the previous holder releases (explicitly
            // or via Drop); a RecvError (sender dropped without sending)
            // means the same thing here, so it's intentionally ignored.
            let _ = previous.await;
        }

        TenantLockGuard { release: Some(tx) }
    }
}

impl TenantLockGuard {
    /// Signals release early, ahead of the underlying work actually
    /// finishing (force-release at `runTimeoutMaxLockHoldMs`).
    pub fn release(mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TenantLockGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}
