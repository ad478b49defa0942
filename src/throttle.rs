use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chatvault_core::error::VaultError;

type Work<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, VaultError>> + Send>;

/// Single-slot coalescing executor. At most one unit of work runs at a time;
/// a submission that has not been picked up yet is silently replaced by the
/// next one, so bursts of background-triggered recomputation collapse into
/// the latest request instead of piling up.
pub struct ThrottledTask<T> {
    mailbox: Arc<Mailbox<T>>,
    cancel: CancellationToken,
}

struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

struct Slot<T> {
    work: Option<Work<T>>,
    closed: bool,
}

impl<T> Mailbox<T> {
    fn lock_slot(&self) -> MutexGuard<'_, Slot<T>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Send + 'static> ThrottledTask<T> {
    /// Spawns the reader on `handle`. Each successful result is dispatched
    /// to `on_result` as a task on that same handle, the execution context
    /// the caller lives on.
    pub fn new(handle: &Handle, on_result: impl Fn(T) + Send + Sync + 'static) -> Self {
        let mailbox = Arc::new(Mailbox {
            slot: Mutex::new(Slot {
                work: None,
                closed: false,
            }),
            notify: Notify::new(),
        });
        let cancel = CancellationToken::new();
        let on_result: Arc<dyn Fn(T) + Send + Sync> = Arc::new(on_result);

        handle.spawn(reader(
            Arc::clone(&mailbox),
            cancel.clone(),
            handle.clone(),
            on_result,
        ));

        Self { mailbox, cancel }
    }

    /// Submits work described as a function from a cancellation signal to a
    /// future. Replaces any submission the reader has not yet taken;
    /// submissions after `dispose` are ignored.
    pub fn post(
        &self,
        work: impl FnOnce(CancellationToken) -> BoxFuture<'static, Result<T, VaultError>>
            + Send
            + 'static,
    ) {
        let mut slot = self.mailbox.lock_slot();
        if slot.closed {
            return;
        }
        slot.work = Some(Box::new(work));
        drop(slot);
        self.mailbox.notify.notify_one();
    }

    /// Closes submission intake and cancels current and future execution.
    /// Idempotent.
    pub fn dispose(&self) {
        let mut slot = self.mailbox.lock_slot();
        slot.closed = true;
        slot.work = None;
        drop(slot);
        self.cancel.cancel();
        self.mailbox.notify.notify_one();
    }
}

impl ThrottledTask<()> {
    /// The no-value shape: the callback just signals that a round of work
    /// finished.
    pub fn fire_and_forget(handle: &Handle, on_done: impl Fn() + Send + Sync + 'static) -> Self {
        Self::new(handle, move |()| on_done())
    }
}

async fn reader<T: Send + 'static>(
    mailbox: Arc<Mailbox<T>>,
    cancel: CancellationToken,
    handle: Handle,
    on_result: Arc<dyn Fn(T) + Send + Sync>,
) {
    loop {
        let work = {
            let mut slot = mailbox.lock_slot();
            match slot.work.take() {
                Some(work) => Some(work),
                None if slot.closed => break,
                None => None,
            }
        };

        match work {
            Some(work) => {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = work(cancel.child_token()) => result,
                };
                match result {
                    Ok(value) => {
                        let on_result = Arc::clone(&on_result);
                        handle.spawn(async move { on_result(value) });
                    }
                    // A failing unit never terminates the reader.
                    Err(e) => debug!("throttled task failed: {e}"),
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = mailbox.notify.notified() => {}
                }
            }
        }
    }
}
