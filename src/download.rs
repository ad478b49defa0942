use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chatvault_core::error::VaultError;
use chatvault_core::types::{Download, DownloadItem};
use chatvault_storage::db::Database;

use crate::config::DownloadConfig;

const STATE_RUNNING: u8 = 0;
const STATE_STOPPING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Background worker that drains a cancelable queue of attachment urls,
/// fetches each one, and records the outcome through the storage engine.
/// One dedicated thread per instance, started at construction and stopped by
/// an explicit `stop` call.
pub struct DownloadWorker {
    queue: mpsc::UnboundedSender<DownloadItem>,
    cancel: CancellationToken,
    pending: Arc<PendingCounter>,
    state: Arc<AtomicU8>,
}

struct PendingCounter {
    count: AtomicUsize,
    publish: watch::Sender<usize>,
}

impl PendingCounter {
    fn new() -> Self {
        let (publish, _) = watch::channel(0);
        Self {
            count: AtomicUsize::new(0),
            publish,
        }
    }

    fn add_one(&self) {
        let value = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish.send_replace(value);
    }

    fn sub_one(&self) -> usize {
        let value = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.publish.send_replace(value);
        value
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.publish.subscribe()
    }
}

impl DownloadWorker {
    pub fn new(db: Arc<Database>, config: &DownloadConfig) -> Result<Self, VaultError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let (queue, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = Arc::new(PendingCounter::new());
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));

        let worker_cancel = cancel.clone();
        let worker_pending = Arc::clone(&pending);
        let worker_state = Arc::clone(&state);
        thread::Builder::new()
            .name("chatvault download".into())
            .spawn(move || {
                worker_loop(db, client, rx, worker_cancel, worker_pending, worker_state)
            })?;

        Ok(Self {
            queue,
            cancel,
            pending,
            state,
        })
    }

    /// Appends items to the queue and publishes the new pending count.
    /// Enqueueing after the worker has been torn down is logged, not fatal.
    pub fn enqueue(&self, items: Vec<DownloadItem>) {
        if self.cancel.is_cancelled() {
            warn!("attempted to enqueue download items after the worker has been stopped");
            return;
        }

        for item in items {
            // Count first so the worker can never observe an item it has
            // taken before the count covers it.
            self.pending.add_one();
            if self.queue.send(item).is_err() {
                self.pending.sub_one();
                warn!("attempted to enqueue download items after the worker queue was torn down");
                break;
            }
        }
    }

    /// Observable queue depth.
    pub fn pending_count(&self) -> watch::Receiver<usize> {
        self.pending.subscribe()
    }

    /// Signals cancellation; the worker unwinds promptly, leaving unconsumed
    /// queue items undrained. Repeated calls are logged, not fatal.
    pub fn stop(&self) {
        match self.state.compare_exchange(
            STATE_RUNNING,
            STATE_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => self.cancel.cancel(),
            Err(_) => {
                warn!("attempted to stop download worker after it has already been stopped");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }
}

fn worker_loop(
    db: Arc<Database>,
    client: Client,
    mut rx: mpsc::UnboundedReceiver<DownloadItem>,
    cancel: CancellationToken,
    pending: Arc<PendingCounter>,
    state: Arc<AtomicU8>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start download worker runtime: {e}");
            state.store(STATE_STOPPED, Ordering::SeqCst);
            return;
        }
    };

    runtime.block_on(async {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let remaining = pending.sub_one();
            info!("downloading {} ({remaining} item(s) in queue)", item.url);

            // Biased so a fetch that finished before cancellation fired is
            // still recorded.
            let download = tokio::select! {
                biased;
                download = fetch(&client, &item.url) => download,
                _ = cancel.cancelled() => break,
            };

            if let Err(e) = db.add_download(&download) {
                error!("failed to record download of {}: {e}", item.url);
            }
        }
    });

    state.store(STATE_STOPPED, Ordering::SeqCst);
}

/// Always produces a Download to record: success carries the bytes, any
/// failure carries the HTTP status when one is known and the generic-error
/// sentinel otherwise.
async fn fetch(client: &Client, url: &str) -> Download {
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status();
            if status.is_success() {
                match response.bytes().await {
                    Ok(bytes) => Download::success(url.to_string(), bytes.to_vec()),
                    Err(e) => {
                        error!("failed to read body of {url}: {e}");
                        Download::failure(url.to_string(), error_status(&e))
                    }
                }
            } else {
                error!("request for {url} failed with status {status}");
                Download::failure(url.to_string(), i64::from(status.as_u16()))
            }
        }
        Err(e) => {
            error!("request for {url} failed: {e}");
            Download::failure(url.to_string(), error_status(&e))
        }
    }
}

fn error_status(e: &reqwest::Error) -> i64 {
    e.status()
        .map_or(Download::STATUS_GENERIC_ERROR, |status| {
            i64::from(status.as_u16())
        })
}
