//! Background sync processor.
//!
//! Drains the mutation queue against the remote store, one item at a time.
//!
//! # State machine
//!
//! `idle -> running -> (paused <-> running) -> idle`. The loop goes idle when
//! nothing is runnable (empty queue, or only failed and held items left) or
//! after [`SyncProcessor::stop`]. While items wait on a backoff window the
//! loop stays running and sleeps until the earliest one is ready.
//!
//! # Suspension points
//!
//! - waiting on a backoff window
//! - waiting on the remote call
//! - waiting while paused or network-gated
//!
//! Control changes (pause, resume, stop) take effect between items; an
//! in-flight remote call is always allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use waypoint_engine::{
    ContentPolicy, Error as EngineError, FailureDisposition, MutationQueue, Operation, QueueItem,
    QueueItemId, QueueSnapshot, RecordKey,
};

use crate::config::Config;
use crate::error::{RemoteError, Result};
use crate::events::{EventBus, Subscription, SyncEvent, UploadState};
use crate::local::RecordStore;
use crate::network::{uploads_permitted, NetworkConditions};
use crate::now_ms;
use crate::persist;
use crate::remote::{BlobStore, CallOptions, RemoteStore};

/// External systems the processor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub network: Arc<dyn NetworkConditions>,
    /// Attachment uploads are skipped when absent
    pub blobs: Option<Arc<dyn BlobStore>>,
}

/// What [`SyncProcessor::discard`] did to a record's items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discarded {
    /// Items removed from the queue
    pub dropped: usize,
    /// An item for the record is on the wire and was kept
    pub in_flight: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Control {
    running: bool,
    paused: bool,
    stopping: bool,
}

enum Next {
    Item(QueueItem),
    WaitUntil(u64),
    Idle,
}

struct Inner {
    config: Config,
    content_policy: ContentPolicy,
    queue: Mutex<MutationQueue>,
    collaborators: Collaborators,
    events: Arc<EventBus>,
    control: watch::Sender<Control>,
    wake: Notify,
}

/// Handle to the processor. Clones share the same queue and loop.
#[derive(Clone)]
pub struct SyncProcessor {
    inner: Arc<Inner>,
}

impl SyncProcessor {
    /// Create a processor with an empty queue.
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let queue = MutationQueue::new(config.retry_policy());
        Self::with_queue(config, collaborators, queue)
    }

    /// Create a processor, reloading the queue persisted by an earlier run.
    pub async fn restore(config: Config, collaborators: Collaborators) -> Result<Self> {
        let mut queue = MutationQueue::new(config.retry_policy());
        if let Some(snapshot) = persist::load_queue(collaborators.store.as_ref()).await? {
            queue.import_state(snapshot)?;
            info!(
                pending = queue.counts().pending,
                failed = queue.counts().failed,
                "Restored mutation queue"
            );
        }
        Ok(Self::with_queue(config, collaborators, queue))
    }

    fn with_queue(config: Config, collaborators: Collaborators, queue: MutationQueue) -> Self {
        let (control, _) = watch::channel(Control::default());
        Self {
            inner: Arc::new(Inner {
                config,
                content_policy: ContentPolicy::default(),
                queue: Mutex::new(queue),
                collaborators,
                events: EventBus::new_shared(),
                control,
                wake: Notify::new(),
            }),
        }
    }

    /// Record a local mutation. Does not start the loop.
    pub async fn enqueue(
        &self,
        table: &str,
        record_id: &str,
        operation: Operation,
        payload: Option<Value>,
    ) -> Result<QueueItemId> {
        let (id, state) = {
            let mut queue = self.inner.queue.lock().await;
            let id = queue.enqueue(table, record_id, operation, payload, now_ms())?;
            debug!(item_id = id, table = %table, record_id = %record_id, operation = %operation, "Mutation enqueued");
            self.inner.persist(&queue).await;
            (id, self.inner.upload_state(&queue))
        };

        self.inner.wake.notify_one();
        self.inner.publish(SyncEvent::StateChanged { state });
        Ok(id)
    }

    /// Start draining. No-op if already running.
    pub fn start(&self) {
        let mut spawn = false;
        self.inner.control.send_modify(|c| {
            c.stopping = false;
            if !c.running {
                c.running = true;
                spawn = true;
            }
        });

        if spawn {
            info!("Sync processor started");
            let inner = self.inner.clone();
            tokio::spawn(inner.drain());
        }
    }

    /// Stop claiming new items. An in-flight call still completes.
    pub async fn pause(&self) {
        let changed = self.inner.control.send_if_modified(|c| {
            let changed = !c.paused;
            c.paused = true;
            changed
        });
        if changed {
            info!("Sync processor paused");
            self.inner.publish_state().await;
        }
    }

    /// Continue from where [`pause`](Self::pause) left off.
    pub async fn resume(&self) {
        let changed = self.inner.control.send_if_modified(|c| {
            let changed = c.paused;
            c.paused = false;
            changed
        });
        if changed {
            info!("Sync processor resumed");
            self.inner.publish_state().await;
        }
    }

    /// Ask the loop to exit after the current item. The queue is kept for a
    /// later [`start`](Self::start).
    pub fn stop(&self) {
        let requested = self.inner.control.send_if_modified(|c| {
            let requested = c.running && !c.stopping;
            if requested {
                c.stopping = true;
            }
            requested
        });
        if requested {
            info!("Sync processor stop requested");
            self.inner.wake.notify_one();
        }
    }

    /// Same as [`stop`](Self::stop).
    pub fn cancel(&self) {
        self.stop();
    }

    /// Wait until the loop is no longer running.
    pub async fn wait_idle(&self) {
        let mut control = self.inner.control.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = control.wait_for(|c| !c.running).await;
    }

    /// Current counters and flags.
    pub async fn state(&self) -> UploadState {
        let queue = self.inner.queue.lock().await;
        self.inner.upload_state(&queue)
    }

    /// Copy of the queue, for inspection.
    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        self.inner.queue.lock().await.export_state()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// The bus processor events are published on.
    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    /// Re-arm one permanently failed item.
    pub async fn retry_failed(&self, id: QueueItemId) -> Result<()> {
        self.mutate_queue(|queue| queue.retry_failed(id)).await?;
        info!(item_id = id, "Failed item re-armed");
        Ok(())
    }

    /// Re-arm every permanently failed item. Returns how many.
    pub async fn retry_all_failed(&self) -> usize {
        let count = self.mutate_queue(|queue| queue.retry_all_failed()).await;
        if count > 0 {
            info!(count, "Failed items re-armed");
        }
        count
    }

    /// Keep a record out of processing.
    pub async fn hold(&self, key: RecordKey) -> bool {
        self.mutate_queue(|queue| queue.hold(key)).await
    }

    /// Release a held record.
    pub async fn unhold(&self, key: &RecordKey) -> bool {
        self.mutate_queue(|queue| queue.unhold(key)).await
    }

    /// Drop queued mutations for a record, except one already on the wire.
    pub async fn discard(&self, key: &RecordKey) -> Discarded {
        self.mutate_queue(|queue| {
            let dropped = queue.discard(key);
            let in_flight = queue
                .items_for(&key.table, &key.record_id)
                .any(|item| item.in_flight);
            Discarded { dropped, in_flight }
        })
        .await
    }

    /// Re-check connectivity now instead of at the next poll.
    pub fn notify_network_changed(&self) {
        self.inner.wake.notify_one();
    }

    async fn mutate_queue<T>(&self, f: impl FnOnce(&mut MutationQueue) -> T) -> T {
        let (result, state) = {
            let mut queue = self.inner.queue.lock().await;
            let result = f(&mut queue);
            self.inner.persist(&queue).await;
            (result, self.inner.upload_state(&queue))
        };
        self.inner.wake.notify_one();
        self.inner.publish(SyncEvent::StateChanged { state });
        result
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        let mut control = self.control.subscribe();
        let mut deferred = false;
        self.publish_state().await;

        loop {
            control.borrow_and_update();

            if self.finish_if_stopping() {
                info!("Sync processor stopped");
                break;
            }

            let paused = self.control.borrow().paused;
            if paused {
                let _ = control.changed().await;
                continue;
            }

            if !uploads_permitted(self.collaborators.network.as_ref(), self.config.allow_cellular) {
                if !deferred {
                    debug!("No permitted network, deferring uploads");
                    deferred = true;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.config.network_poll_interval()) => {}
                    _ = control.changed() => {}
                    _ = self.wake.notified() => {}
                }
                continue;
            }
            deferred = false;

            match self.next().await {
                Next::Item(item) => self.process(item).await,
                Next::WaitUntil(at) => {
                    let delay = Duration::from_millis(at.saturating_sub(now_ms()));
                    debug!(delay_ms = delay.as_millis() as u64, "Waiting for backoff window");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = control.changed() => {}
                        _ = self.wake.notified() => {}
                    }
                }
                Next::Idle => {
                    info!("Sync processor idle");
                    break;
                }
            }
        }

        self.publish_state().await;
    }

    /// Claim the next item, or decide how to wait. Going idle happens under
    /// the queue lock so a concurrent enqueue + start is never lost.
    async fn next(&self) -> Next {
        let mut queue = self.queue.lock().await;
        if let Some(item) = queue.claim_next_ready(now_ms()) {
            return Next::Item(item);
        }
        if let Some(at) = queue.next_retry_at() {
            return Next::WaitUntil(at);
        }
        self.control.send_modify(|c| {
            c.running = false;
            c.stopping = false;
        });
        Next::Idle
    }

    fn finish_if_stopping(&self) -> bool {
        self.control.send_if_modified(|c| {
            if c.stopping {
                c.running = false;
                c.stopping = false;
                true
            } else {
                false
            }
        })
    }

    async fn process(&self, item: QueueItem) {
        if item.noop {
            self.drop_item(&item, "create and delete cancelled out").await;
            return;
        }

        let options = CallOptions {
            timeout: self.config.remote_timeout(),
        };

        match self.push(&item, &options).await {
            Ok(sent) => self.on_success(&item, sent).await,
            Err(RemoteError::NotFound(_)) if item.operation == Operation::Delete => {
                self.drop_item(&item, "record already absent on the remote")
                    .await
            }
            Err(err) if err.is_retryable() => self.on_transient(&item, err).await,
            Err(err) => self.on_rejected(&item, err).await,
        }
    }

    /// Perform the remote call. Returns the payload actually sent.
    async fn push(
        &self,
        item: &QueueItem,
        options: &CallOptions,
    ) -> std::result::Result<Option<Value>, RemoteError> {
        let remote = &self.collaborators.remote;

        if item.operation == Operation::Delete {
            remote
                .delete_remote(&item.table_name, &item.record_id, options)
                .await?;
            return Ok(None);
        }

        let payload = match &item.payload {
            Some(payload) => payload.clone(),
            None => {
                return Err(RemoteError::Rejected(format!(
                    "{} of {} has no payload",
                    item.operation,
                    item.key()
                )))
            }
        };
        let payload = self.upload_attachments(item, payload, options).await?;

        if item.operation == Operation::Create {
            remote
                .create_remote(&item.table_name, &item.record_id, &payload, options)
                .await?;
        } else {
            remote
                .update_remote(&item.table_name, &item.record_id, &payload, options)
                .await?;
        }
        Ok(Some(payload))
    }

    /// Upload `attachments[]` entries that have a `localPath` but no
    /// `remoteKey`, writing the returned key into the payload.
    async fn upload_attachments(
        &self,
        item: &QueueItem,
        mut payload: Value,
        options: &CallOptions,
    ) -> std::result::Result<Value, RemoteError> {
        if let Some(blobs) = &self.collaborators.blobs {
            if let Some(attachments) = payload
                .get_mut("attachments")
                .and_then(Value::as_array_mut)
            {
                for attachment in attachments.iter_mut() {
                    let Some(entry) = attachment.as_object_mut() else {
                        continue;
                    };
                    if entry.contains_key("remoteKey") {
                        continue;
                    }
                    let Some(path) = entry
                        .get("localPath")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                    else {
                        continue;
                    };

                    let key = blobs
                        .upload(&item.table_name, &item.record_id, &path, options)
                        .await?;
                    debug!(item_id = item.id, local_path = %path, remote_key = %key, "Attachment uploaded");
                    entry.insert("remoteKey".to_string(), Value::String(key));
                }
            }
        }
        Ok(payload)
    }

    async fn on_success(&self, item: &QueueItem, sent: Option<Value>) {
        let (state, settled) = {
            let mut queue = self.queue.lock().await;
            queue.mark_complete(item.id);
            let settled = queue
                .items_for(&item.table_name, &item.record_id)
                .next()
                .is_none();
            self.persist(&queue).await;
            (self.upload_state(&queue), settled)
        };

        debug!(
            item_id = item.id,
            table = %item.table_name,
            record_id = %item.record_id,
            operation = %item.operation,
            "Upload succeeded"
        );

        if settled {
            self.mark_local_synced(item, sent).await;
        }

        self.publish(SyncEvent::ItemSucceeded {
            item_id: item.id,
            table: item.table_name.clone(),
            record_id: item.record_id.clone(),
            operation: item.operation,
            state,
        });
    }

    /// Stamp the local record as synced, unless it changed after the item
    /// was enqueued.
    async fn mark_local_synced(&self, item: &QueueItem, sent: Option<Value>) {
        let store = &self.collaborators.store;
        let mut record = match store.get_local(&item.table_name, &item.record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let err = EngineError::RecordNotFound(item.key());
                debug!(item_id = item.id, error = %err, "Nothing to mark synced");
                return;
            }
            Err(err) => {
                warn!(item_id = item.id, error = %err, "Could not load local record");
                return;
            }
        };

        let unchanged = match &item.payload {
            Some(payload) => record.is_active() && record.payload == *payload,
            None => record.deleted,
        };
        if !unchanged {
            debug!(item_id = item.id, "Local record changed since enqueue, not marking synced");
            return;
        }

        if let Some(sent) = sent {
            record.payload = sent;
        }
        record.mark_synced(&self.content_policy);
        if let Err(err) = store.put_local(record).await {
            warn!(item_id = item.id, error = %err, "Could not mark local record synced");
        }
    }

    async fn on_transient(&self, item: &QueueItem, err: RemoteError) {
        let jitter = rand::rng().random::<f64>();
        let (disposition, state) = {
            let mut queue = self.queue.lock().await;
            let disposition = queue.mark_failed(item.id, err.to_string(), now_ms(), jitter);
            self.persist(&queue).await;
            (disposition, self.upload_state(&queue))
        };

        let retry_at = match disposition {
            Ok(FailureDisposition::RetryScheduled { retry_at }) => {
                warn!(
                    item_id = item.id,
                    attempts = item.attempts + 1,
                    retry_at,
                    error = %err,
                    "Upload failed, retry scheduled"
                );
                Some(retry_at)
            }
            Ok(FailureDisposition::PermanentlyFailed) => {
                error!(
                    item_id = item.id,
                    attempts = item.attempts + 1,
                    error = %err,
                    "Upload failed permanently after exhausting retries"
                );
                None
            }
            Err(queue_err) => {
                warn!(item_id = item.id, error = %queue_err, "Failed item no longer queued");
                return;
            }
        };

        self.publish(SyncEvent::ItemFailed {
            item_id: item.id,
            table: item.table_name.clone(),
            record_id: item.record_id.clone(),
            operation: item.operation,
            error: err.to_string(),
            permanent: retry_at.is_none(),
            retry_at,
            state,
        });
    }

    async fn on_rejected(&self, item: &QueueItem, err: RemoteError) {
        let state = {
            let mut queue = self.queue.lock().await;
            if let Err(queue_err) = queue.mark_rejected(item.id, err.to_string(), now_ms()) {
                warn!(item_id = item.id, error = %queue_err, "Rejected item no longer queued");
                return;
            }
            self.persist(&queue).await;
            self.upload_state(&queue)
        };

        error!(
            item_id = item.id,
            table = %item.table_name,
            record_id = %item.record_id,
            error = %err,
            "Upload rejected"
        );

        self.publish(SyncEvent::ItemFailed {
            item_id: item.id,
            table: item.table_name.clone(),
            record_id: item.record_id.clone(),
            operation: item.operation,
            error: err.to_string(),
            permanent: true,
            retry_at: None,
            state,
        });
    }

    async fn drop_item(&self, item: &QueueItem, reason: &str) {
        let state = {
            let mut queue = self.queue.lock().await;
            queue.mark_complete(item.id);
            self.persist(&queue).await;
            self.upload_state(&queue)
        };

        if item.noop {
            debug!(item_id = item.id, reason, "Queue item dropped");
        } else {
            warn!(
                item_id = item.id,
                table = %item.table_name,
                record_id = %item.record_id,
                reason,
                "Queue item dropped"
            );
        }

        self.publish(SyncEvent::ItemDropped {
            item_id: item.id,
            table: item.table_name.clone(),
            record_id: item.record_id.clone(),
            reason: reason.to_string(),
            state,
        });
    }

    async fn persist(&self, queue: &MutationQueue) {
        let store = self.collaborators.store.as_ref();
        if let Err(err) = persist::save_queue(store, &queue.export_state(), now_ms()).await {
            warn!(error = %err, "Could not persist mutation queue");
        }
    }

    fn upload_state(&self, queue: &MutationQueue) -> UploadState {
        let control = *self.control.borrow();
        UploadState::new(queue.counts(), control.running, control.paused)
    }

    async fn publish_state(&self) {
        let state = {
            let queue = self.queue.lock().await;
            self.upload_state(&queue)
        };
        self.publish(SyncEvent::StateChanged { state });
    }

    fn publish(&self, event: SyncEvent) {
        self.events.publish(event);
    }
}
