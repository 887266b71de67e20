// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! The expiring callback registry: a concurrent `id -> CallbackInfo` map with a per-entry
//! deadline, swept by a background task that reports timeouts exactly once per entry.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, trace};
use tokio::{
    sync::{Notify, RwLock},
    time::Instant,
};

use crate::{
    error::MessagingError,
    message::{CallbackInfo, MessageId},
    shutdown::ShutdownSignal,
};

const LOG_TARGET: &str = "cluster_messaging::callback_registry";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(5);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Entry {
    info: CallbackInfo,
    deadline: Instant,
    ttl: Duration,
}

/// Invoked by the sweeper for every entry evicted on expiry, with the id, the evicted entry, and
/// how long it had been resident. Installed once by the hub at construction time; must not block.
pub type TimeoutReporter = Arc<dyn Fn(MessageId, CallbackInfo, Duration) + Send + Sync>;

pub struct CallbackRegistry {
    inner: RwLock<HashMap<MessageId, Entry>>,
    accepting: AtomicBool,
    reporter: TimeoutReporter,
    drained: Notify,
}

impl CallbackRegistry {
    pub fn new(reporter: TimeoutReporter) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            reporter,
            drained: Notify::new(),
        })
    }

    /// Inserts a new pending callback. Fails loudly if `id` is already live: duplicate ids
    /// against a live entry are a programming error, never a runtime condition to route around.
    pub async fn put(&self, id: MessageId, info: CallbackInfo, ttl: Duration) -> Result<(), MessagingError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(MessagingError::ShuttingDown);
        }
        let mut guard = self.inner.write().await;
        if guard.contains_key(&id) {
            return Err(MessagingError::DuplicateCallbackId(id));
        }
        guard.insert(
            id,
            Entry {
                info,
                deadline: Instant::now() + ttl,
                ttl,
            },
        );
        Ok(())
    }

    /// `true` if `id` is currently live, without removing it.
    pub async fn contains(&self, id: MessageId) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    /// Elapsed time since `id` was inserted, for latency accounting. `None` if not live.
    pub async fn get_age(&self, id: MessageId) -> Option<Duration> {
        let guard = self.inner.read().await;
        guard
            .get(&id)
            .map(|e| e.ttl.saturating_sub(e.deadline.saturating_duration_since(Instant::now())))
    }

    /// Takes the entry, if any. The caller (reply-arrival path) is then solely responsible for
    /// delivering it; the sweeper will never see it again.
    pub async fn remove(&self, id: MessageId) -> Option<CallbackInfo> {
        let removed = self.inner.write().await.remove(&id).map(|e| e.info);
        if removed.is_some() {
            self.notify_if_drained().await;
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops all entries without invoking the timeout reporter. A test-restart hook only.
    pub async fn reset(&self) {
        self.inner.write().await.clear();
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Stops accepting new callbacks and waits until every resident entry has been removed or
    /// has expired through the normal sweep path.
    pub async fn shutdown_blocking(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        loop {
            // Constructed before the emptiness check so a `notify_waiters()` from a `remove`/
            // `sweep` racing with that check is still observed -- otherwise the drain could slip
            // between the check and the await and this would hang forever.
            let notified = self.drained.notified();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }

    async fn notify_if_drained(&self) {
        if self.is_empty().await {
            self.drained.notify_waiters();
        }
    }

    /// Runs the background sweeper until `shutdown` resolves. Evicts every entry past its
    /// deadline in a single pass per tick, invoking the timeout reporter for each.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        loop {
            let interval = self.next_sweep_interval().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.wait() => {
                    debug!(target: LOG_TARGET, "callback registry sweeper shutting down");
                    return;
                }
            }
            self.sweep().await;
        }
    }

    async fn next_sweep_interval(&self) -> Duration {
        let guard = self.inner.read().await;
        let smallest_ttl = guard.values().map(|e| e.ttl).min();
        match smallest_ttl {
            Some(ttl) => (ttl / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL),
            None => MAX_SWEEP_INTERVAL,
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(MessageId, Entry)> = {
            let mut guard = self.inner.write().await;
            let expired_ids: Vec<MessageId> = guard
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            expired_ids.into_iter().filter_map(|id| guard.remove(&id).map(|e| (id, e))).collect()
        };
        if expired.is_empty() {
            return;
        }
        for (id, entry) in expired {
            let elapsed = entry.ttl;
            trace!(target: LOG_TARGET, "callback {} expired after {:?}", id, elapsed);
            (self.reporter)(id, entry.info, elapsed);
        }
        self.notify_if_drained().await;
    }
}
