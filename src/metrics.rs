// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! Management-surface counters and the periodic drop logger. Counts live in-process as
//! `AtomicU64`s so the read-only accessors on [`crate::hub::MessagingStats`] work without a
//! `metrics` recorder installed; when the `metrics-export` feature is enabled the same counts are
//! additionally pushed through the `metrics` crate's global recorder, the way a production Tokio
//! service instruments itself for Prometheus/StatsD scraping.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::info;
use tokio::sync::RwLock;
use tokio_stream::{wrappers::IntervalStream, StreamExt};

use crate::{shutdown::ShutdownSignal, verb::Verb};

const LOG_TARGET: &str = "cluster_messaging::metrics";

/// Per-droppable-verb monotonic counters plus the previous tick's snapshot, used to compute the
/// "recent" delta the drop logger prints.
#[derive(Default)]
pub struct DroppedMessageCounters {
    counts: RwLock<HashMap<Verb, AtomicU64>>,
    previous_snapshot: RwLock<HashMap<Verb, u64>>,
}

impl DroppedMessageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, verb: Verb) {
        debug_assert!(verb.is_droppable(), "only droppable verbs should be counted here");
        maybe_record_metric(verb);
        let guard = self.counts.read().await;
        if let Some(counter) = guard.get(&verb) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        drop(guard);
        let mut guard = self.counts.write().await;
        guard.entry(verb).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub async fn get(&self, verb: Verb) -> u64 {
        self.counts.read().await.get(&verb).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Computes each droppable verb's delta since the previous call and updates the snapshot.
    async fn tick(&self) -> Vec<(Verb, u64)> {
        let mut previous = self.previous_snapshot.write().await;
        let counts = self.counts.read().await;
        let mut deltas = Vec::new();
        for (verb, counter) in counts.iter() {
            let current = counter.load(Ordering::Relaxed);
            let prior = previous.get(verb).copied().unwrap_or(0);
            if current > prior {
                deltas.push((*verb, current - prior));
            }
            previous.insert(*verb, current);
        }
        deltas
    }
}

/// Total timeouts across all peers, plus a per-peer breakdown. Populated by the hub's timeout
/// reporter (see [`crate::hub`]).
#[derive(Default)]
pub struct TimeoutCounters {
    total: AtomicU64,
    per_peer: RwLock<HashMap<SocketAddr, AtomicU64>>,
}

impl TimeoutCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment(&self, peer: SocketAddr) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let guard = self.per_peer.read().await;
        if let Some(counter) = guard.get(&peer) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        drop(guard);
        let mut guard = self.per_peer.write().await;
        guard.entry(peer).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub async fn per_host(&self) -> HashMap<SocketAddr, u64> {
        self.per_peer.read().await.iter().map(|(addr, c)| (*addr, c.load(Ordering::Relaxed))).collect()
    }

    pub async fn for_peer(&self, peer: SocketAddr) -> u64 {
        self.per_peer.read().await.get(&peer).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

#[cfg(feature = "metrics-export")]
fn maybe_record_metric(verb: Verb) {
    metrics::counter!("cluster_messaging_dropped_total", "verb" => format!("{:?}", verb)).increment(1);
}

#[cfg(not(feature = "metrics-export"))]
fn maybe_record_metric(_verb: Verb) {}

/// A small dedicated background task, in the same shape as the callback sweeper: wakes on a
/// fixed tick, logs the delta of each droppable verb's dropped count since the previous tick, and
/// otherwise gets out of the way.
pub async fn run_drop_logger(counters: std::sync::Arc<DroppedMessageCounters>, interval: Duration, mut shutdown: ShutdownSignal) {
    let mut ticks = IntervalStream::new(tokio::time::interval(interval));
    loop {
        tokio::select! {
            _ = ticks.next() => {},
            _ = shutdown.wait() => return,
        }
        let deltas = counters.tick().await;
        for (verb, delta) in deltas {
            if delta > 0 {
                info!(target: LOG_TARGET, "{:?}: {} dropped in the last {:?}", verb, delta, interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9001)
    }

    #[tokio::test]
    async fn dropped_counters_accumulate_per_verb() {
        let counters = DroppedMessageCounters::new();
        counters.increment(Verb::RequestResponse).await;
        counters.increment(Verb::RequestResponse).await;
        assert_eq!(counters.get(Verb::RequestResponse).await, 2);
        assert_eq!(counters.get(Verb::Echo).await, 0);
    }

    #[tokio::test]
    async fn tick_reports_delta_since_previous_tick() {
        let counters = DroppedMessageCounters::new();
        counters.increment(Verb::RequestResponse).await;
        let first = counters.tick().await;
        assert_eq!(first, vec![(Verb::RequestResponse, 1)]);

        counters.increment(Verb::RequestResponse).await;
        counters.increment(Verb::RequestResponse).await;
        let second = counters.tick().await;
        assert_eq!(second, vec![(Verb::RequestResponse, 2)]);
    }

    #[tokio::test]
    async fn timeout_counters_track_total_and_per_peer() {
        let counters = TimeoutCounters::new();
        counters.increment(addr()).await;
        counters.increment(addr()).await;
        assert_eq!(counters.total(), 2);
        assert_eq!(counters.for_peer(addr()).await, 2);
    }
}
