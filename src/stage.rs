// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! The stage dispatcher: a fixed set of named worker pools, one per [`Stage`]. Verbs map
//! statically to a stage so that, e.g., a backlog of client requests on `REQUEST_RESPONSE` can
//! never starve `GOSSIP`. Each stage is a single queue plus a bounded number of concurrently
//! running tasks -- a `tokio::sync::Semaphore` stands in for a literal worker-thread pool, which
//! is the idiomatic async equivalent: a panic in one submitted task only unwinds that task's
//! spawned future, never the stage's dispatch loop or its sibling tasks.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use log::error;
use tokio::sync::{mpsc, Semaphore};

use crate::{shutdown::ShutdownSignal, verb::Stage};

const LOG_TARGET: &str = "cluster_messaging::stage";

/// Default worker concurrency for a stage when the caller does not request a specific width.
const DEFAULT_STAGE_WORKERS: usize = 4;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct StageHandle {
    tx: mpsc::UnboundedSender<BoxedTask>,
}

/// Owns one queue + worker-concurrency pool per [`Stage`]. Constructed once at startup; the
/// verb-to-stage mapping that decides *which* handle a task lands on lives on [`crate::verb::Verb`]
/// itself, not here -- the dispatcher only knows about stages, never verbs.
pub struct StageDispatcher {
    stages: HashMap<Stage, StageHandle>,
}

impl StageDispatcher {
    pub fn new(shutdown: ShutdownSignal) -> Arc<Self> {
        Self::with_worker_counts(HashMap::new(), shutdown)
    }

    pub fn with_worker_counts(mut worker_counts: HashMap<Stage, usize>, shutdown: ShutdownSignal) -> Arc<Self> {
        let mut stages = HashMap::new();
        for stage in Stage::ALL {
            let workers = worker_counts.remove(&stage).unwrap_or(DEFAULT_STAGE_WORKERS);
            let (tx, rx) = mpsc::unbounded_channel::<BoxedTask>();
            tokio::spawn(run_stage_loop(stage, rx, workers, shutdown.clone()));
            stages.insert(stage, StageHandle { tx });
        }
        Arc::new(Self { stages })
    }

    /// Submits a task to the given stage's queue. Never inspects or awaits the task itself; that
    /// is purely the stage loop's job.
    pub fn submit(&self, stage: Stage, task: BoxedTask) {
        if let Some(handle) = self.stages.get(&stage) {
            if handle.tx.send(task).is_err() {
                error!(target: LOG_TARGET, "stage {:?} loop has already shut down, dropping task", stage);
            }
        }
    }
}

async fn run_stage_loop(
    stage: Stage,
    mut rx: mpsc::UnboundedReceiver<BoxedTask>,
    workers: usize,
    mut shutdown: ShutdownSignal,
) {
    let semaphore = Arc::new(Semaphore::new(workers));
    loop {
        let task = tokio::select! {
            task = rx.recv() => task,
            _ = shutdown.wait() => None,
        };
        let Some(task) = task else {
            break;
        };
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::shutdown::Shutdown;

    #[tokio::test]
    async fn submitted_tasks_all_run() {
        let shutdown = Shutdown::new();
        let dispatcher = StageDispatcher::new(shutdown.to_signal());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = counter.clone();
            dispatcher.submit(
                Stage::Gossip,
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn stages_are_independent() {
        let shutdown = Shutdown::new();
        let dispatcher = StageDispatcher::new(shutdown.to_signal());
        let gossip_ran = Arc::new(AtomicUsize::new(0));
        let gossip_ran2 = gossip_ran.clone();

        dispatcher.submit(
            Stage::Gossip,
            Box::pin(async move {
                gossip_ran2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gossip_ran.load(Ordering::SeqCst), 1);
    }
}
