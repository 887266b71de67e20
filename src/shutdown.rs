// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! A small cooperative shutdown signal: one [`Shutdown`] trigger, any number of cloneable,
//! awaitable [`ShutdownSignal`] handles. Every long-running task in this crate (listener accept
//! loop, per-peer writer, per-connection reader, callback sweeper, drop logger) takes a
//! `ShutdownSignal` and selects on it.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Hands out a new signal. Signals may outlive the `Shutdown` that created them: once
    /// triggered, a signal resolves immediately even if `Shutdown` has since been dropped.
    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger every outstanding signal. Idempotent.
    pub fn trigger(&self) {
        // Only fails if there are no receivers left, which is not an error for us.
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.trigger();
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the shutdown has been triggered. Safe to call (and await) repeatedly, and
    /// safe to use as one arm of `tokio::select!` alongside the task's regular work.
    pub async fn wait(&mut self) {
        if self.is_triggered() {
            return;
        }
        // changed() only errors if the Shutdown side was dropped without ever sending `true`,
        // which cannot happen: Shutdown::drop triggers first.
        let _ = self.rx.changed().await;
    }
}
