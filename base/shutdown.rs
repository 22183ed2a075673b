// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The receiver can be cloned, checked, and awaited in async code, or
//! blocked on from synchronous code without going through the runtime.
//! Dropping the single [`Sender`] requests shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    down: AtomicBool,
    notify: tokio::sync::Notify,

    /// For synchronous waiters; the bool mirrors `down`.
    mutex: Mutex<bool>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Sequencing: set the flag, then wake both async and sync waiters.
        // The opposite order could leave a waiter asleep forever.
        self.0.down.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
        *self.0.mutex.lock().unwrap() = true;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.down.load(Ordering::SeqCst) {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Completes when shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            // Create the `Notified` future before re-checking the flag so a
            // notify between the check and the await isn't lost.
            let notified = self.0.notify.notified();
            if self.0.down.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until shutdown or the timeout elapses.
    /// Returns `Ok(())` on timeout, `Err(ShutdownError)` on shutdown, so it
    /// composes with `?` in retry loops.
    pub fn wait_for(&self, timeout: std::time::Duration) -> Result<(), ShutdownError> {
        let l = self.0.mutex.lock().unwrap();
        let (_guard, result) = self
            .0
            .condvar
            .wait_timeout_while(l, timeout, |down| !*down)
            .unwrap();
        if result.timed_out() {
            Ok(())
        } else {
            Err(ShutdownError)
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        down: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
        mutex: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}
