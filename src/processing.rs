// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The frame-processing queue seam.
//!
//! OCR itself is an external collaborator; the recorder only hands frame
//! ids across this boundary and, later, receives text back through the
//! indexing API. [`MarkProcessedStub`] is the in-tree processor: it stamps
//! `processedAt` so the rest of the pipeline (backfill, search freshness)
//! can be exercised without a real OCR engine.

use base::clock::Clocks;
use base::Error;
use db::Database;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Consumes batches of frame ids and eventually produces OCR text for
/// them via `LockedDatabase::index_frame_text`.
pub trait FrameProcessor: Send + 'static {
    fn process(&mut self, frame_ids: &[i64]) -> Result<(), Error>;
}

/// The enqueue side handed to capture and recovery. Cheap to clone;
/// enqueueing never blocks the caller.
#[derive(Clone)]
pub struct ProcessingQueue {
    tx: mpsc::UnboundedSender<Vec<i64>>,
}

impl ProcessingQueue {
    pub fn enqueue_frames(&self, frame_ids: &[i64]) {
        if frame_ids.is_empty() {
            return;
        }
        if self.tx.send(frame_ids.to_vec()).is_err() {
            warn!(
                count = frame_ids.len(),
                "frame processor is gone; dropping OCR work"
            );
        }
    }
}

/// Starts a processor loop on its own task. Batches are processed in
/// arrival order; a failing batch is logged and dropped rather than
/// wedging the queue.
pub fn start<P: FrameProcessor>(mut processor: P) -> (ProcessingQueue, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<i64>>();
    let join = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            debug!(count = batch.len(), "processing frames");
            if let Err(e) = processor.process(&batch) {
                warn!(count = batch.len(), err = %e.chain(), "frame processing failed");
            }
        }
    });
    (ProcessingQueue { tx }, join)
}

/// Marks frames processed without doing any OCR.
pub struct MarkProcessedStub<C: Clocks + Clone> {
    pub db: Arc<Database<C>>,
}

impl<C: Clocks + Clone> FrameProcessor for MarkProcessedStub<C> {
    fn process(&mut self, frame_ids: &[i64]) -> Result<(), Error> {
        let now = self.db.clocks().realtime();
        let mut l = self.db.lock();
        for &id in frame_ids {
            l.mark_frame_processed(id, now)?;
        }
        Ok(())
    }
}
