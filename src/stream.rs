// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The capture backend seam.
//!
//! Real backends (ScreenCaptureKit-class, window-list-class) live outside
//! this repository; the recorder sees them only as a [`CaptureBackend`]:
//! something that produces raw BGRA frames on a channel and reports
//! stop/permission through the same channel. [`SyntheticBackend`] is the
//! in-tree implementation used by tests and `run --backend synthetic`.

use base::time::Time;
use base::{bail, Error};
use db::CapturedFrame;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a backend emits on its event channel. The `Stopped` event is sent
/// exactly once, whether the stop was requested or the OS revoked capture.
#[derive(Debug)]
pub enum BackendEvent {
    Frame(CapturedFrame),
    Stopped,
}

/// A source of raw frames for one display.
pub trait CaptureBackend: Send + 'static {
    /// Whether the user has granted screen-capture permission.
    fn has_permission(&self) -> bool;

    /// Starts capturing `display_id` at the given interval, emitting on
    /// `events`. Must be stopped before being started again.
    fn start(
        &mut self,
        display_id: u32,
        interval: std::time::Duration,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), Error>;

    /// Requests a stop; the backend finishes with a `Stopped` event.
    fn stop(&mut self);
}

/// A backend that synthesizes frames: either a scripted list (tests) or an
/// endless run of solid frames stamped with the wall clock.
pub struct SyntheticBackend {
    pub width: u32,
    pub height: u32,
    pub permission: bool,

    /// When set, these frames are emitted in order and then `Stopped`.
    pub scripted: Option<Vec<CapturedFrame>>,

    pub(crate) stop: Option<Arc<tokio::sync::Notify>>,
    pub(crate) task: Option<tokio::task::JoinHandle<()>>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        SyntheticBackend {
            width: 64,
            height: 32,
            permission: true,
            scripted: None,
            stop: None,
            task: None,
        }
    }
}

impl SyntheticBackend {
    pub fn scripted(frames: Vec<CapturedFrame>) -> Self {
        SyntheticBackend {
            scripted: Some(frames),
            ..Default::default()
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn has_permission(&self) -> bool {
        self.permission
    }

    fn start(
        &mut self,
        display_id: u32,
        interval: std::time::Duration,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), Error> {
        if self.task.is_some() {
            bail!(FailedPrecondition, msg("synthetic backend is already started"));
        }
        let stop = Arc::new(tokio::sync::Notify::new());
        self.stop = Some(stop.clone());
        let scripted = self.scripted.take();
        let (width, height) = (self.width, self.height);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut script = scripted.map(std::vec::Vec::into_iter);
            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {}
                }
                let frame = match script.as_mut() {
                    Some(iter) => match iter.next() {
                        Some(f) => f,
                        None => break,
                    },
                    None => {
                        let now = Time::new(jiff::Timestamp::now());
                        let shade = (now.0 / 1_000 % 256) as u8;
                        let mut f =
                            CapturedFrame::solid(now, width, height, [shade, shade, shade, 255]);
                        f.metadata.display_id = display_id;
                        f
                    }
                };
                if events.send(BackendEvent::Frame(frame)).await.is_err() {
                    return; // receiver gone; no point sending Stopped.
                }
            }
            let _ = events.send(BackendEvent::Stopped).await;
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.notify_one();
        }
        self.task = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_frames_then_stopped() {
        let frames: Vec<_> = (0..3)
            .map(|i| CapturedFrame::solid(Time(i * 1_000), 8, 8, [1, 1, 1, 255]))
            .collect();
        let mut backend = SyntheticBackend::scripted(frames);
        let (tx, mut rx) = mpsc::channel(4);
        backend
            .start(1, std::time::Duration::from_millis(1), tx)
            .unwrap();
        let mut got = 0;
        loop {
            match rx.recv().await.unwrap() {
                BackendEvent::Frame(f) => {
                    assert_eq!(f.timestamp, Time(got * 1_000));
                    got += 1;
                }
                BackendEvent::Stopped => break,
            }
        }
        assert_eq!(got, 3);
    }

    #[tokio::test]
    async fn stop_request_ends_stream() {
        let mut backend = SyntheticBackend::default();
        let (tx, mut rx) = mpsc::channel(4);
        backend
            .start(1, std::time::Duration::from_millis(1), tx)
            .unwrap();
        // Let it produce at least one frame, then stop.
        loop {
            if let BackendEvent::Frame(_) = rx.recv().await.unwrap() {
                break;
            }
        }
        backend.stop();
        loop {
            match rx.recv().await {
                Some(BackendEvent::Stopped) | None => break,
                Some(BackendEvent::Frame(_)) => {}
            }
        }
    }
}
