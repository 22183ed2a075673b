// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The capture manager: drives a backend, enriches frames with app/window
//! metadata, deduplicates, and emits a single frame stream.
//!
//! Ownership is deliberately one-way: the manager owns the backend; the
//! display-switch monitor holds only a registry token for the manager
//! (relation + lookup), so display hotplug can never create an ownership
//! cycle. Downstream consumers see an unbroken deduped stream across
//! display switches.

use crate::similarity;
use crate::stream::{BackendEvent, CaptureBackend};
use base::time::Time;
use base::{bail, err, Error, FastHashMap};
use db::{CapturedFrame, FrameMetadata};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Minimum gap between two window-change-forced captures.
const WINDOW_CHANGE_DEBOUNCE_MS: i64 = 200;

/// Provides the focused app/window/URL context for a display at capture
/// time. Real implementations (accessibility APIs, browser helpers) are
/// external collaborators.
pub trait MetadataSource: Send + Sync + 'static {
    fn current(&self, display_id: u32) -> FrameMetadata;

    /// Whether the source can actually resolve window metadata; `false`
    /// surfaces an accessibility-permission warning once at startup.
    fn accessibility_ok(&self) -> bool {
        true
    }
}

/// A fixed metadata value; the default source when no helper is wired in.
#[derive(Default)]
pub struct StaticMetadata(pub FrameMetadata);

impl MetadataSource for StaticMetadata {
    fn current(&self, display_id: u32) -> FrameMetadata {
        FrameMetadata {
            display_id,
            ..self.0.clone()
        }
    }
}

/// Events published to the UI-facing consumer; frames travel on their own
/// channel.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureEvent {
    Stopped,
    AccessibilityPermissionWarning,
    DisplaySwitched(u32),
}

/// Commands a running capture accepts.
#[derive(Debug)]
pub enum CaptureCommand {
    SwitchDisplay(u32),
    Stop,
}

/// Registry mapping tokens to running captures, so collaborators hold an
/// id rather than an owning reference.
#[derive(Default)]
pub struct CaptureRegistry {
    next: AtomicU64,
    by_token: Mutex<FastHashMap<u64, mpsc::Sender<CaptureCommand>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureToken(u64);

impl CaptureRegistry {
    pub fn register(&self, commands: mpsc::Sender<CaptureCommand>) -> CaptureToken {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_token.lock().unwrap().insert(token, commands);
        CaptureToken(token)
    }

    pub fn unregister(&self, token: CaptureToken) {
        self.by_token.lock().unwrap().remove(&token.0);
    }

    fn lookup(&self, token: CaptureToken) -> Option<mpsc::Sender<CaptureCommand>> {
        self.by_token.lock().unwrap().get(&token.0).cloned()
    }
}

/// The display-switch monitor's view of a capture: a registry and a token,
/// never ownership.
pub struct DisplaySwitchMonitor {
    registry: Arc<CaptureRegistry>,
    token: CaptureToken,
}

impl DisplaySwitchMonitor {
    pub fn new(registry: Arc<CaptureRegistry>, token: CaptureToken) -> Self {
        DisplaySwitchMonitor { registry, token }
    }

    /// Routes a display switch to the capture, if it is still running.
    pub fn display_switched(&self, display_id: u32) {
        if let Some(tx) = self.registry.lookup(self.token) {
            if tx.try_send(CaptureCommand::SwitchDisplay(display_id)).is_err() {
                warn!(display_id, "capture busy; display switch dropped");
            }
        }
    }
}

/// Decides when a focus change warrants an immediate capture: not when the
/// new context is a near-duplicate of the old (same bundle, one title
/// containing the other), and not within the debounce window.
#[derive(Default)]
struct WindowChangePolicy {
    last_context: Option<(String, String)>,
    last_forced: Option<Time>,
}

impl WindowChangePolicy {
    fn near_duplicate(old: &(String, String), bundle: &str, window: &str) -> bool {
        old.0 == bundle && (old.1.contains(window) || window.contains(&old.1))
    }

    /// Returns true if this frame should bypass deduplication.
    fn observe(&mut self, metadata: &FrameMetadata, now: Time) -> bool {
        let bundle = FrameMetadata::str_or_empty(&metadata.app_bundle_id);
        let window = FrameMetadata::str_or_empty(&metadata.window_name);
        match &self.last_context {
            Some(old) if (old.0.as_str(), old.1.as_str()) == (bundle, window) => return false,
            Some(old) if Self::near_duplicate(old, bundle, window) => {
                // Title churn within one app (e.g. an editor appending "*"),
                // not a real focus change.
                return false;
            }
            _ => {}
        }
        self.last_context = Some((bundle.to_owned(), window.to_owned()));
        if let Some(last) = self.last_forced {
            if (now - last).0 < WINDOW_CHANGE_DEBOUNCE_MS {
                return false;
            }
        }
        self.last_forced = Some(now);
        true
    }
}

#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub display_id: u32,
    pub interval: std::time::Duration,

    /// Keep a frame iff its similarity to the last kept frame is at or
    /// below this. Higher filters more.
    pub dedup_threshold: f64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            display_id: 0,
            interval: std::time::Duration::from_secs(2),
            dedup_threshold: 0.98,
        }
    }
}

/// A running capture: the deduped frame stream, the event stream, and the
/// registry token for collaborators.
#[derive(Debug)]
pub struct RunningCapture {
    pub frames: mpsc::Receiver<CapturedFrame>,
    pub events: mpsc::Receiver<CaptureEvent>,
    pub token: CaptureToken,
    commands: mpsc::Sender<CaptureCommand>,
    worker: tokio::task::JoinHandle<()>,
}

impl RunningCapture {
    /// Requests a stop; in-flight frames drain through the channel, then a
    /// `Stopped` event arrives.
    pub async fn stop(&self) {
        let _ = self.commands.send(CaptureCommand::Stop).await;
    }

    /// A clone of the command channel, for callers that need to issue
    /// commands while the frame/event receivers are borrowed elsewhere.
    pub fn commands(&self) -> mpsc::Sender<CaptureCommand> {
        self.commands.clone()
    }

    pub async fn join(self) {
        let _ = self.worker.await;
    }
}

/// Checks permission and starts the capture pipeline.
///
/// Two bounded channels separate the backend from the consumer: the
/// backend feeds raw frames; a worker stamps metadata, applies the
/// window-change policy and the dedup predicate, and forwards survivors.
/// The worker never touches the database; it enqueues and moves on.
pub fn start_capture<B, M>(
    mut backend: B,
    metadata: Arc<M>,
    registry: &Arc<CaptureRegistry>,
    opts: CaptureOptions,
) -> Result<RunningCapture, Error>
where
    B: CaptureBackend,
    M: MetadataSource,
{
    if !backend.has_permission() {
        bail!(PermissionDenied, msg("screen capture permission not granted"));
    }
    let (raw_tx, mut raw_rx) = mpsc::channel::<BackendEvent>(8);
    let (frame_tx, frame_rx) = mpsc::channel::<CapturedFrame>(8);
    let (event_tx, event_rx) = mpsc::channel::<CaptureEvent>(8);
    let (command_tx, mut command_rx) = mpsc::channel::<CaptureCommand>(4);
    let token = registry.register(command_tx.clone());

    if !metadata.accessibility_ok() {
        let _ = event_tx.try_send(CaptureEvent::AccessibilityPermissionWarning);
    }

    let mut display_id = opts.display_id;
    backend
        .start(display_id, opts.interval, raw_tx.clone())
        .map_err(|e| err!(e, msg("unable to start capture backend")))?;
    info!(display_id, interval = ?opts.interval, "capture started");

    let registry_for_worker = registry.clone();
    let worker = tokio::spawn(async move {
        let mut last_kept: Option<CapturedFrame> = None;
        let mut policy = WindowChangePolicy::default();
        let mut stopping = false;
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(CaptureCommand::SwitchDisplay(new_display)) => {
                        if new_display == display_id {
                            continue;
                        }
                        info!(from = display_id, to = new_display, "display switched");
                        let _ = event_tx.send(CaptureEvent::DisplaySwitched(new_display)).await;
                        backend.stop();
                        display_id = new_display;
                        // New display, new content: the next frame always
                        // survives dedup.
                        last_kept = None;
                        if let Err(e) = backend.start(display_id, opts.interval, raw_tx.clone()) {
                            warn!(err = %e.chain(), "backend restart failed; capture ends");
                            let _ = event_tx.send(CaptureEvent::Stopped).await;
                            break;
                        }
                    }
                    Some(CaptureCommand::Stop) => {
                        stopping = true;
                        backend.stop();
                    }
                    None => {
                        stopping = true;
                        backend.stop();
                    }
                },
                ev = raw_rx.recv() => match ev {
                    Some(BackendEvent::Frame(mut frame)) => {
                        frame.metadata = metadata.current(display_id);
                        let force = policy.observe(&frame.metadata, frame.timestamp);
                        let keep = force
                            || similarity::should_keep(
                                &frame,
                                last_kept.as_ref(),
                                opts.dedup_threshold,
                            );
                        if !keep {
                            continue;
                        }
                        if force {
                            debug!(
                                window = FrameMetadata::str_or_empty(&frame.metadata.window_name),
                                "window change; immediate capture"
                            );
                        }
                        last_kept = Some(frame.clone());
                        if frame_tx.send(frame).await.is_err() {
                            // Consumer gone; stop cleanly.
                            backend.stop();
                            stopping = true;
                        }
                    }
                    Some(BackendEvent::Stopped) => {
                        if !stopping {
                            info!("capture stopped by backend (revoked or ended)");
                        }
                        let _ = event_tx.send(CaptureEvent::Stopped).await;
                        break;
                    }
                    None => {
                        let _ = event_tx.send(CaptureEvent::Stopped).await;
                        break;
                    }
                },
            }
        }
        registry_for_worker.unregister(token);
    });

    Ok(RunningCapture {
        frames: frame_rx,
        events: event_rx,
        token,
        commands: command_tx,
        worker,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SyntheticBackend;
    use base::ErrorKind;

    fn meta(bundle: &str, window: &str) -> FrameMetadata {
        FrameMetadata {
            app_bundle_id: Some(bundle.to_owned()),
            app_name: None,
            window_name: Some(window.to_owned()),
            browser_url: None,
            display_id: 1,
            is_focused: true,
        }
    }

    #[test]
    fn window_change_policy() {
        let mut p = WindowChangePolicy::default();
        // First observation establishes context without forcing.
        assert!(p.observe(&meta("com.example.editor", "a.rs"), Time(0)));
        // Same context: no force.
        assert!(!p.observe(&meta("com.example.editor", "a.rs"), Time(1_000)));
        // Near-duplicate title within the same app: ignored.
        assert!(!p.observe(&meta("com.example.editor", "a.rs — edited"), Time(2_000)));
        // Real switch.
        assert!(p.observe(&meta("com.example.browser", "docs"), Time(3_000)));
        // Another switch inside the debounce window: suppressed.
        assert!(!p.observe(&meta("com.example.editor", "b.rs"), Time(3_100)));
        // Same switch after the window has passed would force again.
        assert!(p.observe(&meta("com.example.browser", "docs"), Time(3_400)));
    }

    #[test]
    fn near_duplicate_requires_same_bundle() {
        let mut p = WindowChangePolicy::default();
        assert!(p.observe(&meta("com.example.editor", "release notes"), Time(0)));
        // Contained title but a different app is a real switch.
        assert!(p.observe(&meta("com.example.browser", "notes"), Time(1_000)));
    }

    #[tokio::test]
    async fn permission_denied_refuses_start() {
        let backend = SyntheticBackend {
            permission: false,
            ..Default::default()
        };
        let registry = Arc::new(CaptureRegistry::default());
        let e = start_capture(
            backend,
            Arc::new(StaticMetadata::default()),
            &registry,
            CaptureOptions::default(),
        )
        .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn dedup_and_stop_flow() {
        let mut frames = vec![
            CapturedFrame::solid(Time(1_000), 8, 8, [1, 1, 1, 255]),
            CapturedFrame::solid(Time(2_000), 8, 8, [1, 1, 1, 255]), // dup
            CapturedFrame::solid(Time(3_000), 8, 8, [200, 1, 1, 255]),
            CapturedFrame::solid(Time(4_000), 8, 8, [200, 1, 1, 255]), // dup
        ];
        for f in &mut frames {
            f.bytes_per_row = 8 * 4;
        }
        let backend = SyntheticBackend::scripted(frames);
        let registry = Arc::new(CaptureRegistry::default());
        let mut running = start_capture(
            backend,
            Arc::new(StaticMetadata::default()),
            &registry,
            CaptureOptions {
                interval: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        )
        .unwrap();

        let mut kept = Vec::new();
        while let Some(f) = running.frames.recv().await {
            kept.push(f.timestamp);
        }
        assert_eq!(kept, vec![Time(1_000), Time(3_000)]);
        assert_eq!(running.events.recv().await, Some(CaptureEvent::Stopped));

        // Worker has unregistered its token.
        running.join().await;
        assert!(registry.by_token.lock().unwrap().is_empty());
    }

    /// A metadata source that switches window context partway through,
    /// forcing an immediate capture of an otherwise-duplicate frame.
    struct Scripted(Mutex<Vec<FrameMetadata>>);

    impl MetadataSource for Scripted {
        fn current(&self, _display_id: u32) -> FrameMetadata {
            let mut v = self.0.lock().unwrap();
            if v.len() > 1 {
                v.remove(0)
            } else {
                v[0].clone()
            }
        }
    }

    #[tokio::test]
    async fn window_change_forces_capture_of_duplicate() {
        let frames: Vec<_> = (1..=3)
            .map(|i| CapturedFrame::solid(Time(i * 1_000), 8, 8, [9, 9, 9, 255]))
            .collect();
        let backend = SyntheticBackend::scripted(frames);
        let registry = Arc::new(CaptureRegistry::default());
        let metadata = Scripted(Mutex::new(vec![
            meta("com.example.editor", "a.rs"),
            meta("com.example.editor", "a.rs"),
            meta("com.example.browser", "docs"),
        ]));
        let mut running = start_capture(
            backend,
            Arc::new(metadata),
            &registry,
            CaptureOptions {
                interval: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        )
        .unwrap();

        let mut kept = Vec::new();
        while let Some(f) = running.frames.recv().await {
            kept.push(f.timestamp);
        }
        // Frame 2 is a pixel-duplicate under the same context (dropped);
        // frame 3 is a pixel-duplicate but the focus changed (kept).
        assert_eq!(kept, vec![Time(1_000), Time(3_000)]);
    }

    #[tokio::test]
    async fn accessibility_warning_is_published() {
        struct NoAccess;
        impl MetadataSource for NoAccess {
            fn current(&self, display_id: u32) -> FrameMetadata {
                FrameMetadata {
                    display_id,
                    ..Default::default()
                }
            }
            fn accessibility_ok(&self) -> bool {
                false
            }
        }
        let backend = SyntheticBackend::scripted(Vec::new());
        let registry = Arc::new(CaptureRegistry::default());
        let mut running = start_capture(
            backend,
            Arc::new(NoAccess),
            &registry,
            CaptureOptions {
                interval: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            running.events.recv().await,
            Some(CaptureEvent::AccessibilityPermissionWarning)
        );
    }
}
