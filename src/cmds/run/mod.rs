// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand to recover, then record.
//!
//! Startup order matters: recovery consumes every surviving WAL session
//! before the first new frame is captured, so there is never more than one
//! writer per `(display, resolution)` touching the WAL root.

use crate::capture::{
    self, CaptureEvent, CaptureOptions, CaptureRegistry, DisplaySwitchMonitor, StaticMetadata,
};
use crate::processing::{self, MarkProcessedStub, ProcessingQueue};
use crate::similarity;
use crate::stream::SyntheticBackend;
use base::clock::{Clocks, RealClocks};
use base::{err, Error, FastHashMap};
use bpaf::Bpaf;
use db::MAX_FRAMES_PER_VIDEO;
use db::dir::StorageDir;
use db::encoder::{EncoderConfig, FfmpegSink};
use db::writer::SegmentWriter;
use db::{CapturedFrame, Database, SegmentKey};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod config;

pub use config::ConfigFile;

/// Runs the recorder: recovery, then continuous capture until SIGINT or
/// SIGTERM.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Storage root directory.
    #[bpaf(external(crate::parse_storage_root))]
    storage_root: PathBuf,

    /// Path to the configuration file. Defaults to `lookback.toml` inside
    /// the storage root; a missing file means defaults.
    #[bpaf(long, argument("PATH"))]
    config: Option<PathBuf>,

    /// Encryption key for the index database (also `LOOKBACK_DB_KEY`).
    #[bpaf(long, argument("KEY"))]
    db_key: Option<String>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.storage_root.join("lookback.toml"));
    let config = ConfigFile::load(&config_path)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = config.worker_threads {
        builder.worker_threads(n);
    }
    let rt = builder
        .build()
        .map_err(|e| err!(e, msg("unable to build async runtime")))?;
    rt.block_on(async_run(args, config))
}

async fn async_run(args: Args, config: ConfigFile) -> Result<i32, Error> {
    let clocks = RealClocks {};
    let dir = Arc::new(StorageDir::open(&args.storage_root, false)?);
    let key = super::resolve_key(args.db_key).or_else(|| config.db_key.clone());
    let conn = super::open_conn(dir.root(), key.as_deref(), super::OpenMode::ReadWrite)?;
    let db = Arc::new(Database::new(clocks, conn)?);

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("unable to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        drop(shutdown_tx);
    });

    let encoder_config = EncoderConfig {
        frame_rate: config.frame_rate,
        prefer_hardware: config.prefer_hardware,
        ..Default::default()
    };

    let (queue, _processing_join) = processing::start(MarkProcessedStub { db: db.clone() });

    // Recovery runs to completion before capture starts; it blocks on file
    // and encoder work, so keep it off the async workers.
    {
        let recovery_db = db.clone();
        let dir = dir.clone();
        let cfg = encoder_config.clone();
        let queue = queue.clone();
        let report = tokio::task::spawn_blocking(move || {
            db::recovery::recover(&recovery_db, &dir, &cfg, FfmpegSink::new, &|ids| {
                queue.enqueue_frames(ids)
            })
        })
        .await
        .map_err(|e| err!(Internal, msg("recovery task panicked"), source(e)))??;
        let metadata = serde_json::json!({
            "sessions": report.sessions,
            "videos": report.videos_created,
            "frames": report.frames_inserted,
        })
        .to_string();
        let now = db.clocks().realtime();
        db.lock()
            .record_metric("recovery_completed", now, Some(metadata.as_str()))?;
    }

    prune(&db, &dir, &config)?;

    {
        let now = db.clocks().realtime();
        let mut l = db.lock();
        l.upsert_display(config.display_id, "", now)?;
        l.open_display_session(config.display_id, now)?;
        l.record_metric("capture_started", now, None)?;
    }

    // Platform capture backends and window-metadata helpers are external
    // collaborators; stand-alone builds record synthetic frames, which
    // exercises the entire pipeline below.
    let backend = SyntheticBackend::default();
    let registry = Arc::new(CaptureRegistry::default());
    let mut running = capture::start_capture(
        backend,
        Arc::new(StaticMetadata::default()),
        &registry,
        CaptureOptions {
            display_id: config.display_id,
            interval: std::time::Duration::from_millis(config.interval_ms),
            dedup_threshold: config.dedup_threshold,
        },
    )?;
    // Display hotplug watchers hold this token, never the capture itself.
    let _monitor = DisplaySwitchMonitor::new(registry.clone(), running.token);

    let mut ingest = Ingest {
        db: db.clone(),
        dir: dir.clone(),
        queue,
        encoder_config,
        writers: FastHashMap::default(),
    };

    let capture_commands = running.commands();
    let mut active_display = config.display_id;
    let mut stop_requested = false;
    loop {
        tokio::select! {
            _ = shutdown_rx.wait(), if !stop_requested => {
                stop_requested = true;
                let _ = capture_commands.send(capture::CaptureCommand::Stop).await;
                // Keep draining until the Stopped event arrives.
            }
            ev = running.events.recv() => match ev {
                Some(CaptureEvent::Stopped) | None => break,
                Some(CaptureEvent::DisplaySwitched(new_display)) => {
                    let now = db.clocks().realtime();
                    let mut l = db.lock();
                    l.close_display_session(active_display, now)?;
                    l.upsert_display(new_display, "", now)?;
                    l.open_display_session(new_display, now)?;
                    l.close_open_segments();
                    active_display = new_display;
                }
                Some(CaptureEvent::AccessibilityPermissionWarning) => {
                    warn!("window metadata unavailable; grant accessibility permission");
                }
            },
            frame = running.frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = tokio::task::block_in_place(|| ingest.frame(frame)) {
                        error!(err = %e.chain(), "frame ingest failed");
                    }
                }
                None => break,
            },
        }
    }

    // Shutdown: finish in-flight encodes; don't wait for OCR.
    tokio::task::block_in_place(|| ingest.finish())?;
    {
        let now = db.clocks().realtime();
        let mut l = db.lock();
        l.close_display_session(active_display, now)?;
        l.close_open_segments();
        l.record_metric("capture_stopped", now, None)?;
    }
    prune(&db, &dir, &config)?;
    info!("recorder stopped cleanly");
    Ok(0)
}

/// Deletes the oldest videos beyond the configured budget: rows first, in
/// one transaction, then the files.
fn prune(db: &Database, dir: &StorageDir, config: &ConfigFile) -> Result<(), Error> {
    let Some(budget) = config.retain_bytes()? else {
        return Ok(());
    };
    let pruned = db.lock().prune_videos(budget)?;
    if pruned.is_empty() {
        return Ok(());
    }
    let mut bytes = 0;
    for v in &pruned {
        match std::fs::remove_file(dir.full_path(&v.path)) {
            Ok(()) => {
                let _ = dir.sync_parent(&dir.full_path(&v.path));
                bytes += v.file_size;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(video_id = v.id, %err, "unable to unlink pruned segment"),
        }
    }
    info!(
        videos = pruned.len(),
        freed = %base::strutil::encode_size(bytes),
        "pruned old segments"
    );
    Ok(())
}

/// Owns the per-`(display, resolution)` segment writers on the consumer
/// side of the deduped frame stream.
struct Ingest {
    db: Arc<Database>,
    dir: Arc<StorageDir>,
    queue: ProcessingQueue,
    encoder_config: EncoderConfig,
    writers: FastHashMap<(u32, u32, u32), SegmentWriter<FfmpegSink>>,
}

impl Ingest {
    fn frame(&mut self, frame: CapturedFrame) -> Result<(), Error> {
        let key = (frame.metadata.display_id, frame.width, frame.height);

        // Rotate a full segment, and rotate away from a writer whose
        // encoder has died so the next one can try a fresh sink.
        if let Some(writer) = self.writers.get(&key) {
            if writer.wal_frames() as usize >= MAX_FRAMES_PER_VIDEO || !writer.encoder_ok() {
                let writer = self.writers.remove(&key).expect("writer just seen");
                self.commit(writer)?;
            }
        }

        if !self.writers.contains_key(&key) {
            let video_id = self.start_video(&frame)?;
            let writer = SegmentWriter::new(
                &self.dir,
                video_id,
                frame.metadata.display_id,
                frame.timestamp,
                FfmpegSink::new(),
                self.encoder_config.clone(),
            )?;
            self.writers.insert(key, writer);
        }

        let writer = self.writers.get_mut(&key).expect("writer just inserted");
        writer.append(&frame)?;

        // The frame row goes in right away so search/OCR see it without
        // waiting for the segment to close; the video link is fixed up at
        // finalize if the encoder dies short.
        let (video_id, index) = if writer.encoder_ok() {
            (Some(writer.video_id()), (writer.encoded_frames() - 1) as i32)
        } else {
            (None, 0)
        };
        let frame_id = {
            let mut l = self.db.lock();
            l.insert_frame(
                &SegmentKey {
                    bundle_id: frame.metadata.app_bundle_id.clone(),
                    window_name: frame.metadata.window_name.clone(),
                },
                frame.metadata.browser_url.as_deref(),
                frame.timestamp,
                video_id,
                index,
                frame.metadata.display_id,
                frame.metadata.is_focused,
            )?
        };
        self.queue.enqueue_frames(&[frame_id]);

        // One cheap fingerprint per kept frame; logged at trace level for
        // storage-health spelunking.
        tracing::trace!(frame_id, hash = similarity::hash(&frame), "frame ingested");
        Ok(())
    }

    fn commit(&mut self, writer: SegmentWriter<FfmpegSink>) -> Result<(), Error> {
        if writer.wal_frames() == 0 {
            return writer.cancel();
        }
        let wal_frames = writer.wal_frames();
        let (seg, wal) = writer.finalize()?;
        if seg.frame_count == 0 {
            // The encoder never produced a playable frame. Drop the video
            // row (no frame row references it) and keep the WAL; recovery
            // re-encodes it at the next startup.
            let mut l = self.db.lock();
            l.detach_overflow_frames(seg.video_id, 0)?;
            l.delete_video(seg.video_id)?;
            warn!(
                video_id = seg.video_id,
                wal = wal_frames,
                "segment produced no playable frames; leaving WAL for recovery"
            );
            drop(wal);
            return Ok(());
        }
        {
            let mut l = self.db.lock();
            l.complete_video(seg.video_id, &seg.rel_path, seg.file_size, seg.frame_count)?;
            l.detach_overflow_frames(seg.video_id, seg.frame_count)?;
        }
        if (seg.frame_count as u32) < wal_frames {
            // Frames past the encoder failure exist only in the WAL; leave
            // the session for the next startup's recovery instead of
            // deleting the sole durable copy.
            warn!(
                video_id = seg.video_id,
                encoded = seg.frame_count,
                wal = wal_frames,
                "segment closed short; leaving WAL for recovery"
            );
            drop(wal);
        } else {
            wal.finalize()?;
        }
        Ok(())
    }

    fn start_video(&mut self, frame: &CapturedFrame) -> Result<i64, Error> {
        let v = db::VideoToInsert {
            width: frame.width,
            height: frame.height,
            frame_rate: self.encoder_config.frame_rate as i32,
            display_id: frame.metadata.display_id,
        };
        let mut l = self.db.lock();
        match l.start_video(&v) {
            Ok(id) => Ok(id),
            Err(e) if e.kind() == base::ErrorKind::AlreadyExists => {
                // A stale in-progress row recovery didn't know about (its
                // WAL session is gone); supersede it.
                if let Some(stale) =
                    l.find_resumable_video(v.display_id, v.width, v.height)?
                {
                    warn!(video_id = stale, "deleting stale in-progress video row");
                    l.delete_video(stale)?;
                }
                l.start_video(&v)
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        let writers: Vec<_> = self.writers.drain().map(|(_, w)| w).collect();
        for writer in writers {
            if let Err(e) = self.commit(writer) {
                error!(err = %e.chain(), "unable to commit segment during shutdown");
            }
        }
        Ok(())
    }
}
