// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Writing one video segment: the WAL and the encoder, bound together.
//!
//! The order of operations on `append` is the recorder's central promise:
//! the frame reaches the (fsynced) WAL before the encoder sees it. A WAL
//! failure is fatal to the segment; an encoder failure is not — subsequent
//! frames keep landing in the WAL, and recovery re-encodes them at the
//! next startup.
//!
//! Lifecycle: `Empty → Recording` on the first append, then exactly one of
//! [`SegmentWriter::finalize`] or [`SegmentWriter::cancel`], both of which
//! consume the writer; backward transitions don't typecheck.

use crate::dir::StorageDir;
use crate::encoder::{EncoderConfig, FrameSink, VideoEncoder};
use crate::frame::CapturedFrame;
use crate::wal::WalSession;
use base::time::Time;
use base::{bail, Error};
use std::path::PathBuf;
use tracing::warn;

/// WAL appends slower than this are reported as a storage-health signal.
const SLOW_WAL_APPEND: std::time::Duration = std::time::Duration::from_millis(500);

/// What `finalize` yields: everything the database needs for the video row.
/// The file is finalized, but the WAL session is returned alive — the
/// caller deletes it only after the row has committed.
#[derive(Debug)]
pub struct FinishedSegment {
    pub video_id: i64,
    pub width: u32,
    pub height: u32,
    pub rel_path: String,
    pub file_size: i64,
    pub frame_rate: i32,

    /// Frames actually present in the MP4. May be less than the WAL's count
    /// if the encoder failed mid-segment.
    pub frame_count: i64,

    pub start_time: Time,
    pub end_time: Time,
    pub display_id: u32,
}

/// Writes one segment. See the module doc for the lifecycle.
pub struct SegmentWriter<S: FrameSink> {
    video_id: i64,
    display_id: u32,
    rel_path: String,
    full_path: PathBuf,
    start_time: Time,
    cfg: EncoderConfig,

    wal: WalSession,
    sink: Option<S>,
    encoder: Option<VideoEncoder<S>>,
    encoder_failed: bool,

    frame_dims: Option<(u32, u32)>,
    last_frame_time: Option<Time>,
    wal_frames: u32,
}

impl<S: FrameSink> SegmentWriter<S> {
    /// Creates the WAL session and reserves the segment path. The encoder
    /// is initialized lazily from the first frame's dimensions.
    pub fn new(
        dir: &StorageDir,
        video_id: i64,
        display_id: u32,
        start_time: Time,
        sink: S,
        cfg: EncoderConfig,
    ) -> Result<Self, Error> {
        let (rel_path, full_path) = dir.prepare_segment_path(video_id, start_time)?;
        let wal = WalSession::create(&dir.wal_root(), video_id, start_time)?;
        Ok(SegmentWriter {
            video_id,
            display_id,
            rel_path,
            full_path,
            start_time,
            cfg,
            wal,
            sink: Some(sink),
            encoder: None,
            encoder_failed: false,
            frame_dims: None,
            last_frame_time: None,
            wal_frames: 0,
        })
    }

    pub fn video_id(&self) -> i64 {
        self.video_id
    }

    /// Frames durably in the WAL.
    pub fn wal_frames(&self) -> u32 {
        self.wal_frames
    }

    /// Frames accepted by the encoder.
    pub fn encoded_frames(&self) -> i64 {
        self.encoder.as_ref().map(VideoEncoder::frame_count).unwrap_or(0)
    }

    /// False once the encoder has failed; the WAL keeps accepting frames
    /// regardless, but recovery-style callers may prefer to rotate.
    pub fn encoder_ok(&self) -> bool {
        !self.encoder_failed
    }

    /// Appends one frame: WAL first (fatal on failure), then encode
    /// (tolerated on failure).
    pub fn append(&mut self, frame: &CapturedFrame) -> Result<(), Error> {
        if let Some(dims) = self.frame_dims {
            if dims != (frame.width, frame.height) {
                bail!(
                    InvalidArgument,
                    msg(
                        "frame is {}x{}; segment {} is {}x{}",
                        frame.width,
                        frame.height,
                        self.video_id,
                        dims.0,
                        dims.1
                    ),
                );
            }
        }

        let wal_start = std::time::Instant::now();
        self.wal.append(frame)?;
        let elapsed = wal_start.elapsed();
        if elapsed > SLOW_WAL_APPEND {
            warn!(
                video_id = self.video_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow WAL append; storage may be unhealthy"
            );
        }
        self.wal_frames += 1;
        self.frame_dims.get_or_insert((frame.width, frame.height));
        self.last_frame_time = Some(frame.timestamp);

        if self.encoder.is_none() && !self.encoder_failed {
            let sink = self.sink.take().expect("sink present until encoder init");
            match VideoEncoder::initialize(
                sink,
                self.cfg.clone(),
                frame.width,
                frame.height,
                &self.full_path,
                self.start_time,
            ) {
                Ok(e) => self.encoder = Some(e),
                Err(e) => {
                    warn!(
                        video_id = self.video_id,
                        err = %e.chain(),
                        "encoder init failed; frames will reach this segment only via the WAL"
                    );
                    self.encoder_failed = true;
                }
            }
        }

        if self.encoder_failed {
            return Ok(());
        }
        if let Some(encoder) = self.encoder.as_mut() {
            if let Err(e) = encoder.encode(frame) {
                warn!(
                    video_id = self.video_id,
                    encoded = encoder.frame_count(),
                    err = %e.chain(),
                    "encoder failed mid-segment; later frames are WAL-only"
                );
                // The encoder auto-finalized; keep it for its frame count.
                self.encoder_failed = true;
            }
        }
        Ok(())
    }

    /// Finalizes the encoder and stats the file. The returned
    /// [`WalSession`] must be finalized by the caller *after* the video and
    /// frame rows commit; dropping it instead leaves the session for crash
    /// recovery.
    pub fn finalize(mut self) -> Result<(FinishedSegment, WalSession), Error> {
        let Some((width, height)) = self.frame_dims else {
            bail!(FailedPrecondition, msg("segment {} has no frames", self.video_id));
        };
        let frame_count = match self.encoder.as_mut() {
            Some(encoder) => {
                encoder.finalize()?;
                encoder.frame_count()
            }
            None => 0,
        };
        let file_size = std::fs::metadata(&self.full_path)
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        Ok((
            FinishedSegment {
                video_id: self.video_id,
                width,
                height,
                rel_path: self.rel_path,
                file_size,
                frame_rate: self.cfg.frame_rate as i32,
                frame_count,
                start_time: self.start_time,
                end_time: self.last_frame_time.unwrap_or(self.start_time),
                display_id: self.display_id,
            },
            self.wal,
        ))
    }

    /// Abandons the segment: resets the encoder, deletes the partial MP4,
    /// and removes the WAL session.
    pub fn cancel(self) -> Result<(), Error> {
        if let Some(encoder) = self.encoder {
            encoder.reset();
        } else if let Err(err) = std::fs::remove_file(&self.full_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, path = %self.full_path.display(), "unable to remove cancelled segment");
            }
        }
        self.wal.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, MockSink, TestDb};
    use crate::wal;
    use base::ErrorKind;

    fn frame(t_ms: i64, w: u32, h: u32) -> CapturedFrame {
        CapturedFrame::solid(Time(t_ms), w, h, [1, 2, 3, 255])
    }

    #[test]
    fn normal_lifecycle() {
        testutil::init();
        let tdb = TestDb::new();
        let mut w = SegmentWriter::new(
            &tdb.dir,
            1,
            0,
            Time(1_735_689_600_000),
            MockSink::default(),
            EncoderConfig::default(),
        )
        .unwrap();
        for i in 0..3i64 {
            w.append(&frame(1_735_689_600_000 + i * 2_000, 8, 8)).unwrap();
        }
        assert_eq!(w.wal_frames(), 3);
        assert_eq!(w.encoded_frames(), 3);

        let (seg, wal_session) = w.finalize().unwrap();
        assert_eq!(seg.frame_count, 3);
        assert_eq!((seg.width, seg.height), (8, 8));
        assert_eq!(seg.end_time, Time(1_735_689_604_000));
        assert_eq!(seg.file_size, 512 + 3 * 2048);
        assert!(tdb.dir.full_path(&seg.rel_path).exists());

        // The WAL outlives finalize until the caller commits rows.
        assert_eq!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().len(), 1);
        wal_session.finalize().unwrap();
        assert!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().is_empty());
    }

    #[test]
    fn encoder_failure_keeps_wal_going() {
        testutil::init();
        let tdb = TestDb::new();
        let sink = MockSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let mut w = SegmentWriter::new(
            &tdb.dir,
            2,
            0,
            Time(1_735_689_600_000),
            sink,
            EncoderConfig::default(),
        )
        .unwrap();
        for i in 0..4i64 {
            // Every append succeeds even though the encoder dies on the 2nd.
            w.append(&frame(1_735_689_600_000 + i * 2_000, 8, 8)).unwrap();
        }
        assert!(!w.encoder_ok());
        assert_eq!(w.wal_frames(), 4);

        let (seg, wal_session) = w.finalize().unwrap();
        assert_eq!(seg.frame_count, 1);

        // All four frames are durable in the WAL for recovery.
        assert_eq!(wal_session.read_frames().unwrap().len(), 4);
    }

    #[test]
    fn cancel_removes_everything() {
        testutil::init();
        let tdb = TestDb::new();
        let mut w = SegmentWriter::new(
            &tdb.dir,
            3,
            0,
            Time(1_735_689_600_000),
            MockSink::default(),
            EncoderConfig::default(),
        )
        .unwrap();
        w.append(&frame(1_735_689_600_000, 8, 8)).unwrap();
        let mp4 = tdb.dir.full_path("segments/2025/01/01/segment_3");
        assert!(mp4.exists());
        w.cancel().unwrap();
        assert!(!mp4.exists());
        assert!(wal::list_active_sessions(&tdb.dir.wal_root()).unwrap().is_empty());
    }

    #[test]
    fn empty_finalize_is_refused() {
        testutil::init();
        let tdb = TestDb::new();
        let w = SegmentWriter::new(
            &tdb.dir,
            4,
            0,
            Time(1_735_689_600_000),
            MockSink::default(),
            EncoderConfig::default(),
        )
        .unwrap();
        assert_eq!(
            w.finalize().unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
    }

    #[test]
    fn mixed_dimensions_are_refused() {
        testutil::init();
        let tdb = TestDb::new();
        let mut w = SegmentWriter::new(
            &tdb.dir,
            5,
            0,
            Time(1_735_689_600_000),
            MockSink::default(),
            EncoderConfig::default(),
        )
        .unwrap();
        w.append(&frame(1_735_689_600_000, 8, 8)).unwrap();
        assert_eq!(
            w.append(&frame(1_735_689_602_000, 16, 16)).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}
