// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The video encoder wrapper.
//!
//! [`VideoEncoder`] owns the contract the segment writer relies on:
//! fragmented-MP4 output whose bytes become readable before the segment is
//! closed, integer presentation-time arithmetic, a hard wait-for-ready
//! timeout, and survival of the output file being deleted out from under
//! it. The actual compression runs behind the [`FrameSink`] seam: in
//! production an `ffmpeg` child consuming raw BGRA on stdin, in tests a
//! mock (see `testutil::MockSink`).

use crate::frame::CapturedFrame;
use base::time::Time;
use base::{bail, err, Error};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

/// Presentation-time units per second. At 30 fps each frame is exactly
/// 600 / 30 = 20 units, so timestamps never accumulate floating-point
/// drift.
pub const MEDIA_UNITS_PER_SEC: i64 = 600;

/// A presentation time, in units of 1/600 s from the segment start.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct MediaTime(pub i64);

/// A fragment is flushed roughly every 0.1 s of video time.
pub const FRAGMENT_INTERVAL_USEC: u64 = 100_000;

/// A file-size jump greater than this marks a new on-disk fragment.
const FRAGMENT_SIZE_JUMP: u64 = 1024;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub frame_rate: u32,

    /// Prefer a hardware encoder when the sink can probe one.
    pub prefer_hardware: bool,

    /// How long `encode` waits for the sink to become ready before
    /// auto-finalizing.
    pub ready_timeout: std::time::Duration,

    /// Poll interval while waiting for readiness.
    pub ready_poll: std::time::Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            frame_rate: 30,
            prefer_hardware: true,
            ready_timeout: std::time::Duration::from_secs(5),
            ready_poll: std::time::Duration::from_millis(100),
        }
    }
}

/// Parameters handed to [`FrameSink::start`].
#[derive(Clone, Debug)]
pub struct SinkParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub fragment_interval_usec: u64,
    pub prefer_hardware: bool,
    pub output: PathBuf,
}

/// The compression backend behind [`VideoEncoder`]. One sink encodes one
/// output file at a time; `start` may be called again after `finish` or
/// `abort` (used by `recreate`).
pub trait FrameSink: Send + 'static {
    /// Opens the output. Returns whether hardware acceleration is in use.
    fn start(&mut self, params: &SinkParams) -> Result<bool, Error>;

    /// Appends one frame of packed BGRA pixels.
    fn write_frame(&mut self, packed_bgra: &[u8]) -> Result<(), Error>;

    /// Whether the sink can accept another frame right now.
    fn is_ready(&self) -> bool;

    /// Flushes and closes the output; after this the file has its closing
    /// atoms and is randomly seekable.
    fn finish(&mut self) -> Result<(), Error>;

    /// Tears down without finalizing. The output file is left as-is.
    fn abort(&mut self);
}

/// Hardware-accelerated (when available) fragmented-MP4 encoder wrapper.
#[derive(Debug)]
pub struct VideoEncoder<S: FrameSink> {
    sink: S,
    params: SinkParams,
    cfg: EncoderConfig,
    segment_start: Time,
    units_per_frame: i64,
    frame_count: i64,
    hardware: bool,
    finalized: bool,
    last_observed_size: u64,
    fragment_seen: bool,
}

impl<S: FrameSink> VideoEncoder<S> {
    /// Opens the sink and probes for hardware acceleration.
    pub fn initialize(
        mut sink: S,
        cfg: EncoderConfig,
        width: u32,
        height: u32,
        output: &Path,
        segment_start: Time,
    ) -> Result<Self, Error> {
        if cfg.frame_rate == 0 || MEDIA_UNITS_PER_SEC % i64::from(cfg.frame_rate) != 0 {
            bail!(
                InvalidArgument,
                msg(
                    "frame rate {} does not evenly divide {} media units",
                    cfg.frame_rate,
                    MEDIA_UNITS_PER_SEC
                ),
            );
        }
        let params = SinkParams {
            width,
            height,
            frame_rate: cfg.frame_rate,
            fragment_interval_usec: FRAGMENT_INTERVAL_USEC,
            prefer_hardware: cfg.prefer_hardware,
            output: output.to_owned(),
        };
        let hardware = sink.start(&params)?;
        info!(
            output = %output.display(),
            width,
            height,
            hardware,
            "encoder initialized"
        );
        Ok(VideoEncoder {
            units_per_frame: MEDIA_UNITS_PER_SEC / i64::from(cfg.frame_rate),
            sink,
            params,
            cfg,
            segment_start,
            frame_count: 0,
            hardware,
            finalized: false,
            last_observed_size: 0,
            fragment_seen: false,
        })
    }

    pub fn hardware_acceleration(&self) -> bool {
        self.hardware
    }

    pub fn frame_count(&self) -> i64 {
        self.frame_count
    }

    pub fn segment_start(&self) -> Time {
        self.segment_start
    }

    pub fn has_fragment_written(&self) -> bool {
        self.fragment_seen
    }

    /// A conservative lower bound on the number of frames safely readable
    /// from the output file: frame reordering (B-frames) can hold back up
    /// to two frames of the most recent fragment.
    pub fn frames_flushed_to_disk(&self) -> usize {
        if self.fragment_seen {
            (self.frame_count - 2).max(0) as usize
        } else {
            0
        }
    }

    /// Appends a frame, returning its presentation time.
    pub fn encode(&mut self, frame: &CapturedFrame) -> Result<MediaTime, Error> {
        if self.finalized {
            bail!(FailedPrecondition, msg("encoder is already finalized"));
        }
        if (frame.width, frame.height) != (self.params.width, self.params.height) {
            bail!(
                InvalidArgument,
                msg(
                    "frame is {}x{}; encoder expects {}x{}",
                    frame.width,
                    frame.height,
                    self.params.width,
                    self.params.height
                ),
            );
        }
        if !self.params.output.exists() {
            warn!(output = %self.params.output.display(), "output file vanished; recreating");
            self.recreate()?;
        }
        self.wait_ready()?;

        let pts = MediaTime(self.frame_count * self.units_per_frame);
        if let Err(e) = self.sink.write_frame(&frame.packed_rows()) {
            let _ = self.finalize();
            return Err(err!(Unknown, msg("encoder append failed"), source(e)));
        }
        self.frame_count += 1;
        self.observe_output_size();
        Ok(pts)
    }

    fn wait_ready(&mut self) -> Result<(), Error> {
        let deadline = std::time::Instant::now() + self.cfg.ready_timeout;
        while !self.sink.is_ready() {
            if std::time::Instant::now() >= deadline {
                // Close out what we have; the WAL covers the rest.
                let _ = self.finalize();
                bail!(
                    DeadlineExceeded,
                    msg(
                        "encoder not ready after {:?}; segment closed at {} frames",
                        self.cfg.ready_timeout,
                        self.frame_count
                    ),
                );
            }
            std::thread::sleep(self.cfg.ready_poll);
        }
        Ok(())
    }

    fn observe_output_size(&mut self) {
        let size = std::fs::metadata(&self.params.output)
            .map(|m| m.len())
            .unwrap_or(0);
        if size > self.last_observed_size + FRAGMENT_SIZE_JUMP {
            self.fragment_seen = true;
            debug!(
                output = %self.params.output.display(),
                size,
                "fragment flushed"
            );
        }
        if size > self.last_observed_size {
            self.last_observed_size = size;
        }
    }

    /// Writes the closing atoms; the file is then randomly seekable.
    pub fn finalize(&mut self) -> Result<(), Error> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.sink.finish()?;
        self.observe_output_size();
        Ok(())
    }

    /// Reopens the sink after the output file was observed missing
    /// (external deletion). `frame_count` is preserved so presentation
    /// timestamps remain monotone.
    pub fn recreate(&mut self) -> Result<(), Error> {
        self.sink.abort();
        self.hardware = self.sink.start(&self.params)?;
        self.last_observed_size = 0;
        self.fragment_seen = false;
        Ok(())
    }

    /// Tears down without finalizing and deletes the partial output.
    /// Used by `SegmentWriter::cancel`.
    pub fn reset(mut self) {
        self.sink.abort();
        self.finalized = true;
        if let Err(err) = std::fs::remove_file(&self.params.output) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, output = %self.params.output.display(), "unable to remove cancelled output");
            }
        }
    }
}

/// Production sink: an `ffmpeg` child process consuming raw BGRA frames on
/// stdin and muxing fragmented MP4, so bytes become readable a fragment at
/// a time rather than only at finalize.
#[derive(Default)]
pub struct FfmpegSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

/// Hardware encoders worth probing for, best first.
const HARDWARE_ENCODERS: [&str; 4] = [
    "hevc_videotoolbox",
    "h264_videotoolbox",
    "h264_vaapi",
    "h264_nvenc",
];

const SOFTWARE_ENCODER: &str = "libx264";

impl FfmpegSink {
    pub fn new() -> Self {
        FfmpegSink::default()
    }

    /// Picks the codec to use from `ffmpeg -encoders` output.
    fn pick_encoder(encoders_output: &str, prefer_hardware: bool) -> (&'static str, bool) {
        if prefer_hardware {
            for name in HARDWARE_ENCODERS {
                if encoders_output.contains(name) {
                    return (name, true);
                }
            }
        }
        (SOFTWARE_ENCODER, false)
    }

    fn probe() -> Result<String, Error> {
        let out = Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| err!(Unavailable, msg("unable to run ffmpeg; is it installed?"), source(e)))?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl FrameSink for FfmpegSink {
    fn start(&mut self, params: &SinkParams) -> Result<bool, Error> {
        let (encoder, hardware) = Self::pick_encoder(&Self::probe()?, params.prefer_hardware);
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "bgra"])
            .arg("-video_size")
            .arg(format!("{}x{}", params.width, params.height))
            .arg("-framerate")
            .arg(params.frame_rate.to_string())
            .args(["-i", "-"])
            .args(["-c:v", encoder, "-pix_fmt", "yuv420p"])
            .args(["-movflags", "frag_keyframe+empty_moov+default_base_moof"])
            .arg("-frag_duration")
            .arg(params.fragment_interval_usec.to_string())
            .args(["-f", "mp4", "-y"])
            .arg(&params.output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| err!(Unavailable, msg("unable to spawn ffmpeg"), source(e)))?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        debug!(encoder, hardware, "ffmpeg sink started");
        Ok(hardware)
    }

    fn write_frame(&mut self, packed_bgra: &[u8]) -> Result<(), Error> {
        let Some(stdin) = self.stdin.as_mut() else {
            bail!(FailedPrecondition, msg("ffmpeg sink is not started"));
        };
        stdin
            .write_all(packed_bgra)
            .map_err(|e| err!(Unknown, msg("writing frame to ffmpeg"), source(e)))
    }

    fn is_ready(&self) -> bool {
        // The pipe applies its own backpressure; "ready" here means the
        // child hasn't exited under us.
        match &self.child {
            Some(_) if self.stdin.is_some() => true,
            _ => false,
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        drop(self.stdin.take()); // EOF; ffmpeg writes the closing atoms.
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| err!(Unknown, msg("waiting for ffmpeg"), source(e)))?;
        if !status.success() {
            bail!(Unknown, msg("ffmpeg exited with {status}"));
        }
        Ok(())
    }

    fn abort(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, MockSink};
    use base::ErrorKind;

    fn frame(t_ms: i64) -> CapturedFrame {
        CapturedFrame::solid(Time(t_ms), 16, 8, [0, 0, 0, 255])
    }

    fn new_encoder(sink: MockSink, dir: &Path) -> VideoEncoder<MockSink> {
        VideoEncoder::initialize(
            sink,
            EncoderConfig::default(),
            16,
            8,
            &dir.join("segment_1"),
            Time(0),
        )
        .unwrap()
    }

    #[test]
    fn integer_presentation_times() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let mut e = new_encoder(MockSink::default(), tmp.path());
        for i in 0..5 {
            let pts = e.encode(&frame(i * 33)).unwrap();
            assert_eq!(pts, MediaTime(i * 20));
        }
        assert_eq!(e.frame_count(), 5);
        e.finalize().unwrap();
        // Idempotent.
        e.finalize().unwrap();
        assert_eq!(
            e.encode(&frame(999)).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
    }

    #[test]
    fn fragment_tracking_and_flushed_lower_bound() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        // The mock writes a 512-byte init blob (not a fragment) and 2 KiB
        // per frame (each a fragment).
        let mut e = new_encoder(MockSink::default(), tmp.path());
        assert!(!e.has_fragment_written());
        assert_eq!(e.frames_flushed_to_disk(), 0);

        e.encode(&frame(0)).unwrap();
        assert!(e.has_fragment_written());
        assert_eq!(e.frames_flushed_to_disk(), 0); // max(0, 1-2)

        e.encode(&frame(33)).unwrap();
        e.encode(&frame(66)).unwrap();
        assert_eq!(e.frames_flushed_to_disk(), 1); // max(0, 3-2)
    }

    #[test]
    fn not_ready_times_out_and_self_finalizes() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig {
            ready_timeout: std::time::Duration::from_millis(20),
            ready_poll: std::time::Duration::from_millis(5),
            ..Default::default()
        };
        let sink = MockSink {
            ready: false,
            ..Default::default()
        };
        let mut e =
            VideoEncoder::initialize(sink, cfg, 16, 8, &tmp.path().join("seg"), Time(0)).unwrap();
        let err = e.encode(&frame(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        // Auto-finalized: further encodes are refused.
        assert_eq!(
            e.encode(&frame(33)).unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
    }

    #[test]
    fn sink_failure_closes_segment() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let sink = MockSink {
            fail_after: Some(2),
            ..Default::default()
        };
        let mut e = new_encoder(sink, tmp.path());
        e.encode(&frame(0)).unwrap();
        e.encode(&frame(33)).unwrap();
        let err = e.encode(&frame(66)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(e.frame_count(), 2);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let mut e = new_encoder(MockSink::default(), tmp.path());
        let bad = CapturedFrame::solid(Time(0), 4, 4, [0; 4]);
        assert_eq!(
            e.encode(&bad).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn recreate_preserves_frame_count() {
        testutil::init();
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("segment_1");
        let mut e = new_encoder(MockSink::default(), tmp.path());
        e.encode(&frame(0)).unwrap();
        e.encode(&frame(33)).unwrap();

        // Someone deletes the file out from under the encoder.
        std::fs::remove_file(&out).unwrap();
        let pts = e.encode(&frame(66)).unwrap();
        assert_eq!(pts, MediaTime(40)); // count preserved: 2 * 20
        assert!(out.exists());
    }

    #[test]
    fn bad_frame_rate_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = EncoderConfig {
            frame_rate: 7, // 600 / 7 is not integral
            ..Default::default()
        };
        let e = VideoEncoder::initialize(
            MockSink::default(),
            cfg,
            16,
            8,
            &tmp.path().join("seg"),
            Time(0),
        );
        assert_eq!(e.unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn encoder_choice_from_probe_output() {
        let out = "V..... libx264  H.264\n V..... h264_vaapi  H.264 (VAAPI)\n";
        assert_eq!(FfmpegSink::pick_encoder(out, true), ("h264_vaapi", true));
        assert_eq!(FfmpegSink::pick_encoder(out, false), ("libx264", false));
        let sw_only = "V..... libx264  H.264\n";
        assert_eq!(FfmpegSink::pick_encoder(sw_only, true), ("libx264", false));
    }
}
