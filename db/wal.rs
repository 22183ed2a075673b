// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The binary write-ahead log of raw frames.
//!
//! Each in-progress video segment owns a session directory
//! `wal/active_segment_{videoId}` holding an append-only `frames.bin` and a
//! `metadata.json` sidecar. A frame reaches the WAL *before* the encoder
//! sees it, so an unplayable (crash-truncated) MP4 never costs frames: on
//! startup, recovery replays whatever sessions survive.
//!
//! `frames.bin` is a stream of records:
//!
//! ```text
//! [ 34-byte header | appBundleID | appName | windowName | browserURL | pixels ]
//! ```
//!
//! The header is packed little-endian: `f64` Unix-seconds timestamp, `u32`
//! width, height, bytesPerRow, dataSize, displayID, then a `u16` byte length
//! for each of the four UTF-8 metadata strings. A record's total size is
//! fully determined by its header, and a truncated trailing record is
//! dropped by the reader rather than treated as fatal.

use crate::frame::{CapturedFrame, FrameMetadata};
use base::time::Time;
use base::{bail, err, Error};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of the fixed record header. Locked; see the golden test below.
pub const HEADER_LEN: usize = 34;

const FRAMES_FILE: &str = "frames.bin";
const METADATA_FILE: &str = "metadata.json";
const SESSION_PREFIX: &str = "active_segment_";

/// The `metadata.json` sidecar. `frameCount` trails `frames.bin` by at most
/// one append; the binary log is authoritative.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub video_id: i64,

    /// Milliseconds since epoch.
    pub start_time: i64,

    pub frame_count: u32,

    /// Dimensions of the first frame; zero until one has been appended.
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// One WAL session: the durable shadow of one in-progress video.
#[derive(Debug)]
pub struct WalSession {
    dir: PathBuf,
    file: Option<fs::File>,
    meta: SessionMeta,
}

impl WalSession {
    /// Creates the session directory with an empty `frames.bin` and a
    /// zero-frame `metadata.json`.
    pub fn create(wal_root: &Path, video_id: i64, start_time: Time) -> Result<Self, Error> {
        let dir = wal_root.join(format!("{SESSION_PREFIX}{video_id}"));
        fs::create_dir(&dir).map_err(|e| err!(e, msg("unable to create WAL session {}", dir.display())))?;
        let file = fs::OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(FRAMES_FILE))
            .map_err(|e| err!(e, msg("unable to create frames.bin in {}", dir.display())))?;
        let mut s = WalSession {
            dir,
            file: Some(file),
            meta: SessionMeta {
                video_id,
                start_time: start_time.0,
                frame_count: 0,
                width: 0,
                height: 0,
            },
        };
        s.write_meta()?;
        Ok(s)
    }

    /// Opens an existing session directory, for recovery.
    fn open(dir: PathBuf) -> Result<Self, Error> {
        let meta_path = dir.join(METADATA_FILE);
        let data = fs::read(&meta_path)
            .map_err(|e| err!(e, msg("unable to read {}", meta_path.display())))?;
        let meta: SessionMeta = serde_json::from_slice(&data)
            .map_err(|e| err!(DataLoss, msg("bad metadata in {}", meta_path.display()), source(e)))?;
        Ok(WalSession {
            dir,
            file: None,
            meta,
        })
    }

    pub fn video_id(&self) -> i64 {
        self.meta.video_id
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one frame: header, metadata strings, pixels, fsync, then the
    /// sidecar rewrite. This happens before the encoder ever sees the
    /// frame; its latency is the recorder's storage-health signal, measured
    /// by the caller.
    pub fn append(&mut self, frame: &CapturedFrame) -> Result<(), Error> {
        let record = encode_record(frame)?;
        if self.file.is_none() {
            // A session re-opened by recovery is read-only by convention,
            // but re-appending (e.g. resuming a segment) is legal.
            self.file = Some(
                fs::OpenOptions::new()
                    .append(true)
                    .open(self.dir.join(FRAMES_FILE))
                    .map_err(|e| err!(e, msg("unable to reopen frames.bin in {}", self.dir.display())))?,
            );
        }
        let file = self.file.as_mut().expect("frames.bin just ensured open");
        file.write_all(&record)
            .map_err(|e| err!(Unavailable, msg("WAL append failed in {}", self.dir.display()), source(e)))?;
        file.sync_data()
            .map_err(|e| err!(Unavailable, msg("WAL fsync failed in {}", self.dir.display()), source(e)))?;
        if self.meta.frame_count == 0 {
            self.meta.width = frame.width;
            self.meta.height = frame.height;
        }
        self.meta.frame_count += 1;
        self.write_meta()
    }

    /// Atomically rewrites `metadata.json` (temp file + rename), so a crash
    /// mid-rewrite can't leave a torn sidecar.
    fn write_meta(&mut self) -> Result<(), Error> {
        let tmp = self.dir.join(".metadata.json.tmp");
        let data = serde_json::to_vec(&self.meta)?;
        {
            let mut f = fs::File::create(&tmp)
                .map_err(|e| err!(e, msg("unable to create {}", tmp.display())))?;
            f.write_all(&data)?;
            f.sync_data()?;
        }
        fs::rename(&tmp, self.dir.join(METADATA_FILE))
            .map_err(|e| err!(e, msg("unable to rename metadata in {}", self.dir.display())))?;
        Ok(())
    }

    /// Reads back all complete records. A short read at the tail (header or
    /// payload) ends the iteration cleanly; everything before it is kept.
    pub fn read_frames(&self) -> Result<Vec<CapturedFrame>, Error> {
        let path = self.dir.join(FRAMES_FILE);
        let mut data = Vec::new();
        fs::File::open(&path)
            .map_err(|e| err!(e, msg("unable to open {}", path.display())))?
            .read_to_end(&mut data)?;
        let mut frames = Vec::new();
        let mut pos = 0;
        loop {
            match decode_record(&data[pos..]) {
                Ok(Some((frame, len))) => {
                    frames.push(frame);
                    pos += len;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        session = %self.dir.display(),
                        offset = pos,
                        err = %e.chain(),
                        "dropping undecodable WAL tail"
                    );
                    break;
                }
            }
        }
        if pos < data.len() {
            debug!(
                session = %self.dir.display(),
                kept = frames.len(),
                truncated_bytes = data.len() - pos,
                "partial trailing WAL record dropped"
            );
        }
        Ok(frames)
    }

    /// Removes the session. Called only after the encoder has produced a
    /// playable MP4 *and* the database rows have been committed; until then
    /// this directory is the only durable copy of its frames.
    pub fn finalize(self) -> Result<(), Error> {
        fs::remove_dir_all(&self.dir)
            .map_err(|e| err!(e, msg("unable to remove WAL session {}", self.dir.display())))?;
        Ok(())
    }
}

/// Enumerates surviving sessions under the WAL root, in `videoId` order.
/// Entries that don't parse are skipped with a warning rather than failing
/// recovery wholesale.
pub fn list_active_sessions(wal_root: &Path) -> Result<Vec<WalSession>, Error> {
    let mut sessions = Vec::new();
    let entries = match fs::read_dir(wal_root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
        Err(e) => return Err(err!(e, msg("unable to list {}", wal_root.display()))),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(id) = name.strip_prefix(SESSION_PREFIX) else {
            continue;
        };
        if id.parse::<i64>().is_err() {
            warn!(entry = name, "ignoring non-session entry in WAL root");
            continue;
        }
        match WalSession::open(entry.path()) {
            Ok(s) => sessions.push(s),
            Err(e) => warn!(entry = name, err = %e.chain(), "skipping unreadable WAL session"),
        }
    }
    sessions.sort_by_key(|s| s.meta.video_id);
    Ok(sessions)
}

fn encode_record(frame: &CapturedFrame) -> Result<Vec<u8>, Error> {
    let m = &frame.metadata;
    let strs = [
        FrameMetadata::str_or_empty(&m.app_bundle_id),
        FrameMetadata::str_or_empty(&m.app_name),
        FrameMetadata::str_or_empty(&m.window_name),
        FrameMetadata::str_or_empty(&m.browser_url),
    ];
    for s in &strs {
        if s.len() > u16::MAX as usize {
            bail!(OutOfRange, msg("metadata string of {} bytes exceeds u16", s.len()));
        }
    }
    let mut header = [0u8; HEADER_LEN];
    LittleEndian::write_f64(&mut header[0..8], frame.timestamp.as_secs_f64());
    LittleEndian::write_u32(&mut header[8..12], frame.width);
    LittleEndian::write_u32(&mut header[12..16], frame.height);
    LittleEndian::write_u32(&mut header[16..20], frame.bytes_per_row);
    LittleEndian::write_u32(&mut header[20..24], frame.data.len() as u32);
    LittleEndian::write_u32(&mut header[24..28], m.display_id);
    for (i, s) in strs.iter().enumerate() {
        LittleEndian::write_u16(&mut header[28 + 2 * i..30 + 2 * i], s.len() as u16);
    }
    let strs_len: usize = strs.iter().map(|s| s.len()).sum();
    let mut out = Vec::with_capacity(HEADER_LEN + strs_len + frame.data.len());
    out.extend_from_slice(&header);
    for s in &strs {
        out.extend_from_slice(s.as_bytes());
    }
    out.extend_from_slice(&frame.data);
    Ok(out)
}

/// Decodes the record at the start of `data`. Returns `Ok(None)` on a clean
/// short read (truncated tail) and `Err` on a malformed record.
fn decode_record(data: &[u8]) -> Result<Option<(CapturedFrame, usize)>, Error> {
    if data.len() < HEADER_LEN {
        return Ok(None);
    }
    let timestamp = Time::from_secs_f64(LittleEndian::read_f64(&data[0..8]));
    let width = LittleEndian::read_u32(&data[8..12]);
    let height = LittleEndian::read_u32(&data[12..16]);
    let bytes_per_row = LittleEndian::read_u32(&data[16..20]);
    let data_size = LittleEndian::read_u32(&data[20..24]) as usize;
    let display_id = LittleEndian::read_u32(&data[24..28]);
    let mut str_lens = [0usize; 4];
    for (i, l) in str_lens.iter_mut().enumerate() {
        *l = LittleEndian::read_u16(&data[28 + 2 * i..30 + 2 * i]) as usize;
    }
    let total = HEADER_LEN + str_lens.iter().sum::<usize>() + data_size;
    if data.len() < total {
        return Ok(None);
    }
    let mut pos = HEADER_LEN;
    let mut strs: [Option<String>; 4] = [None, None, None, None];
    for (i, &len) in str_lens.iter().enumerate() {
        if len > 0 {
            let s = std::str::from_utf8(&data[pos..pos + len])
                .map_err(|e| err!(DataLoss, msg("metadata string {i} is not UTF-8"), source(e)))?;
            strs[i] = Some(s.to_owned());
        }
        pos += len;
    }
    let [app_bundle_id, app_name, window_name, browser_url] = strs;
    let frame = CapturedFrame {
        timestamp,
        width,
        height,
        bytes_per_row,
        data: data[pos..pos + data_size].to_vec(),
        metadata: FrameMetadata {
            app_bundle_id,
            app_name,
            window_name,
            browser_url,
            display_id,
            is_focused: true,
        },
    };
    Ok(Some((frame, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use base::strutil::hex;

    fn test_frame(t_ms: i64, width: u32, height: u32) -> CapturedFrame {
        let mut f = CapturedFrame::solid(Time(t_ms), width, height, [9, 8, 7, 255]);
        f.metadata = FrameMetadata {
            app_bundle_id: Some("com.example.editor".to_owned()),
            app_name: Some("Editor".to_owned()),
            window_name: Some("main.rs".to_owned()),
            browser_url: None,
            display_id: 2,
            is_focused: true,
        };
        f
    }

    /// Locks the 34-byte header's field order and endianness.
    #[test]
    fn golden_header() {
        let mut f = CapturedFrame::solid(Time(1_000), 2, 1, [0xaa, 0xbb, 0xcc, 0xdd]);
        f.metadata = FrameMetadata {
            app_bundle_id: Some("ab".to_owned()),
            app_name: None,
            window_name: Some("w".to_owned()),
            browser_url: None,
            display_id: 3,
            is_focused: true,
        };
        let record = encode_record(&f).unwrap();
        let expected_header = concat!(
            "000000000000f03f", // timestamp 1.0 s as little-endian f64
            "02000000",         // width 2
            "01000000",         // height 1
            "08000000",         // bytesPerRow 8
            "08000000",         // dataSize 8
            "03000000",         // displayID 3
            "0200",             // appBundleID length
            "0000",             // appName length
            "0100",             // windowName length
            "0000",             // browserURL length
        );
        assert_eq!(hex(&record[..HEADER_LEN]), expected_header);
        assert_eq!(&record[HEADER_LEN..HEADER_LEN + 3], b"abw");
        assert_eq!(record.len(), HEADER_LEN + 3 + 8);
    }

    #[test]
    fn round_trip() {
        testutil::init();
        let tmp = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        let mut s = WalSession::create(tmp.path(), 12, Time(5_000)).unwrap();
        let frames: Vec<CapturedFrame> = (0..3).map(|i| test_frame(5_000 + i * 2_000, 10, 10)).collect();
        for f in &frames {
            s.append(f).unwrap();
        }
        assert_eq!(s.meta().frame_count, 3);
        assert_eq!((s.meta().width, s.meta().height), (10, 10));

        // Simulate a crash: drop the handle, then rediscover the session.
        drop(s);
        let sessions = list_active_sessions(tmp.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.video_id(), 12);
        let read = s.read_frames().unwrap();
        assert_eq!(read.len(), 3);
        for (got, want) in read.iter().zip(&frames) {
            assert_eq!(got.timestamp, want.timestamp);
            assert_eq!(got.data, want.data);
            assert_eq!(got.metadata.app_bundle_id, want.metadata.app_bundle_id);
            assert_eq!(got.metadata.window_name, want.metadata.window_name);
            assert_eq!(got.metadata.display_id, 2);
        }
    }

    #[test]
    fn truncated_tail_is_dropped() {
        testutil::init();
        let tmp = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        let mut s = WalSession::create(tmp.path(), 1, Time(0)).unwrap();
        s.append(&test_frame(1_000, 4, 4)).unwrap();
        s.append(&test_frame(2_000, 4, 4)).unwrap();

        let frames_bin = s.dir().join("frames.bin");
        let full = fs::read(&frames_bin).unwrap();

        // Truncate mid-payload of the second record.
        fs::write(&frames_bin, &full[..full.len() - 10]).unwrap();
        let read = s.read_frames().unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].timestamp, Time(1_000));

        // Truncate mid-header of the second record.
        let first_len = full.len() / 2;
        fs::write(&frames_bin, &full[..first_len + 10]).unwrap();
        assert_eq!(s.read_frames().unwrap().len(), 1);

        // Empty file: zero frames, still not an error.
        fs::write(&frames_bin, b"").unwrap();
        assert_eq!(s.read_frames().unwrap().len(), 0);
    }

    #[test]
    fn finalize_removes_session() {
        testutil::init();
        let tmp = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        let s = WalSession::create(tmp.path(), 44, Time(0)).unwrap();
        assert_eq!(list_active_sessions(tmp.path()).unwrap().len(), 1);
        s.finalize().unwrap();
        assert!(list_active_sessions(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn foreign_entries_ignored() {
        testutil::init();
        let tmp = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        fs::create_dir(tmp.path().join("active_segment_notanumber")).unwrap();
        fs::write(tmp.path().join("stray.txt"), b"x").unwrap();
        WalSession::create(tmp.path(), 2, Time(0)).unwrap();
        let sessions = list_active_sessions(tmp.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].video_id(), 2);
    }
}
