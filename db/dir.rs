// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Storage root management.
//!
//! One root directory holds everything Lookback persists outside the index
//! database:
//!
//! ```text
//! {root}/segments/YYYY/MM/DD/segment_{id}   encoded videos (no extension)
//! {root}/wal/active_segment_{videoId}/      in-progress WAL sessions
//! {root}/temp/                              transient files
//! {root}/models/                            assets owned by external tools
//! ```
//!
//! Database rows store paths relative to the root, so the whole tree can be
//! relocated. The root is flock()ed for the lifetime of a writing process.

use base::time::Time;
use base::{bail, err, Error};
use nix::fcntl::FlockArg;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const SEGMENTS_SUBDIR: &str = "segments";
pub const WAL_SUBDIR: &str = "wal";
pub const TEMP_SUBDIR: &str = "temp";
pub const MODELS_SUBDIR: &str = "models";

/// A file descriptor associated with a directory.
#[derive(Debug)]
pub struct Fd(std::os::unix::io::RawFd);

impl std::os::unix::io::AsRawFd for Fd {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Err(err) = nix::unistd::close(self.0) {
            warn!(%err, "unable to close storage dir");
        }
    }
}

impl Fd {
    /// Opens the given path as a directory.
    pub fn open(path: &Path, mkdir: bool) -> Result<Fd, nix::Error> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;
        if mkdir {
            match nix::unistd::mkdir(path, Mode::S_IRWXU) {
                Ok(()) | Err(nix::Error::EEXIST) => {}
                Err(e) => return Err(e),
            }
        }
        nix::fcntl::open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty()).map(Fd)
    }

    /// Locks the directory with the specified `flock` operation.
    pub fn lock(&self, arg: FlockArg) -> Result<(), nix::Error> {
        nix::fcntl::flock(self.0, arg)
    }

    /// `fsync`s this directory, committing file metadata (creations,
    /// renames, unlinks) to permanent storage.
    pub fn sync(&self) -> Result<(), nix::Error> {
        nix::unistd::fsync(self.0)
    }
}

/// The open, locked storage root.
#[derive(Debug)]
pub struct StorageDir {
    root: PathBuf,

    /// Holds the flock for the process lifetime.
    _fd: Fd,
}

impl StorageDir {
    /// Opens the storage root with a shared lock, for read-only commands
    /// that may run alongside `lookback run`.
    pub fn open_shared(root: &Path) -> Result<StorageDir, Error> {
        Self::open_with(root, false, FlockArg::LockSharedNonblock)
    }

    /// Opens the storage root, creating the subdirectory layout if `create`,
    /// and takes an exclusive lock. A second writing process fails here
    /// rather than corrupting the WAL.
    pub fn open(root: &Path, create: bool) -> Result<StorageDir, Error> {
        Self::open_with(root, create, FlockArg::LockExclusiveNonblock)
    }

    fn open_with(root: &Path, create: bool, lock: FlockArg) -> Result<StorageDir, Error> {
        if create {
            for sub in [SEGMENTS_SUBDIR, WAL_SUBDIR, TEMP_SUBDIR, MODELS_SUBDIR] {
                fs::create_dir_all(root.join(sub)).map_err(|e| {
                    err!(e, msg("unable to create {} under {}", sub, root.display()))
                })?;
            }
        }
        let fd = Fd::open(root, create)
            .map_err(|e| err!(Unavailable, msg("unable to open storage root {}", root.display()), source(e)))?;
        fd.lock(lock).map_err(|e| {
            err!(
                Unavailable,
                msg(
                    "unable to lock storage root {}; is another lookback process running?",
                    root.display()
                ),
                source(e)
            )
        })?;
        for sub in [SEGMENTS_SUBDIR, WAL_SUBDIR] {
            if !root.join(sub).is_dir() {
                bail!(
                    FailedPrecondition,
                    msg(
                        "storage root {} has no {}/ directory; try `lookback init`",
                        root.display(),
                        sub
                    ),
                );
            }
        }
        Ok(StorageDir {
            root: root.to_owned(),
            _fd: fd,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wal_root(&self) -> PathBuf {
        self.root.join(WAL_SUBDIR)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join(TEMP_SUBDIR)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_SUBDIR)
    }

    /// The database-persisted path of a segment: relative to the root,
    /// bucketed by the (UTC) date of the segment's first frame, no file
    /// extension. The container type is implicit; the database is the
    /// secret.
    pub fn segment_relpath(video_id: i64, start: Time) -> Result<String, Error> {
        let ts = jiff::Timestamp::from_millisecond(start.0)
            .map_err(|e| err!(OutOfRange, msg("bad segment start time {}", start.0), source(e)))?;
        let date = ts.to_zoned(jiff::tz::TimeZone::UTC).date();
        Ok(format!(
            "{}/{:04}/{:02}/{:02}/segment_{}",
            SEGMENTS_SUBDIR,
            date.year(),
            date.month(),
            date.day(),
            video_id
        ))
    }

    /// Absolute path for a database-relative one.
    pub fn full_path(&self, relpath: &str) -> PathBuf {
        self.root.join(relpath)
    }

    /// Resolves a segment's path, creating the date-bucket directories.
    pub fn prepare_segment_path(&self, video_id: i64, start: Time) -> Result<(String, PathBuf), Error> {
        let rel = Self::segment_relpath(video_id, start)?;
        let full = self.full_path(&rel);
        let parent = full.parent().expect("segment path has a parent");
        fs::create_dir_all(parent)
            .map_err(|e| err!(e, msg("unable to create {}", parent.display())))?;
        Ok((rel, full))
    }

    /// Syncs the directory containing `path`, making a rename or unlink of
    /// it durable.
    pub fn sync_parent(&self, path: &Path) -> Result<(), Error> {
        let parent = path.parent().expect("path has a parent");
        let fd = Fd::open(parent, false)
            .map_err(|e| err!(Unavailable, msg("unable to open {}", parent.display()), source(e)))?;
        fd.sync()
            .map_err(|e| err!(Unavailable, msg("unable to sync {}", parent.display()), source(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn relpath_buckets_by_utc_date() {
        // 2025-01-01T00:00:00Z.
        let t = Time(1_735_689_600_000);
        assert_eq!(
            StorageDir::segment_relpath(7, t).unwrap(),
            "segments/2025/01/01/segment_7"
        );
        // One millisecond before midnight lands in the previous bucket.
        assert_eq!(
            StorageDir::segment_relpath(7, Time(t.0 - 1)).unwrap(),
            "segments/2024/12/31/segment_7"
        );
    }

    #[test]
    fn open_requires_layout() {
        testutil::init();
        let tmp = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        let empty = tmp.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        StorageDir::open(&empty, false).unwrap_err();
        let dir = StorageDir::open(&empty, true).unwrap();
        assert!(dir.wal_root().is_dir());
        let (rel, full) = dir.prepare_segment_path(3, Time(1_735_689_600_000)).unwrap();
        assert!(full.parent().unwrap().is_dir());
        assert_eq!(dir.full_path(&rel), full);
    }

    #[test]
    fn second_opener_is_locked_out() {
        testutil::init();
        let tmp = tempfile::Builder::new()
            .prefix("lookback-test")
            .tempdir()
            .unwrap();
        let _first = StorageDir::open(tmp.path(), true).unwrap();
        let e = StorageDir::open(tmp.path(), false).unwrap_err();
        assert!(e.to_string().contains("unable to lock"), "got {e}");
    }
}
