// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Lookback's persistence layer: the encrypted SQLite index, the on-disk
//! segment/WAL layout, the segment writer, and startup recovery.

pub mod check;
mod compare;
pub mod db;
pub mod dir;
pub mod encoder;
pub mod frame;
pub mod fts;
mod raw;
pub mod recovery;
pub mod search;
pub mod testutil;
pub mod upgrade;
pub mod wal;
pub mod writer;

pub use crate::db::*;
pub use crate::frame::{CapturedFrame, FrameMetadata};
