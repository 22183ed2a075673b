// This file is part of Lookback, a continuous screen activity recorder.
// Copyright (C) 2025 The Lookback Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! In-flight frame types shared by the capture pipeline, the write-ahead
//! log, and recovery.

use base::time::Time;

/// Metadata stamped onto a frame at enrichment time and carried through the
/// WAL into recovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    pub app_bundle_id: Option<String>,
    pub app_name: Option<String>,
    pub window_name: Option<String>,
    pub browser_url: Option<String>,

    /// 0 means legacy / unknown.
    pub display_id: u32,

    pub is_focused: bool,
}

impl FrameMetadata {
    pub fn str_or_empty(s: &Option<String>) -> &str {
        s.as_deref().unwrap_or("")
    }
}

/// An uncompressed BGRA frame, row-padded to `bytes_per_row`.
///
/// Created by the capture backend, consumed by the segment writer; never
/// stored in the database in this form.
#[derive(Clone, PartialEq)]
pub struct CapturedFrame {
    pub timestamp: Time,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
    pub data: Vec<u8>,
    pub metadata: FrameMetadata,
}

impl CapturedFrame {
    /// A solid-color frame, packed rows. Handy for tests and the synthetic
    /// capture backend.
    pub fn solid(timestamp: Time, width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&bgra);
        }
        CapturedFrame {
            timestamp,
            width,
            height,
            bytes_per_row: width * 4,
            data,
            metadata: FrameMetadata::default(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Pixel bytes with row padding stripped, suitable for a packed-raw
    /// video pipe. Borrows when the rows are already packed.
    pub fn packed_rows(&self) -> std::borrow::Cow<'_, [u8]> {
        let packed_row = (self.width * 4) as usize;
        if self.bytes_per_row as usize == packed_row {
            return std::borrow::Cow::Borrowed(&self.data);
        }
        let mut out = Vec::with_capacity(packed_row * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * self.bytes_per_row as usize;
            out.extend_from_slice(&self.data[start..start + packed_row]);
        }
        std::borrow::Cow::Owned(out)
    }
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes_per_row", &self.bytes_per_row)
            .field("data_len", &self.data.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_rows_strips_padding() {
        let mut f = CapturedFrame::solid(Time(0), 2, 2, [1, 2, 3, 4]);
        assert!(matches!(f.packed_rows(), std::borrow::Cow::Borrowed(_)));

        // Re-pad each row to 12 bytes.
        let mut padded = Vec::new();
        for row in f.data.chunks(8) {
            padded.extend_from_slice(row);
            padded.extend_from_slice(&[0xee; 4]);
        }
        f.bytes_per_row = 12;
        f.data = padded;
        let packed = f.packed_rows();
        assert_eq!(packed.len(), 16);
        assert!(!packed.contains(&0xee));
    }
}
