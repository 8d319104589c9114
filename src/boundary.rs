// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Payload length inference for drivers that do not report a reliable `bytesused`.
//!
//! Such drivers close each transfer with a marker word in the event stream. The payload ends at
//! the first marker.

use crate::format::Encoding;

const EVT3_MARKER: u16 = 0xe019;
const EVT2_MARKER_MASK: u64 = 0xe000_00ff_0000_0000;
const EVT2_MARKER: u64 = 0xe000_0019_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryMarker {
    /// 16-bit EVT3 word.
    Evt3,
    /// 64-bit word shared by EVT2 and EVT2.1, matched under a mask.
    Evt2,
}

impl BoundaryMarker {
    pub fn for_encoding(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Evt3 => BoundaryMarker::Evt3,
            Encoding::Evt2 | Encoding::Evt21 => BoundaryMarker::Evt2,
        }
    }

    /// Byte offset of the first marker within the first `reported` bytes of `data`, or
    /// `reported` (clamped to the size of `data`) if there is none.
    pub fn infer_length(&self, data: &[u8], reported: usize) -> usize {
        let data = &data[..reported.min(data.len())];

        let found = match self {
            BoundaryMarker::Evt3 => data
                .chunks_exact(2)
                .position(|w| u16::from_le_bytes([w[0], w[1]]) == EVT3_MARKER)
                .map(|i| i * 2),
            BoundaryMarker::Evt2 => data
                .chunks_exact(8)
                .position(|w| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(w);
                    u64::from_le_bytes(word) & EVT2_MARKER_MASK == EVT2_MARKER
                })
                .map(|i| i * 8),
        };

        found.unwrap_or(data.len())
    }
}
