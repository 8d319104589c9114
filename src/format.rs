// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Negotiation of the raw event stream format.

use std::fmt;

use log::debug;

use crate::controls::Controls;
use crate::error::Error;
use crate::error::Result;
use crate::subdev::Rect;

const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

pub const PIX_FMT_PSEE_EVT2: u32 = fourcc(b"PSEE");
pub const PIX_FMT_PSEE_EVT21ME: u32 = fourcc(b"PSE1");
pub const PIX_FMT_PSEE_EVT21: u32 = fourcc(b"PSE2");
pub const PIX_FMT_PSEE_EVT3: u32 = fourcc(b"PSE3");
pub const PIX_FMT_GREY: u32 = fourcc(b"GREY");

/// Name of the string control describing the encoding of generic `GREY` streams.
pub const EVT_FORMAT_CONTROL: &str = "evt_format";

/// Encodings of raw event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Evt2,
    Evt21,
    Evt3,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Evt2 => "EVT2",
            Encoding::Evt21 => "EVT21",
            Encoding::Evt3 => "EVT3",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "EVT2" => Some(Encoding::Evt2),
            "EVT21" => Some(Encoding::Evt21),
            "EVT3" => Some(Encoding::Evt3),
            _ => None,
        }
    }
}

/// Format of the event stream produced by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    encoding: Encoding,
    width: u32,
    height: u32,
    legacy_endianness: bool,
}

impl StreamFormat {
    pub fn new(encoding: Encoding, width: u32, height: u32) -> Self {
        Self {
            encoding,
            width,
            height,
            legacy_endianness: false,
        }
    }

    /// Mark the stream as using the legacy (middle-endian) EVT21 word layout.
    pub fn with_legacy_endianness(mut self) -> Self {
        self.legacy_endianness = true;
        self
    }

    /// Work out the stream format from what the kernel reports.
    ///
    /// `pixel_format`, `width` and `height` come from the video node format. The crop bounds of
    /// the sensor, when known, take precedence for the geometry. `controls` is only needed for
    /// `GREY` streams, whose encoding is described by the `evt_format` control.
    pub fn negotiate(
        pixel_format: u32,
        width: u32,
        height: u32,
        crop_bounds: Option<Rect>,
        controls: Option<&Controls>,
    ) -> Result<Self> {
        let (width, height) = match crop_bounds {
            Some(rect) => (rect.width, rect.height),
            None => (width, height),
        };

        let format = match pixel_format {
            PIX_FMT_PSEE_EVT2 => Self::new(Encoding::Evt2, width, height),
            PIX_FMT_PSEE_EVT21ME => {
                Self::new(Encoding::Evt21, width, height).with_legacy_endianness()
            }
            PIX_FMT_PSEE_EVT21 => Self::new(Encoding::Evt21, width, height),
            PIX_FMT_PSEE_EVT3 => Self::new(Encoding::Evt3, width, height),
            PIX_FMT_GREY => {
                let name = controls
                    .filter(|c| c.has(EVT_FORMAT_CONTROL))
                    .ok_or_else(|| {
                        Error::UnsupportedFormat(format!(
                            "GREY stream without a {} control",
                            EVT_FORMAT_CONTROL
                        ))
                    })?
                    .get(EVT_FORMAT_CONTROL)?
                    .get_str()?;

                match name.as_str() {
                    "EVT21ME" => {
                        Self::new(Encoding::Evt21, width, height).with_legacy_endianness()
                    }
                    name => Encoding::from_name(name)
                        .map(|encoding| Self::new(encoding, width, height))
                        .ok_or_else(|| {
                            Error::UnsupportedFormat(format!(
                                "unknown {} value {:?}",
                                EVT_FORMAT_CONTROL, name
                            ))
                        })?,
                }
            }
            other => {
                return Err(Error::UnsupportedFormat(format!(
                    "pixel format {}",
                    fourcc_str(other)
                )))
            }
        };
        debug!("negotiated stream format {}", format);

        Ok(format)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_legacy_endianness(&self) -> bool {
        self.legacy_endianness
    }
}

/// Renders as the encoding name followed by `key=value` options in key order, e.g.
/// `EVT21;endianness=legacy;height=720;width=1280`.
impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding.name())?;
        if self.legacy_endianness {
            f.write_str(";endianness=legacy")?;
        }
        write!(f, ";height={};width={}", self.height, self.width)
    }
}

fn fourcc_str(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .map(|&c| {
            if c.is_ascii_graphic() {
                c as char
            } else {
                '?'
            }
        })
        .collect()
}
