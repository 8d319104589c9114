// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error taxonomy shared by every layer of the acquisition stack.

use std::io;

use thiserror::Error;

use crate::controls::ControlError;

#[derive(Debug, Error)]
pub enum Error {
    /// Opening, enumerating or querying a kernel node failed.
    #[error("{context}: {source}")]
    Connection {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("unsupported stream format: {0}")]
    UnsupportedFormat(String),
    /// The driver granted a different number of buffers than requested.
    #[error("requested {requested} buffers, driver granted {granted}")]
    ResourceExhaustion { requested: u32, granted: u32 },
    #[error("no {0} found in media graph")]
    NotFound(&'static str),
    /// A buffer queue/dequeue or readiness wait failed while streaming.
    #[error("{context}: {source}")]
    TransientIo {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    pub(crate) fn connection(context: impl Into<String>, source: io::Error) -> Self {
        Error::Connection {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn transient(context: impl Into<String>, source: io::Error) -> Self {
        Error::TransientIo {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
