// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-camera synchronization mode.

use enumn::N;
use log::info;

use crate::controls::ControlError;
use crate::controls::Controls;

const SYNC_MODE_CONTROL: &str = "sync_mode";

/// Entries of the `sync_mode` menu control.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum SyncMode {
    Standalone = 0,
    Master = 1,
    Slave = 2,
}

pub struct Synchronization<'a> {
    controls: &'a Controls,
}

impl<'a> Synchronization<'a> {
    /// Set up synchronization control. The mode is reset to the driver default.
    pub fn new(controls: &'a Controls) -> Result<Self, ControlError> {
        for control in controls
            .iter()
            .filter(|c| c.name().starts_with(SYNC_MODE_CONTROL))
        {
            control.reset()?;
        }

        Ok(Self { controls })
    }

    pub fn set_mode(&self, mode: SyncMode) -> Result<(), ControlError> {
        self.controls
            .get(SYNC_MODE_CONTROL)?
            .set_menu(mode as u32)?;
        info!("sync mode set to {:?}", mode);

        Ok(())
    }

    pub fn set_mode_standalone(&self) -> Result<(), ControlError> {
        self.set_mode(SyncMode::Standalone)
    }

    pub fn set_mode_master(&self) -> Result<(), ControlError> {
        self.set_mode(SyncMode::Master)
    }

    pub fn set_mode_slave(&self) -> Result<(), ControlError> {
        self.set_mode(SyncMode::Slave)
    }

    pub fn mode(&self) -> Result<SyncMode, ControlError> {
        let value = self.controls.get(SYNC_MODE_CONTROL)?.get_int()?;

        u32::try_from(value)
            .ok()
            .and_then(SyncMode::n)
            .ok_or(ControlError::OutOfRange {
                name: SYNC_MODE_CONTROL.to_owned(),
                value,
                min: SyncMode::Standalone as i32,
                max: SyncMode::Slave as i32,
            })
    }
}
