// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Registry of the V4L2 controls exposed by the sensor subdevice.
//!
//! Controls are enumerated once and looked up by name afterwards. Values are always read from and
//! written to the device, nothing is cached besides the static control description.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;

use enumn::N;
use log::debug;
use log::info;
use thiserror::Error;
use v4l2r::bindings::v4l2_ext_control;
use v4l2r::bindings::v4l2_queryctrl;
use v4l2r::ioctl::CtrlWhich;
use v4l2r::ioctl::IntoErrno;

/// `V4L2_CTRL_FLAG_NEXT_CTRL`
const CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;
/// `V4L2_CTRL_FLAG_DISABLED`
const CTRL_FLAG_DISABLED: u32 = 0x0001;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no control named {0:?}")]
    NotFound(String),
    #[error("control {name:?} is not a {expected} control")]
    WrongType {
        name: String,
        expected: &'static str,
    },
    #[error("value {value} of control {name:?} outside of [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error("failed to access control {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
pub enum ControlType {
    Integer = 1,
    Boolean = 2,
    Menu = 3,
    Button = 4,
    Integer64 = 5,
    CtrlClass = 6,
    String = 7,
    Bitmask = 8,
    IntegerMenu = 9,
}

/// Static description of a control, as returned by `VIDIOC_QUERYCTRL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub kind: ControlType,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
}

impl ControlInfo {
    fn from_queryctrl(q: &v4l2_queryctrl) -> Option<Self> {
        let len = q.name.iter().position(|&c| c == 0).unwrap_or(q.name.len());
        let name = String::from_utf8_lossy(&q.name[..len]).into_owned();

        Some(Self {
            id: q.id,
            kind: ControlType::n(q.type_)?,
            name,
            minimum: q.minimum,
            maximum: q.maximum,
            step: q.step,
            default_value: q.default_value,
            flags: q.flags,
        })
    }
}

/// Access to the controls of a device.
pub trait ControlDevice: Send {
    /// Returns the description of the first control with an id greater than `after`, or `None`
    /// once all the controls have been listed.
    fn query_next(&self, after: u32) -> io::Result<Option<v4l2_queryctrl>>;
    fn get_value(&self, id: u32) -> io::Result<i32>;
    /// Write `value` and return the value actually applied by the driver.
    fn set_value(&self, id: u32, value: i32) -> io::Result<i32>;
    /// Read a string control whose value holds at most `max_len` characters.
    fn get_string(&self, id: u32, max_len: usize) -> io::Result<String>;
}

/// Controls of a subdevice node, accessed through V4L2 ioctls.
pub struct SubdevControlDevice {
    file: File,
}

impl SubdevControlDevice {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl ControlDevice for SubdevControlDevice {
    fn query_next(&self, after: u32) -> io::Result<Option<v4l2_queryctrl>> {
        let (id, flags) = v4l2r::ioctl::parse_ctrl_id_and_flags(after | CTRL_FLAG_NEXT_CTRL);

        match v4l2r::ioctl::queryctrl(&self.file, id, flags) {
            Ok(q) => Ok(Some(q)),
            Err(e) => match e.into_errno() {
                libc::EINVAL => Ok(None),
                errno => Err(io::Error::from_raw_os_error(errno)),
            },
        }
    }

    fn get_value(&self, id: u32) -> io::Result<i32> {
        v4l2r::ioctl::g_ctrl(&self.file, id)
            .map_err(|e| io::Error::from_raw_os_error(e.into_errno()))
    }

    fn set_value(&self, id: u32, value: i32) -> io::Result<i32> {
        v4l2r::ioctl::s_ctrl(&self.file, id, value)
            .map_err(|e| io::Error::from_raw_os_error(e.into_errno()))
    }

    fn get_string(&self, id: u32, max_len: usize) -> io::Result<String> {
        let mut payload = vec![0u8; max_len + 1];

        // SAFETY: `v4l2_ext_control` is a plain C struct for which all-zeroes is a valid value.
        let mut ctrl: v4l2_ext_control = unsafe { std::mem::zeroed() };
        ctrl.id = id;
        ctrl.size = payload.len() as u32;
        ctrl.__bindgen_anon_1.ptr = payload.as_mut_ptr() as *mut libc::c_void;

        v4l2r::ioctl::g_ext_ctrls(
            &self.file,
            CtrlWhich::Current,
            std::slice::from_mut(&mut ctrl),
        )
        .map_err(|e| io::Error::from_raw_os_error(e.into_errno()))?;

        let len = payload.iter().position(|&c| c == 0).unwrap_or(max_len);
        payload.truncate(len);
        String::from_utf8(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// All the usable controls of a device, indexed by name.
pub struct Controls {
    device: Box<dyn ControlDevice>,
    infos: BTreeMap<String, ControlInfo>,
}

impl Controls {
    /// List every control of `device`. Disabled controls and control classes are left out.
    pub fn enumerate<D: ControlDevice + 'static>(device: D) -> io::Result<Self> {
        let mut infos = BTreeMap::new();
        let mut last_id = 0;

        while let Some(q) = device.query_next(last_id)? {
            if q.id <= last_id {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("control id 0x{:x} follows 0x{:x}", q.id, last_id),
                ));
            }
            last_id = q.id;

            if q.flags & CTRL_FLAG_DISABLED != 0 {
                continue;
            }
            match ControlInfo::from_queryctrl(&q) {
                Some(info) if info.kind != ControlType::CtrlClass => {
                    debug!("found control {:?} (0x{:x})", info.name, info.id);
                    infos.insert(info.name.clone(), info);
                }
                Some(_) => (),
                None => debug!("skipping control 0x{:x} of unknown type {}", q.id, q.type_),
            }
        }

        Ok(Self {
            device: Box::new(device),
            infos,
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.infos.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Control<'_>, ControlError> {
        self.infos
            .get(name)
            .map(|info| Control {
                device: self.device.as_ref(),
                info,
            })
            .ok_or_else(|| ControlError::NotFound(name.to_owned()))
    }

    /// Iterate over all controls, in name order.
    pub fn iter(&self) -> impl Iterator<Item = Control<'_>> {
        self.infos.values().map(|info| Control {
            device: self.device.as_ref(),
            info,
        })
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// A handle to one control of a `Controls` registry.
pub struct Control<'a> {
    device: &'a dyn ControlDevice,
    info: &'a ControlInfo,
}

impl<'a> Control<'a> {
    pub fn info(&self) -> &'a ControlInfo {
        self.info
    }

    pub fn name(&self) -> &'a str {
        &self.info.name
    }

    fn io_error(&self, source: io::Error) -> ControlError {
        ControlError::Io {
            name: self.info.name.clone(),
            source,
        }
    }

    fn expect_kind(&self, kinds: &[ControlType], expected: &'static str) -> Result<(), ControlError> {
        if kinds.contains(&self.info.kind) {
            Ok(())
        } else {
            Err(ControlError::WrongType {
                name: self.info.name.clone(),
                expected,
            })
        }
    }

    pub fn get_int(&self) -> Result<i32, ControlError> {
        self.expect_kind(
            &[
                ControlType::Integer,
                ControlType::Boolean,
                ControlType::Menu,
                ControlType::IntegerMenu,
                ControlType::Bitmask,
            ],
            "integer",
        )?;
        self.device
            .get_value(self.info.id)
            .map_err(|e| self.io_error(e))
    }

    pub fn set_int(&self, value: i32) -> Result<i32, ControlError> {
        self.expect_kind(
            &[
                ControlType::Integer,
                ControlType::Boolean,
                ControlType::Bitmask,
                ControlType::Button,
            ],
            "integer",
        )?;
        let applied = self
            .device
            .set_value(self.info.id, value)
            .map_err(|e| self.io_error(e))?;
        info!("control {:?} set to {}", self.info.name, applied);

        Ok(applied)
    }

    /// Select entry `index` of a menu control.
    pub fn set_menu(&self, index: u32) -> Result<(), ControlError> {
        self.expect_kind(&[ControlType::Menu, ControlType::IntegerMenu], "menu")?;
        let value = i32::try_from(index)
            .ok()
            .filter(|v| (self.info.minimum..=self.info.maximum).contains(v))
            .ok_or(ControlError::OutOfRange {
                name: self.info.name.clone(),
                value: index as i32,
                min: self.info.minimum,
                max: self.info.maximum,
            })?;
        self.device
            .set_value(self.info.id, value)
            .map_err(|e| self.io_error(e))?;
        info!("control {:?} set to menu entry {}", self.info.name, index);

        Ok(())
    }

    pub fn get_str(&self) -> Result<String, ControlError> {
        self.expect_kind(&[ControlType::String], "string")?;
        let max_len = usize::try_from(self.info.maximum).unwrap_or(0);
        self.device
            .get_string(self.info.id, max_len)
            .map_err(|e| self.io_error(e))
    }

    /// Write the default value of the control back to the device.
    pub fn reset(&self) -> Result<(), ControlError> {
        self.device
            .set_value(self.info.id, self.info.default_value)
            .map_err(|e| self.io_error(e))?;
        debug!(
            "control {:?} reset to {}",
            self.info.name, self.info.default_value
        );

        Ok(())
    }
}
