// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Selection rectangles of the sensor subdevice.

use std::io;
use std::os::fd::AsRawFd;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// `V4L2_SUBDEV_FORMAT_ACTIVE`
const SUBDEV_FORMAT_ACTIVE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Mirror of `struct v4l2_subdev_selection`.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct SubdevSelection {
    which: u32,
    pad: u32,
    target: u32,
    flags: u32,
    r: Rect,
    stream: u32,
    reserved: [u32; 7],
}

nix::ioctl_readwrite!(vidioc_subdev_g_selection, b'V', 61, SubdevSelection);
nix::ioctl_readwrite!(vidioc_subdev_s_selection, b'V', 62, SubdevSelection);

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTarget {
    Crop = 0x0000,
    CropDefault = 0x0001,
    CropBounds = 0x0002,
    NativeSize = 0x0003,
}

fn selection(target: SelectionTarget) -> SubdevSelection {
    SubdevSelection {
        which: SUBDEV_FORMAT_ACTIVE,
        target: target as u32,
        ..SubdevSelection::new_zeroed()
    }
}

/// Read the active `target` rectangle of pad 0 of `subdev`.
pub fn get_selection<F: AsRawFd>(subdev: &F, target: SelectionTarget) -> io::Result<Rect> {
    let mut sel = selection(target);

    // SAFETY: `sel` is a valid `v4l2_subdev_selection` that lives for the duration of the call.
    unsafe { vidioc_subdev_g_selection(subdev.as_raw_fd(), &mut sel) }?;

    Ok(sel.r)
}

/// Set the active `target` rectangle of pad 0 of `subdev`, returning the rectangle the driver
/// actually applied.
pub fn set_selection<F: AsRawFd>(
    subdev: &F,
    target: SelectionTarget,
    rect: Rect,
) -> io::Result<Rect> {
    let mut sel = SubdevSelection {
        r: rect,
        ..selection(target)
    };

    // SAFETY: `sel` is a valid `v4l2_subdev_selection` that lives for the duration of the call.
    unsafe { vidioc_subdev_s_selection(subdev.as_raw_fd(), &mut sel) }?;

    Ok(sel.r)
}
