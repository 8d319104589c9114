// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer exchange with the capture queue of a V4L2 video node.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;

use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::ioctl::IntoErrno;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::ioctl::V4l2PlanesWithBacking;
use v4l2r::ioctl::V4l2PlanesWithBackingMut;
use v4l2r::memory::MemoryType;
use v4l2r::QueueType;

use crate::mapping::MappedRegion;
use crate::poll::wait_readable;
use crate::poll::Readiness;

/// Description of a buffer exchanged with the kernel, rebuilt for every queue and dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBuffer {
    pub index: u32,
    pub queue: QueueType,
    pub memory: MemoryType,
    /// Backing dmabuf, for `MemoryType::DmaBuf` buffers only.
    pub fd: Option<RawFd>,
    pub length: u32,
    pub bytes_used: u32,
}

impl KernelBuffer {
    pub fn new(queue: QueueType, index: u32) -> Self {
        Self {
            index,
            queue,
            memory: MemoryType::Mmap,
            fd: None,
            length: 0,
            bytes_used: 0,
        }
    }
}

/// Format currently set on the capture queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeFormat {
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
    /// Size in bytes of the first plane of a buffer.
    pub size_image: u32,
}

/// The kernel buffer protocol of a capture queue.
pub trait CaptureQueue: Send {
    fn queue_type(&self) -> QueueType;
    fn format(&self) -> io::Result<NodeFormat>;
    /// Allocate `count` buffers, or free all of them if `count` is zero. Returns the number of
    /// buffers granted by the driver.
    fn request_buffers(&mut self, memory: MemoryType, count: u32) -> io::Result<u32>;
    /// Map the first plane of MMAP buffer `index`.
    fn map_buffer(&self, index: u32) -> io::Result<MappedRegion>;
    fn queue_buffer(&mut self, buffer: &KernelBuffer) -> io::Result<()>;
    fn dequeue_buffer(&mut self, memory: MemoryType) -> io::Result<KernelBuffer>;
    /// Block until a buffer can be dequeued or the queue signals an error.
    fn wait_ready(&self) -> io::Result<Readiness>;
}

fn errno_to_io<E: IntoErrno>(e: E) -> io::Error {
    io::Error::from_raw_os_error(e.into_errno())
}

/// Read the current format of `queue` on `fd`.
pub fn node_format<F: AsRawFd>(fd: &F, queue: QueueType) -> io::Result<NodeFormat> {
    let format: v4l2r::Format = v4l2r::ioctl::g_fmt(fd, queue).map_err(errno_to_io)?;

    Ok(NodeFormat {
        pixel_format: format.pixelformat.into(),
        width: format.width,
        height: format.height,
        size_image: format.plane_fmt.first().map(|p| p.sizeimage).unwrap_or(0),
    })
}

/// Capture queue of an opened V4L2 video node.
pub struct V4l2CaptureNode {
    file: File,
    queue: QueueType,
}

impl V4l2CaptureNode {
    pub fn new(file: File, queue: QueueType) -> Self {
        Self { file, queue }
    }
}

impl CaptureQueue for V4l2CaptureNode {
    fn queue_type(&self) -> QueueType {
        self.queue
    }

    fn format(&self) -> io::Result<NodeFormat> {
        node_format(&self.file, self.queue)
    }

    fn request_buffers(&mut self, memory: MemoryType, count: u32) -> io::Result<u32> {
        let reqbufs: v4l2_requestbuffers =
            v4l2r::ioctl::reqbufs(&self.file, self.queue, memory, count).map_err(errno_to_io)?;

        Ok(reqbufs.count)
    }

    fn map_buffer(&self, index: u32) -> io::Result<MappedRegion> {
        let buffer: V4l2Buffer =
            v4l2r::ioctl::querybuf(&self.file, self.queue, index as usize).map_err(errno_to_io)?;

        let (offset, length) = match buffer.planes_with_backing_iter() {
            V4l2PlanesWithBacking::Mmap(mut planes) => planes
                .next()
                .map(|plane| (plane.mem_offset(), *plane.length)),
            _ => None,
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("buffer {} has no MMAP plane", index),
            )
        })?;

        Ok(MappedRegion::new(&self.file, length as usize, offset as u64)?)
    }

    fn queue_buffer(&mut self, buffer: &KernelBuffer) -> io::Result<()> {
        let mut v4l2_buffer = V4l2Buffer::new(self.queue, buffer.index, buffer.memory);

        match v4l2_buffer.planes_with_backing_iter_mut() {
            V4l2PlanesWithBackingMut::DmaBuf(mut planes) => {
                let fd = buffer.fd.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "DMABUF buffer without fd")
                })?;
                if let Some(mut plane) = planes.next() {
                    plane.set_fd(fd);
                    *plane.length = buffer.length;
                }
            }
            V4l2PlanesWithBackingMut::Mmap(mut planes) => {
                if let Some(mut plane) = planes.next() {
                    *plane.length = buffer.length;
                }
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unsupported memory type",
                ))
            }
        }

        let _: V4l2Buffer = v4l2r::ioctl::qbuf(&self.file, v4l2_buffer).map_err(errno_to_io)?;

        Ok(())
    }

    fn dequeue_buffer(&mut self, memory: MemoryType) -> io::Result<KernelBuffer> {
        let v4l2_buffer: V4l2Buffer =
            v4l2r::ioctl::dqbuf(&self.file, self.queue).map_err(errno_to_io)?;
        let plane = v4l2_buffer.get_first_plane();

        Ok(KernelBuffer {
            index: v4l2_buffer.index(),
            queue: self.queue,
            memory,
            fd: None,
            length: *plane.length,
            bytes_used: *plane.bytesused,
        })
    }

    fn wait_ready(&self) -> io::Result<Readiness> {
        wait_readable(&self.file)
    }
}
