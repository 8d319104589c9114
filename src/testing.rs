// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory stand-ins for the kernel interfaces, used by unit tests.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use v4l2r::bindings::v4l2_queryctrl;
use v4l2r::memory::MemoryType;
use v4l2r::QueueType;

use crate::controls::ControlDevice;
use crate::controls::ControlType;
use crate::dma_heap::BufferHeap;
use crate::format::PIX_FMT_PSEE_EVT3;
use crate::mapping::MappedRegion;
use crate::poll::Readiness;
use crate::queue::CaptureQueue;
use crate::queue::KernelBuffer;
use crate::queue::NodeFormat;

fn memfd(len: usize) -> File {
    let file = File::from(memfd_create(c"", MemFdCreateFlag::empty()).unwrap());
    file.set_len(len as u64).unwrap();
    file
}

/// Payload written by the fake driver into the next dequeued buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub bytes_used: u32,
}

impl Frame {
    pub fn filled(byte: u8, len: usize) -> Self {
        Self {
            payload: vec![byte; len],
            bytes_used: len as u32,
        }
    }
}

#[derive(Default)]
pub struct FakeQueueState {
    pub format: Option<NodeFormat>,
    /// Number of buffers granted regardless of the request, if set.
    pub grant: Option<u32>,
    /// Number of buffers currently allocated.
    pub allocated: u32,
    pub mmap_buffers: Vec<File>,
    /// Buffers owned by the driver, in queue order.
    pub queued: VecDeque<KernelBuffer>,
    pub frames: VecDeque<Frame>,
    /// Every QBUF, in order.
    pub queue_log: Vec<KernelBuffer>,
    /// Raised once all frames have been dequeued.
    pub stop: Option<Arc<AtomicBool>>,
    /// errno returned by the next waits, dequeues and queues, if set.
    pub fail_wait: Option<i32>,
    pub fail_dequeue: Option<i32>,
    pub fail_queue: Option<i32>,
}

/// A capture queue that hands out scripted frames.
#[derive(Clone)]
pub struct FakeQueue {
    pub state: Arc<Mutex<FakeQueueState>>,
}

impl FakeQueue {
    pub fn new(size_image: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeQueueState {
                format: Some(NodeFormat {
                    pixel_format: PIX_FMT_PSEE_EVT3,
                    width: 1280,
                    height: 720,
                    size_image,
                }),
                ..Default::default()
            })),
        }
    }

    pub fn with_grant(self, grant: u32) -> Self {
        self.state.lock().unwrap().grant = Some(grant);
        self
    }

    pub fn push_frame(&self, frame: Frame) {
        self.state.lock().unwrap().frames.push_back(frame);
    }

    /// Raise `stop` when the scripted frames are exhausted.
    pub fn stop_when_done(&self, stop: Arc<AtomicBool>) {
        self.state.lock().unwrap().stop = Some(stop);
    }

    /// Return every queued buffer, as STREAMOFF does.
    pub fn stream_off(&self) {
        self.state.lock().unwrap().queued.clear();
    }

    pub fn allocated(&self) -> u32 {
        self.state.lock().unwrap().allocated
    }

    pub fn queued_indexes(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state.queued.iter().map(|b| b.index).collect()
    }

    pub fn queue_log(&self) -> Vec<KernelBuffer> {
        self.state.lock().unwrap().queue_log.clone()
    }
}

impl CaptureQueue for FakeQueue {
    fn queue_type(&self) -> QueueType {
        QueueType::VideoCaptureMplane
    }

    fn format(&self) -> io::Result<NodeFormat> {
        self.state
            .lock()
            .unwrap()
            .format
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn request_buffers(&mut self, memory: MemoryType, count: u32) -> io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.queued.clear();
        state.mmap_buffers.clear();

        let granted = if count == 0 {
            0
        } else {
            state.grant.unwrap_or(count)
        };
        if memory == MemoryType::Mmap {
            let size = state.format.map(|f| f.size_image).unwrap_or(0) as usize;
            state.mmap_buffers = (0..granted).map(|_| memfd(size.max(1))).collect();
        }
        state.allocated = granted;

        Ok(granted)
    }

    fn map_buffer(&self, index: u32) -> io::Result<MappedRegion> {
        let state = self.state.lock().unwrap();
        let file = state
            .mmap_buffers
            .get(index as usize)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let size = state.format.map(|f| f.size_image).unwrap_or(0) as usize;

        Ok(MappedRegion::new(file, size, 0)?)
    }

    fn queue_buffer(&mut self, buffer: &KernelBuffer) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.fail_queue {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if buffer.index >= state.allocated || state.queued.iter().any(|b| b.index == buffer.index)
        {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.queued.push_back(buffer.clone());
        state.queue_log.push(buffer.clone());

        Ok(())
    }

    fn dequeue_buffer(&mut self, memory: MemoryType) -> io::Result<KernelBuffer> {
        let mut state = self.state.lock().unwrap();
        if let Some(errno) = state.fail_dequeue {
            return Err(io::Error::from_raw_os_error(errno));
        }
        // No buffer is consumed when there is nothing to dequeue.
        if state.frames.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        let mut buffer = state
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?;
        let frame = state
            .frames
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?;

        match (memory, buffer.fd) {
            (MemoryType::DmaBuf, Some(fd)) => {
                // SAFETY: the dmabuf is kept open by its owner while it is queued.
                let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
                file.write_all_at(&frame.payload, 0)?;
            }
            _ => {
                state.mmap_buffers[buffer.index as usize].write_all_at(&frame.payload, 0)?;
            }
        }
        buffer.memory = memory;
        buffer.bytes_used = frame.bytes_used;

        Ok(buffer)
    }

    fn wait_ready(&self) -> io::Result<Readiness> {
        let state = self.state.lock().unwrap();
        if let Some(errno) = state.fail_wait {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if state.frames.is_empty() {
            if let Some(stop) = &state.stop {
                stop.store(true, Ordering::Release);
            }
            return Ok(Readiness::Error);
        }
        if state.queued.is_empty() {
            return Ok(Readiness::Error);
        }

        Ok(Readiness::Readable)
    }
}

#[derive(Default)]
struct HeapState {
    allocated: usize,
    begins: usize,
    ends: usize,
}

/// A DMA heap handing out memfds.
#[derive(Clone, Default)]
pub struct FakeHeap {
    state: Arc<Mutex<HeapState>>,
}

impl FakeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated(&self) -> usize {
        self.state.lock().unwrap().allocated
    }

    /// Number of (begin, end) CPU access synchronizations.
    pub fn syncs(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.begins, state.ends)
    }
}

impl BufferHeap for FakeHeap {
    fn allocate(&self, len: usize) -> io::Result<OwnedFd> {
        self.state.lock().unwrap().allocated += 1;
        Ok(memfd(len).into())
    }

    fn begin_cpu_access(&self, _dmabuf: BorrowedFd<'_>) -> io::Result<()> {
        self.state.lock().unwrap().begins += 1;
        Ok(())
    }

    fn end_cpu_access(&self, _dmabuf: BorrowedFd<'_>) -> io::Result<()> {
        self.state.lock().unwrap().ends += 1;
        Ok(())
    }
}

struct FakeControl {
    query: v4l2_queryctrl,
    value: i32,
    string: Option<String>,
}

/// A control device backed by a list of controls.
#[derive(Clone, Default)]
pub struct FakeControls {
    controls: Arc<Mutex<Vec<FakeControl>>>,
    writes: Arc<Mutex<Vec<(String, i32)>>>,
}

impl FakeControls {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, id: Option<u32>, name: &str, kind: ControlType, f: impl FnOnce(&mut v4l2_queryctrl)) -> Self {
        {
            let mut controls = self.controls.lock().unwrap();
            // SAFETY: `v4l2_queryctrl` is a plain C struct.
            let mut query: v4l2_queryctrl = unsafe { std::mem::zeroed() };
            query.id = id.unwrap_or(0x00a3_0001 + controls.len() as u32);
            query.type_ = kind as u32;
            query.name[..name.len()].copy_from_slice(name.as_bytes());
            f(&mut query);
            controls.push(FakeControl {
                value: query.default_value,
                query,
                string: None,
            });
        }
        self
    }

    pub fn with_int(self, name: &str, minimum: i32, maximum: i32, default: i32) -> Self {
        self.push(None, name, ControlType::Integer, |q| {
            q.minimum = minimum;
            q.maximum = maximum;
            q.step = 1;
            q.default_value = default;
        })
    }

    pub fn with_menu(self, name: &str, maximum: i32) -> Self {
        self.push(None, name, ControlType::Menu, |q| {
            q.maximum = maximum;
            q.step = 1;
        })
    }

    pub fn with_string(self, name: &str, value: &str) -> Self {
        let this = self.push(None, name, ControlType::String, |q| {
            q.maximum = 32;
            q.step = 1;
        });
        if let Some(control) = this.controls.lock().unwrap().last_mut() {
            control.string = Some(value.to_owned());
        }
        this
    }

    pub fn with_class(self, id: u32) -> Self {
        self.push(Some(id), "Sensor Controls", ControlType::CtrlClass, |_| ())
    }

    pub fn with_disabled(self, name: &str) -> Self {
        self.push(None, name, ControlType::Integer, |q| q.flags = 0x0001)
    }

    pub fn value(&self, name: &str) -> i32 {
        let controls = self.controls.lock().unwrap();
        controls
            .iter()
            .find(|c| c.query.name.starts_with(name.as_bytes()) && c.query.name[name.len()] == 0)
            .map(|c| c.value)
            .unwrap()
    }

    /// Every value written, in order.
    pub fn writes(&self) -> Vec<(String, i32)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl ControlDevice for FakeControls {
    fn query_next(&self, after: u32) -> io::Result<Option<v4l2_queryctrl>> {
        let controls = self.controls.lock().unwrap();
        Ok(controls
            .iter()
            .filter(|c| c.query.id > after)
            .min_by_key(|c| c.query.id)
            .map(|c| c.query))
    }

    fn get_value(&self, id: u32) -> io::Result<i32> {
        let controls = self.controls.lock().unwrap();
        controls
            .iter()
            .find(|c| c.query.id == id)
            .map(|c| c.value)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn set_value(&self, id: u32, value: i32) -> io::Result<i32> {
        let mut controls = self.controls.lock().unwrap();
        let control = controls
            .iter_mut()
            .find(|c| c.query.id == id)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        if value < control.query.minimum || value > control.query.maximum {
            return Err(io::Error::from_raw_os_error(libc::ERANGE));
        }
        control.value = value;
        let len = control.query.name.iter().position(|&c| c == 0).unwrap_or(32);
        let name = String::from_utf8_lossy(&control.query.name[..len]).into_owned();
        self.writes.lock().unwrap().push((name, value));

        Ok(value)
    }

    fn get_string(&self, id: u32, max_len: usize) -> io::Result<String> {
        let controls = self.controls.lock().unwrap();
        controls
            .iter()
            .find(|c| c.query.id == id)
            .and_then(|c| c.string.clone())
            .map(|mut s| {
                s.truncate(max_len);
                s
            })
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
    }
}
