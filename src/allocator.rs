// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory backends for capture buffers.
//!
//! Two backends are supported:
//!
//! * `MmapAllocator` maps the buffers allocated by the driver itself. A buffer is identified by
//!   its kernel index and the kernel performs cache maintenance when buffers are queued and
//!   dequeued.
//! * `DmaBufAllocator` allocates dmabufs from a DMA heap and imports them into the queue. CPU
//!   access windows are bracketed with explicit dmabuf synchronization.
//!
//! Every buffer has a fixed capacity, the `sizeimage` of the queue format at the time the
//! allocator is created.

use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;

use log::debug;
use v4l2r::memory::MemoryType;
use v4l2r::QueueType;

use crate::dma_heap::BufferHeap;
use crate::error::Error;
use crate::error::Result;
use crate::mapping::MappedRegion;
use crate::queue::CaptureQueue;
use crate::queue::KernelBuffer;

/// What identifies a buffer to the kernel.
#[derive(Debug)]
pub enum BufferIdentity {
    /// Index of a driver-allocated buffer.
    Index(u32),
    /// dmabuf imported on queue.
    DmaBuf(OwnedFd),
}

/// A capture buffer and its CPU mapping.
pub struct Buffer {
    region: MappedRegion,
    identity: BufferIdentity,
    len: usize,
    cpu_access: bool,
}

impl Buffer {
    fn new(region: MappedRegion, identity: BufferIdentity) -> Self {
        Self {
            region,
            identity,
            len: 0,
            cpu_access: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the number of valid bytes, clamped to the capacity.
    pub fn resize(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// The valid bytes of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.region.as_ref()[..self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.region.as_mut()[..self.len]
    }

    /// The whole mapped memory, regardless of the valid length.
    pub(crate) fn memory(&self) -> &[u8] {
        self.region.as_ref()
    }

    pub fn identity(&self) -> &BufferIdentity {
        &self.identity
    }

    /// Kernel index of MMAP buffers.
    pub fn index(&self) -> Option<u32> {
        match self.identity {
            BufferIdentity::Index(index) => Some(index),
            BufferIdentity::DmaBuf(_) => None,
        }
    }

    pub fn dmabuf(&self) -> Option<BorrowedFd<'_>> {
        match &self.identity {
            BufferIdentity::Index(_) => None,
            BufferIdentity::DmaBuf(fd) => Some(fd.as_fd()),
        }
    }

    /// Whether the CPU access window of the buffer is open.
    pub fn in_cpu_access(&self) -> bool {
        self.cpu_access
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("identity", &self.identity)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("cpu_access", &self.cpu_access)
            .finish()
    }
}

fn probe_capacity<Q: CaptureQueue + ?Sized>(queue: &Q) -> Result<usize> {
    let format = queue
        .format()
        .map_err(|e| Error::connection("failed to get capture format", e))?;
    if format.size_image == 0 {
        return Err(Error::UnsupportedFormat(
            "capture format reports a zero buffer size".into(),
        ));
    }

    Ok(format.size_image as usize)
}

/// Backend for driver-allocated buffers.
pub struct MmapAllocator {
    queue: QueueType,
    capacity: usize,
}

/// Backend for dmabufs allocated from a heap.
pub struct DmaBufAllocator {
    heap: Box<dyn BufferHeap>,
    queue: QueueType,
    capacity: usize,
}

pub enum Allocator {
    Mmap(MmapAllocator),
    DmaBuf(DmaBufAllocator),
}

impl Allocator {
    pub fn mmap<Q: CaptureQueue + ?Sized>(queue: &Q) -> Result<Self> {
        Ok(Allocator::Mmap(MmapAllocator {
            queue: queue.queue_type(),
            capacity: probe_capacity(queue)?,
        }))
    }

    pub fn dmabuf<Q: CaptureQueue + ?Sized>(queue: &Q, heap: Box<dyn BufferHeap>) -> Result<Self> {
        Ok(Allocator::DmaBuf(DmaBufAllocator {
            heap,
            queue: queue.queue_type(),
            capacity: probe_capacity(queue)?,
        }))
    }

    pub fn memory(&self) -> MemoryType {
        match self {
            Allocator::Mmap(_) => MemoryType::Mmap,
            Allocator::DmaBuf(_) => MemoryType::DmaBuf,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        match self {
            Allocator::Mmap(a) => a.queue,
            Allocator::DmaBuf(a) => a.queue,
        }
    }

    /// Capacity of every buffer produced by this allocator.
    pub fn max_byte_size(&self) -> usize {
        match self {
            Allocator::Mmap(a) => a.capacity,
            Allocator::DmaBuf(a) => a.capacity,
        }
    }

    /// Produce the buffer for kernel slot `index`. The queue must already hold the requested
    /// number of buffers.
    pub fn allocate<Q: CaptureQueue + ?Sized>(&self, queue: &Q, index: u32) -> Result<Buffer> {
        match self {
            Allocator::Mmap(_) => {
                let region = queue.map_buffer(index).map_err(|e| {
                    Error::connection(format!("failed to map capture buffer {}", index), e)
                })?;
                Ok(Buffer::new(region, BufferIdentity::Index(index)))
            }
            Allocator::DmaBuf(a) => {
                let fd = a.heap.allocate(a.capacity).map_err(|e| {
                    Error::connection(format!("failed to allocate {} bytes dmabuf", a.capacity), e)
                })?;
                let region = MappedRegion::new(&fd, a.capacity, 0)
                    .map_err(|e| Error::connection("failed to map dmabuf", e.into()))?;
                debug!("allocated dmabuf {} for slot {}", fd.as_raw_fd(), index);
                Ok(Buffer::new(region, BufferIdentity::DmaBuf(fd)))
            }
        }
    }

    /// Bind `buffer` to the kernel descriptor `desc`.
    ///
    /// For MMAP buffers the descriptor index is replaced by the buffer's own index. For dmabufs
    /// the index chosen by the caller is kept and the dmabuf is attached.
    pub fn fill_v4l2_buffer(&self, buffer: &Buffer, desc: &mut KernelBuffer) {
        desc.memory = self.memory();
        desc.length = buffer.capacity() as u32;
        match &buffer.identity {
            BufferIdentity::Index(index) => {
                desc.index = *index;
                desc.fd = None;
            }
            BufferIdentity::DmaBuf(fd) => {
                desc.fd = Some(fd.as_raw_fd());
            }
        }
    }

    /// Open the CPU access window of `buffer`. Does nothing if it is already open.
    pub fn begin_cpu_access(&self, buffer: &mut Buffer) -> std::io::Result<()> {
        if buffer.cpu_access {
            return Ok(());
        }
        if let (Allocator::DmaBuf(a), BufferIdentity::DmaBuf(fd)) = (self, &buffer.identity) {
            a.heap.begin_cpu_access(fd.as_fd())?;
        }
        buffer.cpu_access = true;

        Ok(())
    }

    /// Close the CPU access window of `buffer`. Does nothing if it is not open.
    pub fn end_cpu_access(&self, buffer: &mut Buffer) -> std::io::Result<()> {
        if !buffer.cpu_access {
            return Ok(());
        }
        if let (Allocator::DmaBuf(a), BufferIdentity::DmaBuf(fd)) = (self, &buffer.identity) {
            a.heap.end_cpu_access(fd.as_fd())?;
        }
        buffer.cpu_access = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHeap;
    use crate::testing::FakeQueue;

    #[test]
    fn mmap_buffers_use_their_kernel_index() {
        let mut queue = FakeQueue::new(4096);
        queue.request_buffers(MemoryType::Mmap, 2).unwrap();
        let allocator = Allocator::mmap(&queue).unwrap();
        assert_eq!(allocator.max_byte_size(), 4096);
        assert_eq!(allocator.memory(), MemoryType::Mmap);

        let buffer = allocator.allocate(&queue, 1).unwrap();
        assert_eq!(buffer.index(), Some(1));
        assert_eq!(buffer.capacity(), 4096);
        assert!(buffer.is_empty());

        let mut desc = KernelBuffer::new(queue.queue_type(), 0);
        allocator.fill_v4l2_buffer(&buffer, &mut desc);
        assert_eq!(desc.index, 1);
        assert_eq!(desc.memory, MemoryType::Mmap);
        assert_eq!(desc.length, 4096);
        assert_eq!(desc.fd, None);
    }

    #[test]
    fn dmabuf_buffers_keep_the_caller_index() {
        let queue = FakeQueue::new(8192);
        let heap = FakeHeap::new();
        let allocator = Allocator::dmabuf(&queue, Box::new(heap.clone())).unwrap();

        let buffer = allocator.allocate(&queue, 0).unwrap();
        assert_eq!(buffer.index(), None);
        assert_eq!(buffer.capacity(), 8192);
        assert_eq!(heap.allocated(), 1);

        let mut desc = KernelBuffer::new(queue.queue_type(), 5);
        allocator.fill_v4l2_buffer(&buffer, &mut desc);
        assert_eq!(desc.index, 5);
        assert_eq!(desc.memory, MemoryType::DmaBuf);
        assert_eq!(
            desc.fd,
            buffer.dmabuf().map(|fd| fd.as_raw_fd())
        );
    }

    #[test]
    fn cpu_access_windows_are_idempotent() {
        let queue = FakeQueue::new(4096);
        let heap = FakeHeap::new();
        let allocator = Allocator::dmabuf(&queue, Box::new(heap.clone())).unwrap();
        let mut buffer = allocator.allocate(&queue, 0).unwrap();

        allocator.end_cpu_access(&mut buffer).unwrap();
        assert_eq!(heap.syncs(), (0, 0));

        allocator.begin_cpu_access(&mut buffer).unwrap();
        allocator.begin_cpu_access(&mut buffer).unwrap();
        assert!(buffer.in_cpu_access());
        assert_eq!(heap.syncs(), (1, 0));

        allocator.end_cpu_access(&mut buffer).unwrap();
        allocator.end_cpu_access(&mut buffer).unwrap();
        assert!(!buffer.in_cpu_access());
        assert_eq!(heap.syncs(), (1, 1));
    }

    #[test]
    fn resize_is_clamped_to_capacity() {
        let queue = FakeQueue::new(4096);
        let allocator = Allocator::dmabuf(&queue, Box::new(FakeHeap::new())).unwrap();
        let mut buffer = allocator.allocate(&queue, 0).unwrap();

        buffer.resize(100);
        assert_eq!(buffer.data().len(), 100);
        buffer.resize(1 << 20);
        assert_eq!(buffer.len(), 4096);
    }

    #[test]
    fn zero_sized_format_is_rejected() {
        let queue = FakeQueue::new(0);
        assert!(matches!(
            Allocator::mmap(&queue),
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
