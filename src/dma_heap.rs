// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Allocation of dmabufs from a Linux DMA heap, and CPU access synchronization of dmabufs.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Directory where the kernel exposes DMA heaps.
pub const DMA_HEAP_DIR: &str = "/dev/dma_heap";
/// Heap used when none is configured.
pub const DEFAULT_DMA_HEAP: &str = "linux,cma";

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct DmaBufSync {
    flags: u64,
}

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

nix::ioctl_readwrite!(dma_heap_ioctl_alloc, b'H', 0x0, DmaHeapAllocationData);
nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, DmaBufSync);

fn dma_buf_sync(dmabuf: BorrowedFd<'_>, flags: u64) -> io::Result<()> {
    let sync = DmaBufSync { flags };

    // SAFETY: `sync` is a valid `dma_buf_sync` that lives for the duration of the call.
    unsafe { dma_buf_ioctl_sync(dmabuf.as_raw_fd(), &sync) }?;

    Ok(())
}

/// Source of dmabufs for capture buffers.
pub trait BufferHeap: Send {
    /// Allocate a dmabuf of `len` bytes.
    fn allocate(&self, len: usize) -> io::Result<OwnedFd>;

    /// Prepare `dmabuf` for reads and writes by the CPU.
    fn begin_cpu_access(&self, dmabuf: BorrowedFd<'_>) -> io::Result<()>;

    /// Hand `dmabuf` back to the device after CPU access.
    fn end_cpu_access(&self, dmabuf: BorrowedFd<'_>) -> io::Result<()>;
}

/// An opened DMA heap, e.g. `/dev/dma_heap/linux,cma`.
pub struct DmaHeap {
    file: File,
    path: PathBuf,
    coherent: bool,
}

impl DmaHeap {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().read(true).write(true).open(&path)?;

        Ok(Self {
            file,
            path,
            coherent: false,
        })
    }

    /// Whether CPU mappings of the heap's dmabufs are coherent with the device, in which case
    /// CPU access needs no synchronization.
    pub fn with_coherent_mapping(self, coherent: bool) -> Self {
        Self { coherent, ..self }
    }

    /// Open heap `name` under the standard heap directory.
    pub fn open_named(name: &str) -> io::Result<Self> {
        Self::open(Path::new(DMA_HEAP_DIR).join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BufferHeap for DmaHeap {
    fn allocate(&self, len: usize) -> io::Result<OwnedFd> {
        let mut data = DmaHeapAllocationData {
            len: len as u64,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            ..DmaHeapAllocationData::new_zeroed()
        };

        // SAFETY: `data` is a valid `dma_heap_allocation_data` that lives for the duration of
        // the call.
        unsafe { dma_heap_ioctl_alloc(self.file.as_raw_fd(), &mut data) }?;

        // SAFETY: on success the kernel returned a new dmabuf fd that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd as i32) })
    }

    fn begin_cpu_access(&self, dmabuf: BorrowedFd<'_>) -> io::Result<()> {
        if self.coherent {
            return Ok(());
        }
        dma_buf_sync(dmabuf, DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW)
    }

    fn end_cpu_access(&self, dmabuf: BorrowedFd<'_>) -> io::Result<()> {
        if self.coherent {
            return Ok(());
        }
        dma_buf_sync(dmabuf, DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn uapi_struct_sizes() {
        assert_eq!(std::mem::size_of::<DmaHeapAllocationData>(), 24);
        assert_eq!(std::mem::size_of::<DmaBufSync>(), 8);
    }

    #[test]
    fn sync_on_a_non_dmabuf_fails() {
        let null = File::open("/dev/null").unwrap();
        assert!(dma_buf_sync(null.as_fd(), DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW).is_err());
    }

    #[test]
    fn coherent_heaps_skip_sync() {
        let null = File::open("/dev/null").unwrap();
        let heap = DmaHeap {
            file: File::open("/dev/null").unwrap(),
            path: PathBuf::from("/dev/null"),
            coherent: false,
        };
        assert!(heap.begin_cpu_access(null.as_fd()).is_err());
        assert!(heap.end_cpu_access(null.as_fd()).is_err());

        let heap = heap.with_coherent_mapping(true);
        heap.begin_cpu_access(null.as_fd()).unwrap();
        heap.end_cpu_access(null.as_fd()).unwrap();
    }

    #[test]
    fn missing_heap() {
        assert!(DmaHeap::open_named("does-not-exist").is_err());
    }
}
