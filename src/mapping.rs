// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! CPU mappings of buffers shared with the capture hardware.

use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("cannot map a zero-sized buffer")]
    ZeroSize,
    #[error("mmap offset {0} does not fit in off_t")]
    BadOffset(u64),
    #[error("mmap call returned error: {0}")]
    Mmap(#[from] Errno),
}

impl From<MappingError> for std::io::Error {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::Mmap(errno) => errno.into(),
            e => std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        }
    }
}

/// A shared, read/write mapping of a kernel or dmabuf buffer.
///
/// The mapping stays valid until this object is dropped.
pub struct MappedRegion {
    data: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is plain shared memory with no thread affinity. Access is serialized by
// ownership of the `MappedRegion`.
unsafe impl Send for MappedRegion {}
// SAFETY: see `Send`. Shared references only give read access to the bytes.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `fd` starting at `offset`.
    pub fn new<F: AsFd>(fd: F, len: usize, offset: u64) -> Result<Self, MappingError> {
        let size = NonZeroUsize::new(len).ok_or(MappingError::ZeroSize)?;
        let offset = libc::off_t::try_from(offset).map_err(|_| MappingError::BadOffset(offset))?;

        // SAFETY: a new shared mapping is created, it does not alias any Rust object.
        let data = unsafe {
            mman::mmap(
                None,
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                offset,
            )?
        };

        Ok(Self {
            data: data.cast(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `data` points to `len` mapped bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for MappedRegion {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: `data` points to `len` mapped bytes and `self` is borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: the pointer and length were obtained from a successful mmap() in `new`.
        unsafe { mman::munmap(self.data.cast(), self.len) }.unwrap_or_else(|e| {
            log::error!("error while unmapping buffer: {:#}", e);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nix::sys::memfd::memfd_create;
    use nix::sys::memfd::MemFdCreateFlag;

    use super::*;

    #[test]
    fn mapping_shares_file_contents() {
        let fd = memfd_create(c"", MemFdCreateFlag::empty()).unwrap();
        let mut file = std::fs::File::from(fd);
        file.set_len(4096).unwrap();
        file.write_all(b"evts").unwrap();

        let mut region = MappedRegion::new(&file, 4096, 0).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(&region.as_ref()[..4], b"evts");

        region.as_mut()[4] = 0xaa;
        let again = MappedRegion::new(&file, 4096, 0).unwrap();
        assert_eq!(again.as_ref()[4], 0xaa);
    }

    #[test]
    fn zero_size_is_rejected() {
        let fd = memfd_create(c"", MemFdCreateFlag::empty()).unwrap();
        assert!(matches!(
            MappedRegion::new(&fd, 0, 0),
            Err(MappingError::ZeroSize)
        ));
    }
}
