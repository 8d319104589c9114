// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A fixed set of capture buffers shared between the capture loop and the consumer.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::allocator::Buffer;

struct Shared {
    free: Mutex<Vec<Buffer>>,
    released: Condvar,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<Buffer>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, buffer: Buffer) {
        self.lock().push(buffer);
        self.released.notify_one();
    }
}

/// Bounded pool of buffers. Cloning gives another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    pub fn new(buffers: Vec<Buffer>) -> Self {
        let capacity = buffers.len();

        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(buffers),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    fn wrap(&self, buffer: Buffer) -> PooledBuffer {
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.shared),
        }
    }

    /// Take a free buffer if there is one.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let buffer = self.shared.lock().pop()?;
        Some(self.wrap(buffer))
    }

    /// Take a free buffer, waiting for one to be released if needed.
    pub fn acquire(&self) -> PooledBuffer {
        let mut free = self.shared.lock();
        loop {
            if let Some(buffer) = free.pop() {
                drop(free);
                return self.wrap(buffer);
            }
            free = self
                .shared
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of free buffers.
    pub fn available(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Total number of buffers managed by the pool.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// A buffer taken from a `BufferPool`. It goes back to the pool when dropped.
pub struct PooledBuffer {
    buffer: Option<Buffer>,
    pool: Arc<Shared>,
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        // `buffer` is only taken in `drop`.
        self.buffer.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledBuffer").field(&self.buffer).finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use v4l2r::memory::MemoryType;

    use super::*;
    use crate::allocator::Allocator;
    use crate::queue::CaptureQueue;
    use crate::testing::FakeQueue;

    fn pool(count: u32) -> BufferPool {
        let mut queue = FakeQueue::new(1024);
        queue.request_buffers(MemoryType::Mmap, count).unwrap();
        let allocator = Allocator::mmap(&queue).unwrap();
        BufferPool::new(
            (0..count)
                .map(|i| allocator.allocate(&queue, i).unwrap())
                .collect(),
        )
    }

    #[test]
    fn buffers_return_on_drop() {
        let pool = pool(2);
        assert_eq!(pool.capacity(), 2);

        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert!(pool.is_empty());
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn acquire_waits_for_release_from_another_thread() {
        let pool = pool(1);
        let held = pool.try_acquire().unwrap();
        let index = held.index();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
        });

        let buffer = pool.acquire();
        assert_eq!(buffer.index(), index);
        releaser.join().unwrap();
    }
}
