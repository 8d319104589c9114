// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capture state machine.
//!
//! `DataTransfer` owns the capture queue, the buffer allocator and the pool of buffers. Once
//! armed, it keeps a number of buffers queued to the driver and runs a loop that dequeues filled
//! buffers, hands them to a `DataSink`, and replaces them with free buffers from the pool.
//!
//! Every buffer is at any time in exactly one place: free in the pool, queued to the driver (and
//! then held in the slot of its kernel index), or owned by the consumer. Consumers give buffers
//! back simply by dropping them.
//!
//! ```text
//! Idle --new()--> Armed --start()--> Streaming --stop()--> Armed --drop--> Idle
//! ```

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::error;
use log::trace;
use log::warn;

use crate::allocator::Allocator;
use crate::boundary::BoundaryMarker;
use crate::dma_heap::DmaHeap;
use crate::dma_heap::DEFAULT_DMA_HEAP;
use crate::dma_heap::DMA_HEAP_DIR;
use crate::error::Error;
use crate::error::Result;
use crate::format::Encoding;
use crate::poll::Readiness;
use crate::pool::BufferPool;
use crate::pool::PooledBuffer;
use crate::queue::CaptureQueue;
use crate::queue::KernelBuffer;

/// Delay before polling again after the queue reported an error condition.
const ERROR_RETRY_DELAY: Duration = Duration::from_millis(1);

/// How capture buffers are backed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryConfig {
    /// Buffers allocated by the driver and mapped.
    Mmap,
    /// dmabufs allocated from the DMA heap at `heap`. CPU access is not synchronized when the
    /// heap hands out `coherent` mappings.
    DmaBuf { heap: PathBuf, coherent: bool },
}

impl MemoryConfig {
    /// DMABUF memory from the default heap.
    pub fn default_dma_heap() -> Self {
        MemoryConfig::DmaBuf {
            heap: PathBuf::from(DMA_HEAP_DIR).join(DEFAULT_DMA_HEAP),
            coherent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Number of buffers requested from the driver.
    pub buffer_count: u32,
    /// Number of buffers queued before streaming starts.
    pub preload: u32,
    /// Derive the payload length from end-of-transfer markers instead of `bytesused`.
    pub infer_payload_boundary: bool,
    pub memory: MemoryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_count: 32,
            preload: 4,
            infer_payload_boundary: false,
            memory: MemoryConfig::Mmap,
        }
    }
}

/// Receiver of filled buffers.
pub trait DataSink: Send {
    fn on_data(&mut self, buffer: PooledBuffer);
}

impl<F: FnMut(PooledBuffer) + Send> DataSink for F {
    fn on_data(&mut self, buffer: PooledBuffer) {
        self(buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// No buffer allocated.
    Idle,
    /// Buffers allocated, none queued.
    Armed,
    /// Buffers queued, the loop may run.
    Streaming,
}

pub struct DataTransfer<Q: CaptureQueue> {
    queue: Q,
    allocator: Allocator,
    pool: BufferPool,
    /// Buffers owned by the driver, indexed by kernel index.
    slots: Vec<Option<PooledBuffer>>,
    state: TransferState,
    config: TransferConfig,
    boundary: Option<BoundaryMarker>,
}

impl<Q: CaptureQueue> DataTransfer<Q> {
    /// Allocate the buffers described by `config` on `queue`.
    ///
    /// `encoding` is the encoding of the stream, used to find payload boundaries when
    /// `config.infer_payload_boundary` is set.
    pub fn new(queue: Q, config: TransferConfig, encoding: Encoding) -> Result<Self> {
        let allocator = match &config.memory {
            MemoryConfig::Mmap => Allocator::mmap(&queue)?,
            MemoryConfig::DmaBuf { heap, coherent } => {
                let heap = DmaHeap::open(heap)
                    .map_err(|e| {
                        Error::connection(format!("cannot open DMA heap {}", heap.display()), e)
                    })?
                    .with_coherent_mapping(*coherent);
                Allocator::dmabuf(&queue, Box::new(heap))?
            }
        };

        Self::with_allocator(queue, allocator, config, encoding)
    }

    /// Like `new`, with an already built allocator. `config.memory` is ignored.
    pub fn with_allocator(
        mut queue: Q,
        allocator: Allocator,
        config: TransferConfig,
        encoding: Encoding,
    ) -> Result<Self> {
        let memory = allocator.memory();
        let requested = config.buffer_count;

        let granted = queue.request_buffers(memory, requested).map_err(|e| {
            Error::connection(format!("failed to request {} buffers", requested), e)
        })?;
        if granted != requested {
            if granted > 0 {
                if let Err(e) = queue.request_buffers(memory, 0) {
                    warn!("failed to release {} capture buffers: {}", granted, e);
                }
            }
            return Err(Error::ResourceExhaustion { requested, granted });
        }

        let buffers = (0..requested)
            .map(|index| allocator.allocate(&queue, index))
            .collect::<Result<Vec<_>>>();
        let buffers = match buffers {
            Ok(buffers) => buffers,
            Err(e) => {
                if let Err(e) = queue.request_buffers(memory, 0) {
                    warn!("failed to release capture buffers: {}", e);
                }
                return Err(e);
            }
        };
        debug!(
            "allocated {} {:?} buffers of {} bytes",
            requested,
            memory,
            allocator.max_byte_size()
        );

        let boundary = config
            .infer_payload_boundary
            .then(|| BoundaryMarker::for_encoding(encoding));

        Ok(Self {
            queue,
            pool: BufferPool::new(buffers),
            slots: (0..requested).map(|_| None).collect(),
            allocator,
            state: TransferState::Armed,
            config,
            boundary,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Number of buffers currently owned by the driver.
    pub fn queued(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Queue the initial buffers. Streaming must be enabled on the device afterwards.
    pub fn start(&mut self) -> Result<()> {
        if self.state != TransferState::Armed {
            return Err(Error::InvalidState("transfer is not armed"));
        }

        for index in 0..self.config.preload.min(self.config.buffer_count) {
            let buffer = self
                .pool
                .try_acquire()
                .ok_or(Error::InvalidState("no free buffer to preload"))?;
            self.requeue(index, buffer)?;
        }
        self.state = TransferState::Streaming;

        Ok(())
    }

    /// Bind `buffer` to kernel slot `index` and queue it.
    fn requeue(&mut self, index: u32, mut buffer: PooledBuffer) -> Result<()> {
        let mut desc = KernelBuffer::new(self.queue.queue_type(), index);
        self.allocator.fill_v4l2_buffer(&buffer, &mut desc);

        let slot = desc.index as usize;
        if self.slots.get(slot).map_or(true, Option::is_some) {
            return Err(Error::InvalidState("buffer slot is not free"));
        }

        self.allocator
            .begin_cpu_access(&mut buffer)
            .map_err(|e| Error::transient("failed to begin CPU access", e))?;
        let capacity = buffer.capacity();
        buffer.resize(capacity);
        self.allocator
            .end_cpu_access(&mut buffer)
            .map_err(|e| Error::transient("failed to end CPU access", e))?;

        self.queue
            .queue_buffer(&desc)
            .map_err(|e| Error::transient(format!("failed to queue buffer {}", desc.index), e))?;
        trace!("queued buffer {}", desc.index);
        self.slots[slot] = Some(buffer);

        Ok(())
    }

    /// Dequeue one filled buffer, deliver or drop it, and queue a replacement.
    fn transfer_one(&mut self, sink: &mut dyn DataSink) -> Result<()> {
        let desc = self
            .queue
            .dequeue_buffer(self.allocator.memory())
            .map_err(|e| Error::transient("failed to dequeue buffer", e))?;

        let mut buffer = self
            .slots
            .get_mut(desc.index as usize)
            .and_then(Option::take)
            .ok_or(Error::InvalidState("dequeued a buffer that was not queued"))?;

        self.allocator
            .begin_cpu_access(&mut buffer)
            .map_err(|e| Error::transient("failed to begin CPU access", e))?;
        let reported = desc.bytes_used as usize;
        let len = match self.boundary {
            Some(marker) => marker.infer_length(buffer.memory(), reported),
            None => reported,
        };
        buffer.resize(len);

        // A filled buffer is dropped rather than delivered when nothing could replace it.
        if self.pool.is_empty() {
            debug!("no free buffer left, dropping {} bytes", len);
            drop(buffer);
        } else {
            sink.on_data(buffer);
        }

        let next = self
            .pool
            .try_acquire()
            .ok_or(Error::InvalidState("no free buffer to requeue"))?;
        self.requeue(desc.index, next)
    }

    /// Run the capture loop until `stop` is raised or an error occurs.
    pub fn run(&mut self, stop: &AtomicBool, sink: &mut dyn DataSink) -> Result<()> {
        if self.state != TransferState::Streaming {
            return Err(Error::InvalidState("transfer is not started"));
        }

        while !stop.load(Ordering::Acquire) {
            let res = match self
                .queue
                .wait_ready()
                .map_err(|e| Error::transient("failed to wait for capture buffers", e))?
            {
                Readiness::Readable => self.transfer_one(sink),
                Readiness::Error => {
                    std::thread::sleep(ERROR_RETRY_DELAY);
                    Ok(())
                }
            };

            match res {
                Ok(()) => (),
                // Streaming may be disabled under our feet once stop is raised.
                Err(e @ Error::TransientIo { .. }) if stop.load(Ordering::Acquire) => {
                    debug!("capture loop stopping: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Forget all queued buffers, which must have been returned by disabling streaming.
    pub fn stop(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
        if self.state == TransferState::Streaming {
            self.state = TransferState::Armed;
        }
    }
}

impl<Q: CaptureQueue> Drop for DataTransfer<Q> {
    fn drop(&mut self) {
        self.stop();
        let memory = self.allocator.memory();
        match self.queue.request_buffers(memory, 0) {
            Ok(_) => trace!("released capture buffers"),
            Err(e) => error!("failed to release capture buffers: {}", e),
        }
        self.state = TransferState::Idle;
    }
}
