// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate acquires the output of event-based vision sensors exposed by a V4L2 driver behind
//! a media controller node.
//!
//! # Anatomy of a camera
//!
//! A camera is a media graph with (at least) a sensor subdevice, which carries the controls and
//! selection rectangles of the sensor, and a video node producing the encoded event stream.
//! `V4l2DeviceControl` opens the media node, resolves both entities and enumerates the sensor
//! controls. `CameraDiscovery` finds such cameras on the system.
//!
//! # Capturing
//!
//! `DataTransfer` requests capture buffers from the video node through an `Allocator`, which
//! backs them either with driver memory (MMAP) or with dmabufs from a DMA heap (DMABUF). The
//! buffers live in a `BufferPool`. Once started, the transfer keeps a few buffers queued to the
//! driver and hands every filled buffer to a `DataSink`, replacing it with a free one. Consumers
//! return buffers to the pool by dropping them.
//!
//! `CaptureSession` runs that loop on a dedicated thread between STREAMON and STREAMOFF.
//!
//! Device access goes through a handful of traits (`MediaDevice`, `ControlDevice`,
//! `CaptureQueue`, `BufferHeap`, `StreamControl`) so the logic above can run against test
//! doubles.

pub mod allocator;
pub mod boundary;
pub mod controls;
pub mod device;
pub mod discovery;
pub mod dma_heap;
pub mod error;
pub mod facilities;
pub mod format;
pub mod mapping;
pub mod media;
pub mod poll;
pub mod pool;
pub mod queue;
pub mod session;
pub mod subdev;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use allocator::Allocator;
pub use allocator::Buffer;
pub use device::StreamControl;
pub use device::V4l2DeviceControl;
pub use discovery::CameraDiscovery;
pub use error::Error;
pub use error::Result;
pub use format::Encoding;
pub use format::StreamFormat;
pub use pool::BufferPool;
pub use pool::PooledBuffer;
pub use session::CaptureSession;
pub use transfer::DataSink;
pub use transfer::DataTransfer;
pub use transfer::TransferConfig;
pub use v4l2r;
