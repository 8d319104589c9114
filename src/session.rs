// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs a `DataTransfer` loop on its own thread while the device streams.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use log::warn;

use crate::device::StreamControl;
use crate::error::Error;
use crate::error::Result;
use crate::queue::CaptureQueue;
use crate::transfer::DataSink;
use crate::transfer::DataTransfer;

const CAPTURE_THREAD_NAME: &str = "v4l2 capture";

type Worker<Q> = JoinHandle<(DataTransfer<Q>, Result<()>)>;

/// A streaming capture.
///
/// Dropping the session stops it and releases the transfer with its buffers.
pub struct CaptureSession<'d, D: StreamControl, Q: CaptureQueue + 'static> {
    control: &'d D,
    stop: Arc<AtomicBool>,
    worker: Option<Worker<Q>>,
}

impl<'d, D: StreamControl, Q: CaptureQueue + 'static> CaptureSession<'d, D, Q> {
    /// Queue the first buffers of `transfer`, start streaming on `control` and deliver captured
    /// buffers to `sink` from a dedicated thread.
    pub fn start(
        control: &'d D,
        mut transfer: DataTransfer<Q>,
        mut sink: Box<dyn DataSink>,
    ) -> Result<Self> {
        transfer.start()?;
        if let Err(e) = control.start() {
            transfer.stop();
            return Err(e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let worker = std::thread::Builder::new()
            .name(CAPTURE_THREAD_NAME.to_owned())
            .spawn(move || {
                let res = transfer.run(&thread_stop, sink.as_mut());
                if let Err(e) = &res {
                    error!("capture loop terminated: {}", e);
                }
                (transfer, res)
            });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                if let Err(e) = control.stop() {
                    warn!("{}", e);
                }
                return Err(Error::transient("cannot spawn capture thread", e));
            }
        };
        debug!("capture session started");

        Ok(Self {
            control,
            stop,
            worker: Some(worker),
        })
    }

    /// Whether the capture loop has terminated on its own, usually on error.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Returns `None` if already shut down, or the panic payload of the loop thread.
    fn shutdown(&mut self) -> Option<thread::Result<(DataTransfer<Q>, Result<()>)>> {
        let worker = self.worker.take()?;

        self.stop.store(true, Ordering::Release);
        // Streaming off returns all buffers and wakes up the loop.
        if let Err(e) = self.control.stop() {
            warn!("{}", e);
        }
        let joined = worker.join();

        // The loop may have queued a replacement buffer after the first STREAMOFF.
        let stream_res = self.control.stop();
        if let Err(e) = &stream_res {
            warn!("{}", e);
        }
        debug!("capture session stopped");

        Some(joined.map(|(mut transfer, res)| {
            transfer.stop();
            (transfer, res.and(stream_res))
        }))
    }

    /// Stop streaming and the capture loop.
    ///
    /// Returns the transfer, ready to be started again, along with the result of the loop. A
    /// panic of the capture thread is propagated.
    pub fn stop(mut self) -> (DataTransfer<Q>, Result<()>) {
        match self.shutdown() {
            Some(Ok(r)) => r,
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            // The worker is only taken by `shutdown`, which consumes or drops the session.
            None => unreachable!(),
        }
    }
}

impl<'d, D: StreamControl, Q: CaptureQueue + 'static> Drop for CaptureSession<'d, D, Q> {
    fn drop(&mut self) {
        match self.shutdown() {
            Some(Ok((_, Err(e)))) => error!("capture session ended with error: {}", e),
            Some(Err(_)) => error!("capture thread panicked"),
            _ => (),
        }
    }
}
