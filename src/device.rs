// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control object of an event sensor behind a media controller node.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::info;
use log::trace;
use v4l2r::ioctl::Capabilities;
use v4l2r::ioctl::Capability;
use v4l2r::ioctl::IntoErrno;
use v4l2r::QueueType;

use crate::controls::Controls;
use crate::controls::SubdevControlDevice;
use crate::error::Error;
use crate::error::Result;
use crate::format::StreamFormat;
use crate::media::EntityGraph;
use crate::media::MediaEntity;
use crate::media::MediaNode;
use crate::queue::node_format;
use crate::queue::V4l2CaptureNode;
use crate::subdev::get_selection;
use crate::subdev::set_selection;
use crate::subdev::Rect;
use crate::subdev::SelectionTarget;

/// Streaming switch of a capture device.
pub trait StreamControl {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Capabilities of the video node, read once when the device is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Capture queue used for streaming, multi-planar if supported.
    pub queue: QueueType,
}

/// An opened event sensor.
///
/// Owns the media graph (and with it the descriptors of the sensor subdevice and video node) and
/// the control registry of the sensor.
pub struct V4l2DeviceControl {
    path: PathBuf,
    graph: EntityGraph,
    capability: DeviceCapability,
    controls: Controls,
}

fn v4l2_error<E: IntoErrno>(context: &str, e: E) -> Error {
    Error::connection(context, io::Error::from_raw_os_error(e.into_errno()))
}

impl V4l2DeviceControl {
    /// Open the media controller node at `path` and resolve the sensor pipeline behind it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let context = || format!("cannot open {}", path.display());

        let metadata = std::fs::metadata(path).map_err(|e| Error::connection(context(), e))?;
        if !metadata.file_type().is_char_device() {
            return Err(Error::connection(
                context(),
                io::Error::from_raw_os_error(libc::ENODEV),
            ));
        }

        let media = MediaNode::open(path).map_err(|e| Error::connection(context(), e))?;
        let graph = EntityGraph::enumerate(&media)?;

        let video = graph.video_entity()?;
        let caps: Capability = v4l2r::ioctl::querycap(video.file()?)
            .map_err(|e| v4l2_error("VIDIOC_QUERYCAP failed", e))?;
        let device_caps = caps.device_caps();

        let queue = if device_caps.contains(Capabilities::VIDEO_CAPTURE_MPLANE) {
            QueueType::VideoCaptureMplane
        } else if device_caps.contains(Capabilities::VIDEO_CAPTURE) {
            QueueType::VideoCapture
        } else {
            return Err(Error::connection(
                format!("{} is not a video capture device", video.path().display()),
                io::Error::from_raw_os_error(libc::ENOTSUP),
            ));
        };
        if !device_caps.contains(Capabilities::STREAMING) {
            return Err(Error::connection(
                format!("{} does not support streaming I/O", video.path().display()),
                io::Error::from_raw_os_error(libc::ENOTSUP),
            ));
        }
        let capability = DeviceCapability {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus_info,
            queue,
        };
        debug!("{}: {:?}", path.display(), capability);

        let sensor = graph.sensor_entity()?;
        let sensor_file = sensor
            .file()?
            .try_clone()
            .map_err(|e| Error::connection("cannot duplicate sensor descriptor", e))?;
        let controls = Controls::enumerate(SubdevControlDevice::new(sensor_file))
            .map_err(|e| Error::connection("failed to enumerate sensor controls", e))?;
        info!(
            "opened sensor {:?} on {} with {} controls",
            sensor.name(),
            path.display(),
            controls.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            graph,
            capability,
            controls,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.graph
    }

    pub fn sensor_entity(&self) -> Result<&MediaEntity> {
        self.graph.sensor_entity()
    }

    pub fn video_entity(&self) -> Result<&MediaEntity> {
        self.graph.video_entity()
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    /// Negotiate the format of the event stream currently configured on the device.
    pub fn format(&self) -> Result<StreamFormat> {
        let video = self.video_entity()?.file()?;
        let format = node_format(video, self.capability.queue)
            .map_err(|e| Error::connection("VIDIOC_G_FMT failed", e))?;
        let crop_bounds = match self.crop_bounds() {
            Ok(rect) => Some(rect),
            Err(e) => {
                trace!("no crop bounds, using video node geometry: {}", e);
                None
            }
        };

        StreamFormat::negotiate(
            format.pixel_format,
            format.width,
            format.height,
            crop_bounds,
            Some(&self.controls),
        )
    }

    fn selection(&self, target: SelectionTarget) -> Result<Rect> {
        let sensor = self.sensor_entity()?.file()?;
        get_selection(sensor, target).map_err(|e| {
            Error::connection(format!("failed to get {:?} selection", target), e)
        })
    }

    pub fn crop_bounds(&self) -> Result<Rect> {
        self.selection(SelectionTarget::CropBounds)
    }

    pub fn native_size(&self) -> Result<Rect> {
        self.selection(SelectionTarget::NativeSize)
    }

    /// Whether the sensor supports cropping.
    pub fn can_crop(&self) -> bool {
        self.crop().is_ok()
    }

    /// The current crop rectangle.
    pub fn crop(&self) -> Result<Rect> {
        self.selection(SelectionTarget::Crop)
    }

    /// Set the crop rectangle and return the one applied by the driver.
    pub fn set_crop(&self, rect: Rect) -> Result<Rect> {
        let sensor = self.sensor_entity()?.file()?;
        let applied = set_selection(sensor, SelectionTarget::Crop, rect)
            .map_err(|e| Error::connection("failed to set crop selection", e))?;
        info!("crop set to {:?}", applied);

        Ok(applied)
    }

    /// The driver exposes no reset operation, so this only traces the request.
    pub fn reset(&self) -> Result<()> {
        trace!("reset requested on {}", self.path.display());
        Ok(())
    }

    /// A capture queue on a duplicate of the video node descriptor, to build a `DataTransfer`.
    pub fn capture_queue(&self) -> Result<V4l2CaptureNode> {
        let file = self
            .video_entity()?
            .file()?
            .try_clone()
            .map_err(|e| Error::connection("cannot duplicate video node descriptor", e))?;

        Ok(V4l2CaptureNode::new(file, self.capability.queue))
    }
}

impl StreamControl for V4l2DeviceControl {
    fn start(&self) -> Result<()> {
        let video = self.video_entity()?.file()?;
        v4l2r::ioctl::streamon(video, self.capability.queue)
            .map_err(|e| v4l2_error("VIDIOC_STREAMON failed", e))?;
        debug!("streaming started on {}", self.path.display());

        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let video = self.video_entity()?.file()?;
        v4l2r::ioctl::streamoff(video, self.capability.queue)
            .map_err(|e| v4l2_error("VIDIOC_STREAMOFF failed", e))?;
        debug!("streaming stopped on {}", self.path.display());

        Ok(())
    }
}
