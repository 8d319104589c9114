// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lookup of the event sensors connected to the system.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use log::debug;
use log::info;
use log::warn;

use crate::device::V4l2DeviceControl;
use crate::error::Error;
use crate::error::Result;

const DEV_DIR: &str = "/dev";
const MEDIA_NODE_PREFIX: &str = "media";

fn open_camera(path: &Path) -> anyhow::Result<(String, V4l2DeviceControl)> {
    let device = V4l2DeviceControl::open(path)
        .with_context(|| format!("skipping {}", path.display()))?;
    let serial = device
        .sensor_entity()
        .with_context(|| format!("skipping {}", path.display()))?
        .name();

    Ok((serial, device))
}

/// Cameras found on media controller nodes, keyed by serial.
#[derive(Default)]
pub struct CameraDiscovery {
    cameras: Vec<(String, V4l2DeviceControl)>,
}

impl CameraDiscovery {
    /// Try every `/dev/media*` node.
    pub fn scan() -> Result<Self> {
        let entries = std::fs::read_dir(DEV_DIR)
            .map_err(|e| Error::connection(format!("cannot list {}", DEV_DIR), e))?;
        let mut paths = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(MEDIA_NODE_PREFIX)
            })
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        paths.sort();

        Ok(Self::scan_paths(paths))
    }

    /// Try each of `paths`. Nodes that cannot be opened as a camera are logged and left out.
    pub fn scan_paths<I: IntoIterator<Item = PathBuf>>(paths: I) -> Self {
        let mut cameras = Vec::new();
        for path in paths {
            debug!("probing {}", path.display());
            match open_camera(&path) {
                Ok((serial, device)) => {
                    info!("found camera {:?} on {}", serial, path.display());
                    cameras.push((serial, device));
                }
                Err(e) => warn!("{:#}", e),
            }
        }

        Self { cameras }
    }

    /// Serials of the cameras found.
    pub fn list(&self) -> Vec<String> {
        self.cameras.iter().map(|(serial, _)| serial.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Hand out the camera with `serial`, or the first camera if none matches.
    pub fn take(&mut self, serial: &str) -> Result<V4l2DeviceControl> {
        let position = match self.cameras.iter().position(|(s, _)| s == serial) {
            Some(position) => position,
            None if self.cameras.is_empty() => return Err(Error::NotFound("camera")),
            None => {
                if !serial.is_empty() {
                    info!("no camera {:?}, using {:?}", serial, self.cameras[0].0);
                }
                0
            }
        };

        Ok(self.cameras.remove(position).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unusable_nodes_are_skipped() {
        let mut discovery = CameraDiscovery::scan_paths(vec![
            PathBuf::from("/dev/does-not-exist-media0"),
            std::env::temp_dir(),
            PathBuf::from("/dev/null"),
        ]);

        assert!(discovery.is_empty());
        assert!(discovery.list().is_empty());
        assert!(matches!(discovery.take(""), Err(Error::NotFound(_))));
    }

    #[test]
    fn scan_does_not_fail_without_cameras() {
        // Whatever the host has, scanning must not error out on unusable nodes.
        let discovery = CameraDiscovery::scan().unwrap();
        assert_eq!(discovery.list().len(), discovery.len());
    }
}
