// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::device::V4l2DeviceControl;
use crate::error::Result;
use crate::format::StreamFormat;

/// Generation and name of a sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorInfo {
    pub major_version: u32,
    pub minor_version: u32,
    pub name: String,
}

impl SensorInfo {
    /// Identify the sensor from the name of its subdevice entity.
    pub fn from_entity_name(entity_name: &str) -> Self {
        let (major_version, minor_version, name) = if entity_name.starts_with("imx636") {
            (4, 2, "IMX636")
        } else if entity_name.starts_with("genx320") {
            (320, 0, "GenX320")
        } else {
            (0, 0, "Unknown sensor")
        };

        Self {
            major_version,
            minor_version,
            name: name.to_owned(),
        }
    }

    pub fn is_imx636(&self) -> bool {
        self.name == "IMX636"
    }
}

/// Identity of a connected camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwIdentification {
    sensor_info: SensorInfo,
    serial: String,
    integrator: String,
    connection_type: String,
    format: StreamFormat,
}

impl HwIdentification {
    pub fn new(device: &V4l2DeviceControl) -> Result<Self> {
        let sensor_name = device.sensor_entity()?.name();
        let capability = device.capability();

        Ok(Self {
            sensor_info: SensorInfo::from_entity_name(&sensor_name),
            serial: sensor_name,
            integrator: capability.driver.clone(),
            connection_type: capability.bus_info.clone(),
            format: device.format()?,
        })
    }

    pub fn sensor_info(&self) -> &SensorInfo {
        &self.sensor_info
    }

    /// The sensor subdevice name, which identifies the camera on the system.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Name of the capture driver.
    pub fn integrator(&self) -> &str {
        &self.integrator
    }

    /// Bus information of the capture device.
    pub fn connection_type(&self) -> &str {
        &self.connection_type
    }

    /// The stream format, rendered with its options.
    pub fn current_data_encoding_format(&self) -> String {
        self.format.to_string()
    }

    /// Names of the encodings the camera can produce. Only the current one is reported.
    pub fn available_data_encoding_formats(&self) -> Vec<String> {
        vec![self.format.encoding().name().to_owned()]
    }
}
