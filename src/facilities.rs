// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sensor facilities built on top of the device control object.
//!
//! [identification] reports what sensor is connected and how. [biases] gives access to the
//! low-level analog biases of the sensor, and [sync] selects how several cameras synchronize
//! their clocks. The last two only borrow the control registry of the device.

pub mod biases;
pub mod identification;
pub mod sync;

pub use biases::BiasInfo;
pub use biases::Biases;
pub use biases::BiasesConfig;
pub use identification::HwIdentification;
pub use identification::SensorInfo;
pub use sync::SyncMode;
pub use sync::Synchronization;
