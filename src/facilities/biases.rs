// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Low-level sensor biases.
//!
//! Every sensor control whose name starts with `bias_` is a bias. On IMX636 sensors bias values
//! are expressed relative to the control default, elsewhere they are the raw register values.

use std::collections::BTreeMap;

use log::info;
use log::trace;
use log::warn;

use crate::controls::Control;
use crate::controls::ControlError;
use crate::controls::Controls;
use crate::facilities::identification::SensorInfo;

const BIAS_PREFIX: &str = "bias_";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BiasesConfig {
    /// Accept any value the bias register can hold instead of only the recommended range.
    pub range_check_bypass: bool,
}

/// Ranges of a bias, in the same unit as the values of `Biases::get` and `Biases::set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasInfo {
    /// Values the bias register can hold.
    pub allowed_range: (i32, i32),
    /// Values accepted by the driver.
    pub recommended_range: (i32, i32),
}

impl BiasInfo {
    fn contains(&self, value: i32, bypass: bool) -> bool {
        let (min, max) = if bypass {
            self.allowed_range
        } else {
            self.recommended_range
        };
        (min..=max).contains(&value)
    }
}

pub struct Biases<'a> {
    controls: &'a Controls,
    relative: bool,
    bit_width: u32,
    config: BiasesConfig,
}

impl<'a> Biases<'a> {
    /// Set up bias access for `sensor`. All biases are reset to their default value.
    pub fn new(
        controls: &'a Controls,
        sensor: &SensorInfo,
        config: BiasesConfig,
    ) -> Result<Self, ControlError> {
        let (relative, bit_width) = if sensor.is_imx636() {
            (true, 8)
        } else {
            (false, 7)
        };
        trace!(
            "biases of {}: relative {}, max value {}",
            sensor.name,
            relative,
            (1u32 << bit_width) - 1
        );

        let biases = Self {
            controls,
            relative,
            bit_width,
            config,
        };
        for control in biases.bias_controls() {
            control.reset()?;
        }

        Ok(biases)
    }

    fn bias_controls(&self) -> impl Iterator<Item = Control<'a>> {
        self.controls
            .iter()
            .filter(|c| c.name().starts_with(BIAS_PREFIX))
    }

    fn bias(&self, name: &str) -> Result<Control<'a>, ControlError> {
        if !name.starts_with(BIAS_PREFIX) {
            return Err(ControlError::NotFound(name.to_owned()));
        }
        self.controls.get(name)
    }

    fn offset(&self, control: &Control<'_>) -> i32 {
        if self.relative {
            control.info().default_value
        } else {
            0
        }
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn info(&self, name: &str) -> Result<BiasInfo, ControlError> {
        let control = self.bias(name)?;
        let offset = self.offset(&control);
        let register_max = (1i32 << self.bit_width) - 1;

        Ok(BiasInfo {
            allowed_range: (-offset, register_max - offset),
            recommended_range: (
                control.info().minimum - offset,
                control.info().maximum - offset,
            ),
        })
    }

    pub fn set(&self, name: &str, value: i32) -> Result<(), ControlError> {
        let control = self.bias(name)?;
        let info = self.info(name)?;
        if !info.contains(value, self.config.range_check_bypass) {
            let (min, max) = if self.config.range_check_bypass {
                info.allowed_range
            } else {
                info.recommended_range
            };
            return Err(ControlError::OutOfRange {
                name: name.to_owned(),
                value,
                min,
                max,
            });
        }

        let raw = if self.relative {
            let current = control.get_int()?;
            trace!("{} was {}", name, current - self.offset(&control));
            value + self.offset(&control)
        } else {
            value
        };
        control.set_int(raw)?;
        info!("bias {} set to {}", name, value);

        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<i32, ControlError> {
        let control = self.bias(name)?;
        Ok(control.get_int()? - self.offset(&control))
    }

    /// Current value of every bias. Biases that cannot be read are left out.
    pub fn all(&self) -> BTreeMap<String, i32> {
        self.bias_controls()
            .filter_map(|control| match control.get_int() {
                Ok(value) => Some((control.name().to_owned(), value - self.offset(&control))),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeControls;

    fn fake() -> FakeControls {
        FakeControls::new()
            .with_int("bias_diff_on", 0, 255, 100)
            .with_int("bias_fo", 10, 100, 40)
            .with_menu("sync_mode", 2)
    }

    #[test]
    fn biases_are_reset_on_creation() {
        let fake = fake();
        let controls = Controls::enumerate(fake.clone()).unwrap();
        controls.get("bias_fo").unwrap().set_int(77).unwrap();
        fake.clear_writes();

        Biases::new(
            &controls,
            &SensorInfo::from_entity_name("genx320"),
            BiasesConfig::default(),
        )
        .unwrap();

        assert_eq!(fake.value("bias_fo"), 40);
        let mut writes = fake.writes();
        writes.sort();
        assert_eq!(
            writes,
            vec![("bias_diff_on".into(), 100), ("bias_fo".into(), 40)]
        );
    }

    #[test]
    fn imx636_biases_are_relative_to_default() {
        let fake = fake();
        let controls = Controls::enumerate(fake.clone()).unwrap();
        let biases = Biases::new(
            &controls,
            &SensorInfo::from_entity_name("imx636 1-003c"),
            BiasesConfig::default(),
        )
        .unwrap();
        assert!(biases.is_relative());

        biases.set("bias_diff_on", 10).unwrap();
        assert_eq!(fake.value("bias_diff_on"), 110);
        assert_eq!(biases.get("bias_diff_on").unwrap(), 10);

        biases.set("bias_diff_on", -20).unwrap();
        assert_eq!(fake.value("bias_diff_on"), 80);

        let info = biases.info("bias_diff_on").unwrap();
        assert_eq!(info.allowed_range, (-100, 155));
        assert_eq!(info.recommended_range, (-100, 155));

        let all = biases.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bias_diff_on"], -20);
        assert_eq!(all["bias_fo"], 0);
    }

    #[test]
    fn other_sensors_use_raw_values() {
        let fake = fake();
        let controls = Controls::enumerate(fake.clone()).unwrap();
        let biases = Biases::new(
            &controls,
            &SensorInfo::from_entity_name("genx320"),
            BiasesConfig::default(),
        )
        .unwrap();
        assert!(!biases.is_relative());

        biases.set("bias_fo", 50).unwrap();
        assert_eq!(fake.value("bias_fo"), 50);
        assert_eq!(biases.get("bias_fo").unwrap(), 50);

        let info = biases.info("bias_fo").unwrap();
        assert_eq!(info.allowed_range, (0, 127));
        assert_eq!(info.recommended_range, (10, 100));
    }

    #[test]
    fn range_check() {
        let fake = fake();
        let controls = Controls::enumerate(fake.clone()).unwrap();
        let sensor = SensorInfo::from_entity_name("genx320");

        let biases = Biases::new(&controls, &sensor, BiasesConfig::default()).unwrap();
        assert!(matches!(
            biases.set("bias_fo", 110),
            Err(ControlError::OutOfRange { min: 10, max: 100, .. })
        ));
        assert!(matches!(
            biases.set("sync_mode", 1),
            Err(ControlError::NotFound(_))
        ));

        let bypass = Biases::new(
            &controls,
            &sensor,
            BiasesConfig {
                range_check_bypass: true,
            },
        )
        .unwrap();
        // Within the register range, the value goes to the driver which has the last word.
        assert!(matches!(
            bypass.set("bias_fo", 110),
            Err(ControlError::Io { .. })
        ));
        assert!(matches!(
            bypass.set("bias_fo", 128),
            Err(ControlError::OutOfRange { min: 0, max: 127, .. })
        ));
    }
}
