// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Externally supplied power-model data.
//!
//! The regression/optimization that produces these numbers runs
//! elsewhere; this module only loads its output: per-CU-count-tier
//! supported cap ranges for the BE workload, and the regulation plan
//! (average power plus up/down provisioning range) the controller
//! tracks.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Supported power-cap range for one CU-count tier, in watts.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CapRange {
    pub min_supported: u32,
    pub max_supported: u32,
}

/// Per-tier cap ranges for the BE workload, keyed by CU count.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PowerModel {
    power2cap: BTreeMap<u32, CapRange>,
}

impl PowerModel {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read power model {:?}", path))?;
        let model: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse power model {:?}", path))?;
        if model.power2cap.is_empty() {
            return Err(anyhow!("Power model {:?} has no cap tiers", path));
        }
        Ok(model)
    }

    pub fn cap_range(&self, cus: u32) -> Option<CapRange> {
        self.power2cap.get(&cus).copied()
    }

    /// The envelope the controller caps against. Always the 60-CU tier,
    /// whatever the live mask width is.
    //
    // TODO: key this off the GPU's current BE CU count once per-tier
    // profiles are collected for the masked configurations.
    pub fn envelope(&self) -> Result<CapRange> {
        self.cap_range(crate::MAX_CUS)
            .ok_or_else(|| anyhow!("Power model is missing the {}-CU tier", crate::MAX_CUS))
    }
}

/// Output of the market optimizer for one regulation window.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RegulationPlan {
    /// Average power to hold between regulation events, watts.
    pub fr_power: f64,
    /// Committed regulation-up range (maximum decrease), watts.
    pub reg_up: f64,
    /// Committed regulation-down range (maximum increase), watts.
    pub reg_down: f64,
    #[serde(default)]
    pub baseline_power: f64,
}

impl RegulationPlan {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read regulation plan {:?}", path))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse regulation plan {:?}", path))
    }

    /// Target power for one signal sample in [-1, 1].
    ///
    /// With a symmetric provisioning range the signal's sign picks
    /// which committed range applies; otherwise only the downward
    /// (increase) range was committed and scales both directions.
    pub fn target_power(&self, rs_val: f64, symmetric_range: bool) -> f64 {
        let range = if symmetric_range {
            if rs_val > 0.0 {
                self.reg_down
            } else {
                self.reg_up
            }
        } else {
            self.reg_down
        };
        self.fr_power + range * rs_val
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MODEL_JSON: &str = r#"{
        "power2cap": {
            "15": { "min_supported": 30, "max_supported": 120 },
            "60": { "min_supported": 50, "max_supported": 225 }
        }
    }"#;

    #[test]
    fn test_load_model() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MODEL_JSON.as_bytes()).unwrap();

        let model = PowerModel::load(file.path()).unwrap();
        assert_eq!(
            model.cap_range(15),
            Some(CapRange {
                min_supported: 30,
                max_supported: 120
            })
        );
        assert_eq!(model.cap_range(30), None);

        let env = model.envelope().unwrap();
        assert_eq!(env.min_supported, 50);
        assert_eq!(env.max_supported, 225);
    }

    #[test]
    fn test_envelope_requires_full_tier() {
        let model: PowerModel =
            serde_json::from_str(r#"{ "power2cap": { "15": { "min_supported": 30, "max_supported": 120 } } }"#)
                .unwrap();
        assert!(model.envelope().is_err());
    }

    #[test]
    fn test_target_power() {
        let plan = RegulationPlan {
            fr_power: 800.0,
            reg_up: 200.0,
            reg_down: 100.0,
            baseline_power: 900.0,
        };
        assert_eq!(plan.target_power(0.5, false), 850.0);
        assert_eq!(plan.target_power(-1.0, false), 700.0);
        assert_eq!(plan.target_power(0.5, true), 850.0);
        assert_eq!(plan.target_power(-1.0, true), 600.0);
    }
}
