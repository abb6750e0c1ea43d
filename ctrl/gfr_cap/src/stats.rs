// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use metrics::counter;
use metrics::gauge;
use metrics::histogram;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;

pub struct Metrics {
    pub gpu_resumes: Counter,
    pub gpu_pauses: Counter,
    pub cap_changes: Counter,
    pub wire_failures: Counter,
    pub unmet_watts: Counter,

    pub target_power: Gauge,
    pub current_power: Gauge,
    pub internal_power: Gauge,
    pub stack_depth: Gauge,

    pub tick_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            gpu_resumes: counter!("gpu_transitions_total", "type" => "resume"),
            gpu_pauses: counter!("gpu_transitions_total", "type" => "pause"),
            cap_changes: counter!("cap_changes_total"),
            wire_failures: counter!("wire_failures_total"),
            unmet_watts: counter!("unmet_watts_total"),

            target_power: gauge!("target_power_watts"),
            current_power: gauge!("current_power_watts"),
            internal_power: gauge!("internal_power_watts"),
            stack_depth: gauge!("capped_stack_depth"),

            tick_duration: histogram!("tick_duration_us"),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
