// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Power-budget allocation controller.
//!
//! Each control tick receives one (target, current) power sample and
//! greedily moves the BE workload's footprint toward the target by
//! capping, pausing, and resuming GPUs. The capped stack keeps the
//! search O(1) per step: only the stack top ever holds a cap strictly
//! inside its supported range, everything below sits at max.

use crate::resource::GpuResourceManager;
use crate::state::CapState;
use crate::state::CappedStack;
use crate::state::RunState;
use crate::state::WorkloadClass;
use crate::state::WorkloadRecord;
use crate::state::WorkloadStateStore;
use crate::stats::Metrics;
use crate::wire::RunnerClient;
use anyhow::bail;
use anyhow::Result;
use gfr_utils::CapRange;
use gfr_utils::RunnerCommand;
use gfr_utils::MAX_CUS;
use log::debug;
use log::info;
use log::warn;
use std::time::Duration;
use std::time::Instant;

pub struct ControllerConfig {
    pub nr_gpus: u32,
    pub be_app: String,
    pub lc_app: String,
    pub lc_model: String,
    pub lc_batch_size: u32,
}

pub struct PowerController {
    cfg: ControllerConfig,
    envelope: CapRange,
    resources: GpuResourceManager,
    runner: Box<dyn RunnerClient>,
    state: WorkloadStateStore,
    stack: CappedStack,
    metrics: Metrics,
    lc_gpus_needed: u32,
    cleaned_up: bool,
}

impl PowerController {
    pub fn new(
        cfg: ControllerConfig,
        envelope: CapRange,
        resources: GpuResourceManager,
        runner: Box<dyn RunnerClient>,
    ) -> Self {
        Self {
            cfg,
            envelope,
            resources,
            runner,
            state: WorkloadStateStore::new(),
            stack: CappedStack::new(),
            metrics: Metrics::new(),
            lc_gpus_needed: 0,
            cleaned_up: false,
        }
    }

    fn channel(&self, class: WorkloadClass) -> String {
        match class {
            WorkloadClass::Be => self.cfg.be_app.clone(),
            WorkloadClass::Lc => self.cfg.lc_app.clone(),
        }
    }

    /// GPU scan order for registration and resume. BE walks ids high
    /// to low so LC keeps the low ids free longest; LC walks low to
    /// high. Pause uses the reverse of resume, so the most recently
    /// resumed BE GPU is found first.
    fn scan_order(&self, class: WorkloadClass, for_pause: bool) -> Vec<u32> {
        let descending = class.is_be() != for_pause;
        if descending {
            (0..self.cfg.nr_gpus).rev().collect()
        } else {
            (0..self.cfg.nr_gpus).collect()
        }
    }

    fn request_ok(&mut self, class: WorkloadClass, cmd: &RunnerCommand) -> bool {
        let channel = self.channel(class);
        match self.runner.request(&channel, cmd) {
            Ok(rep) if rep.ok => true,
            Ok(_) => {
                warn!("Runner rejected ({}) {}", channel, cmd);
                false
            }
            Err(err) => {
                warn!("Runner request ({}) {} failed: {}", channel, cmd, err);
                self.metrics.wire_failures.increment(1);
                false
            }
        }
    }

    /// Register the first unregistered GPU in scan order with a
    /// workload class and hand it the full CU complement.
    pub fn add_one_gpu(&mut self, class: WorkloadClass) -> Option<u32> {
        if self.state.class(class).len() == self.cfg.nr_gpus as usize {
            return None;
        }
        for gpu in self.scan_order(class, false) {
            if self.state.record(class, gpu).is_some() {
                continue;
            }
            let cmd = match class {
                WorkloadClass::Be => RunnerCommand::AddGpu { gpu },
                WorkloadClass::Lc => RunnerCommand::AddLcGpu {
                    model: self.cfg.lc_model.clone(),
                    gpu,
                    batch_size: self.cfg.lc_batch_size,
                },
            };
            if !self.request_ok(class, &cmd) {
                return None;
            }

            // LC always takes the full mask. BE only masks GPUs that
            // LC does not hold; on shared GPUs the classes time-share
            // under LC's mask.
            let channel = self.channel(class);
            if !class.is_be() {
                if !self.resources.add_cu(&channel, gpu, MAX_CUS as usize, false) {
                    warn!("Could not allocate all CUs on gpu {} for LC", gpu);
                    return None;
                }
            } else if self.state.record(WorkloadClass::Lc, gpu).is_none()
                && !self.resources.add_cu(&channel, gpu, MAX_CUS as usize, true)
            {
                warn!("Could not allocate all CUs on gpu {} for BE", gpu);
                return None;
            }

            self.state.insert(
                class,
                gpu,
                WorkloadRecord {
                    state: RunState::Running,
                    cap: CapState::at_max(self.envelope),
                    cus: MAX_CUS,
                },
            );
            info!("gpu {} added to {:?} running", gpu, class);
            return Some(gpu);
        }
        None
    }

    /// Pause the first running GPU in pause scan order. A rejected
    /// request counts as "no GPU available". A paused BE GPU leaves
    /// the capped stack immediately.
    pub fn pause_one_gpu(&mut self, class: WorkloadClass) -> Option<u32> {
        for gpu in self.scan_order(class, true) {
            let Some(record) = self.state.record(class, gpu) else {
                continue;
            };
            if record.state == RunState::Paused {
                continue;
            }
            let cmd = match class {
                WorkloadClass::Be => RunnerCommand::PauseGpu { gpu },
                WorkloadClass::Lc => RunnerCommand::PauseLcGpu {
                    model: self.cfg.lc_model.clone(),
                    gpu,
                },
            };
            if !self.request_ok(class, &cmd) {
                return None;
            }
            if let Some(record) = self.state.record_mut(class, gpu) {
                record.state = RunState::Paused;
            }
            if class.is_be() {
                self.stack.remove(gpu);
            }
            self.metrics.gpu_pauses.increment(1);
            info!("gpu {} for {:?} paused", gpu, class);
            return Some(gpu);
        }
        None
    }

    /// Resume the first paused GPU in resume scan order and push it on
    /// top of the capped stack.
    pub fn resume_one_gpu(&mut self, class: WorkloadClass) -> Option<u32> {
        for gpu in self.scan_order(class, false) {
            let Some(record) = self.state.record(class, gpu) else {
                continue;
            };
            if record.state == RunState::Running {
                continue;
            }
            let cmd = match class {
                WorkloadClass::Be => RunnerCommand::ResumeGpu { gpu },
                WorkloadClass::Lc => RunnerCommand::ResumeLcGpu {
                    model: self.cfg.lc_model.clone(),
                    gpu,
                },
            };
            if !self.request_ok(class, &cmd) {
                return None;
            }
            if let Some(record) = self.state.record_mut(class, gpu) {
                record.state = RunState::Running;
            }
            if class.is_be() {
                self.stack.push(gpu);
            }
            self.metrics.gpu_resumes.increment(1);
            info!("gpu {} for {:?} resumed", gpu, class);
            return Some(gpu);
        }
        None
    }

    /// Sum of the caps of the running BE GPUs.
    pub fn internal_power(&self) -> u32 {
        self.stack
            .iter()
            .filter_map(|gpu| self.state.record(WorkloadClass::Be, gpu))
            .map(|record| record.cap.current)
            .sum()
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn be_cap(&self, gpu: u32) -> u32 {
        self.state
            .record(WorkloadClass::Be, gpu)
            .map_or(self.envelope.max_supported, |record| record.cap.current)
    }

    /// Change one BE GPU's cap, wire first, bookkeeping after. A
    /// failed send leaves the record untouched so local state never
    /// runs ahead of the agent.
    fn cap_be_gpu(&mut self, gpu: u32, cap: u32) -> bool {
        let app = self.cfg.be_app.clone();
        if !self.resources.set_freq(&app, gpu, cap) {
            self.metrics.wire_failures.increment(1);
            return false;
        }
        if let Some(record) = self.state.record_mut(WorkloadClass::Be, gpu) {
            record.cap.current = cap;
        }
        self.metrics.cap_changes.increment(1);
        true
    }

    /// After a pause, park the GPU's cap at max so the next resume
    /// starts from a known point.
    fn park_paused_gpu(&mut self, gpu: u32) -> bool {
        self.cap_be_gpu(gpu, self.envelope.max_supported)
    }

    /// Move realized power down toward the target. Works the capped
    /// stack top first: shave its cap toward min, then pause whole
    /// GPUs. Stops when the remaining surplus is within a watt, the
    /// stack drains, or the agent stops cooperating; any unmet amount
    /// simply persists into the next sample. There is no retry within
    /// a tick, so a transient remote failure is only corrected by the
    /// next control sample.
    pub fn decrease_power(&mut self, target: f64, current: f64) {
        let mut amount = current - target;
        if amount <= 1.0 {
            return;
        }
        let min = self.envelope.min_supported;
        debug!(
            "decrease: cur {:.0} target {:.0} amount {:.0}",
            current, target, amount
        );

        while amount > 1.0 {
            let Some(tos) = self.stack.top() else {
                break;
            };
            let tos_cap = self.be_cap(tos);
            let down_room = tos_cap.saturating_sub(min);
            debug!(
                "decrease loop: tos {} cap {} down_room {} amount {:.0}",
                tos, tos_cap, down_room, amount
            );

            if amount > tos_cap as f64 {
                // The whole GPU is worth less than the remaining cut.
                let Some(paused) = self.pause_one_gpu(WorkloadClass::Be) else {
                    warn!("No GPU to pause, surplus {:.0}W carries over", amount);
                    break;
                };
                if !self.park_paused_gpu(paused) {
                    break;
                }
                amount -= tos_cap as f64;
            } else if down_room > 0 {
                if amount > down_room as f64 {
                    if !self.cap_be_gpu(tos, min) {
                        break;
                    }
                    amount -= down_room as f64;
                } else {
                    let new_cap = tos_cap - amount.round() as u32;
                    if !self.cap_be_gpu(tos, new_cap) {
                        break;
                    }
                    amount = 0.0;
                }
            } else if amount < min as f64 / 2.0 {
                // Residual too small to act on; treat the floor as done.
                if !self.cap_be_gpu(tos, min) {
                    break;
                }
                amount = 0.0;
            } else {
                let Some(paused) = self.pause_one_gpu(WorkloadClass::Be) else {
                    warn!("No GPU to pause, surplus {:.0}W carries over", amount);
                    break;
                };
                if !self.park_paused_gpu(paused) {
                    break;
                }
                amount -= tos_cap as f64;
            }
        }

        if amount > 1.0 {
            self.metrics.unmet_watts.increment(amount as u64);
        }
    }

    /// Move realized power up toward the target, the mirror of
    /// decrease: raise the stack top toward max, then resume whole
    /// GPUs. Deficits below min/2 are left for the next sample.
    pub fn increase_power(&mut self, target: f64, current: f64) {
        let mut amount = target - current;
        if amount <= 1.0 {
            return;
        }
        let min = self.envelope.min_supported;
        let max = self.envelope.max_supported;
        debug!(
            "increase: cur {:.0} target {:.0} amount {:.0}",
            current, target, amount
        );

        if self.stack.is_empty() {
            let Some(resumed) = self.resume_one_gpu(WorkloadClass::Be) else {
                warn!("No GPU to resume, deficit {:.0}W carries over", amount);
                self.metrics.unmet_watts.increment(amount as u64);
                return;
            };
            if !self.cap_be_gpu(resumed, min) {
                return;
            }
            amount -= min as f64;
        }

        while amount > 1.0 {
            let Some(tos) = self.stack.top() else {
                break;
            };
            let tos_cap = self.be_cap(tos);
            let up_room = max.saturating_sub(tos_cap);
            debug!(
                "increase loop: tos {} cap {} up_room {} amount {:.0}",
                tos, tos_cap, up_room, amount
            );

            if up_room > 0 {
                if amount > up_room as f64 {
                    if !self.cap_be_gpu(tos, max) {
                        break;
                    }
                    amount -= up_room as f64;
                } else {
                    let new_cap = tos_cap + amount.round() as u32;
                    if !self.cap_be_gpu(tos, new_cap) {
                        break;
                    }
                    amount = 0.0;
                }
            } else if amount > max as f64 {
                let Some(resumed) = self.resume_one_gpu(WorkloadClass::Be) else {
                    warn!("No GPU to resume, deficit {:.0}W carries over", amount);
                    break;
                };
                if !self.cap_be_gpu(resumed, max) {
                    break;
                }
                amount -= max as f64;
            } else if amount > min as f64 / 2.0 {
                let new_cap = (amount.round() as u32).clamp(min, max);
                let Some(resumed) = self.resume_one_gpu(WorkloadClass::Be) else {
                    warn!("No GPU to resume, deficit {:.0}W carries over", amount);
                    break;
                };
                if !self.cap_be_gpu(resumed, new_cap) {
                    break;
                }
                amount = 0.0;
            } else {
                // Remaining deficit too small to wake another GPU for.
                break;
            }
        }

        if amount > 1.0 {
            self.metrics.unmet_watts.increment(amount as u64);
        }
    }

    /// One synchronous control step. Returns how long the state
    /// mutations and wire calls took, so the driver can sleep out the
    /// rest of the tick interval.
    pub fn tick(&mut self, target: f64, current: f64) -> Duration {
        let started_at = Instant::now();
        self.metrics.target_power.set(target);
        self.metrics.current_power.set(current);

        if target > current {
            self.increase_power(target, current);
        } else {
            self.decrease_power(target, current);
        }

        self.metrics.internal_power.set(self.internal_power() as f64);
        self.metrics.stack_depth.set(self.stack.len() as f64);
        let elapsed = started_at.elapsed();
        self.metrics.tick_duration.record(elapsed.as_micros() as f64);
        elapsed
    }

    /// Register both workloads on every GPU: LC runs on the first
    /// ceil(load% * nr_gpus) ids and is paused beyond that; BE is
    /// registered everywhere and starts fully paused, to be woken by
    /// the control loop.
    pub fn setup(&mut self, lc_avg_load_pct: u32) -> Result<()> {
        if lc_avg_load_pct == 0 || lc_avg_load_pct > 100 {
            bail!(
                "LC load must be in (0, 100], given {}",
                lc_avg_load_pct
            );
        }
        for class in [WorkloadClass::Be, WorkloadClass::Lc] {
            if !self.request_ok(class, &RunnerCommand::Start) {
                bail!("Failed to start the {:?} workload server", class);
            }
        }

        self.lc_gpus_needed =
            ((lc_avg_load_pct as f64 / 100.0) * self.cfg.nr_gpus as f64).ceil() as u32;
        info!(
            "Registering workloads: avg LC load {}%, {} of {} GPUs needed for LC",
            lc_avg_load_pct, self.lc_gpus_needed, self.cfg.nr_gpus
        );

        for g in 0..self.cfg.nr_gpus {
            if self.add_one_gpu(WorkloadClass::Lc).is_none() {
                bail!("Failed adding gpu {}/{} to LC", g, self.cfg.nr_gpus);
            }
            if g >= self.lc_gpus_needed && self.pause_one_gpu(WorkloadClass::Lc).is_none() {
                bail!("Failed pausing gpu {}/{} for LC", g, self.cfg.nr_gpus);
            }
        }
        for g in 0..self.cfg.nr_gpus {
            if self.add_one_gpu(WorkloadClass::Be).is_none() {
                bail!("Failed adding gpu {}/{} to BE", g, self.cfg.nr_gpus);
            }
            if self.pause_one_gpu(WorkloadClass::Be).is_none() {
                bail!("Failed pausing gpu {}/{} for BE", g, self.cfg.nr_gpus);
            }
        }
        info!(
            "{} (BE) and {} (LC, {} active) are ready",
            self.cfg.be_app, self.cfg.lc_app, self.lc_gpus_needed
        );
        Ok(())
    }

    /// Stop both workload servers and release every cap the run
    /// touched. Idempotent; also invoked from Drop so abnormal exits
    /// still reset the hardware.
    pub fn shutdown(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        info!("Controller teardown: resetting touched GPU caps");
        for class in [WorkloadClass::Be, WorkloadClass::Lc] {
            self.request_ok(class, &RunnerCommand::Stop);
        }
        self.resources.cleanup();
        self.stack.clear();
        self.state.clear();
    }
}

impl Drop for PowerController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
