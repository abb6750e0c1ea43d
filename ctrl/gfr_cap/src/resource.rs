// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! GPU resource manager.
//!
//! Owns, per GPU, the three disjoint CU pools (free / BE / LC) and
//! turns pool changes into `SET_CUMASK` commands and cap changes into
//! `SET_FREQ` commands on the owning application's channel. Pool
//! state only commits after the wire send succeeds, so the local
//! bookkeeping never runs ahead of a dead agent.

use crate::wire::CommandSink;
use clap::ValueEnum;
use gfr_utils::CuMask;
use gfr_utils::ResourceCommand;
use gfr_utils::CAP_MAX_WATTS;
use gfr_utils::CAP_MIN_WATTS;
use gfr_utils::MAX_CUS;
use gfr_utils::NR_SHADER_ENGINES;
use log::error;
use log::info;
use log::warn;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// How CUs are picked out of the free pool.
///
/// Simple packs BE and LC from opposite ends of the index space.
/// Packed cycles the shader engines round-robin, one CU per engine in
/// turn, so each workload spreads evenly across engines.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum AllocPolicy {
    Simple,
    Packed,
}

#[derive(Debug)]
struct GpuPools {
    free: BTreeSet<u32>,
    be: BTreeSet<u32>,
    lc: BTreeSet<u32>,
}

impl GpuPools {
    fn new() -> Self {
        Self {
            free: (1..=MAX_CUS).collect(),
            be: BTreeSet::new(),
            lc: BTreeSet::new(),
        }
    }

    fn pool(&self, is_be: bool) -> &BTreeSet<u32> {
        if is_be {
            &self.be
        } else {
            &self.lc
        }
    }

    fn pool_mut(&mut self, is_be: bool) -> &mut BTreeSet<u32> {
        if is_be {
            &mut self.be
        } else {
            &mut self.lc
        }
    }
}

/// Shader engine of a 1-based CU index; engines interleave every
/// fourth CU.
fn shader_engine(cu: u32) -> u32 {
    (cu - 1) % NR_SHADER_ENGINES
}

/// Simple policy draw: BE takes the highest-numbered free CUs, LC the
/// lowest.
fn draw_simple(free: &BTreeSet<u32>, count: usize, is_be: bool) -> Vec<u32> {
    if is_be {
        free.iter().rev().take(count).copied().collect()
    } else {
        free.iter().take(count).copied().collect()
    }
}

/// Simple policy release: the mirror image of the draw, so BE gives
/// back its lowest-held CUs first and LC its highest.
fn release_simple(pool: &BTreeSet<u32>, count: usize, is_be: bool) -> Vec<u32> {
    if is_be {
        pool.iter().take(count).copied().collect()
    } else {
        pool.iter().rev().take(count).copied().collect()
    }
}

/// Packed policy draw: one CU per shader engine in turn, looping. BE
/// cycles engines high to low taking each engine's highest free CU;
/// LC cycles low to high taking the lowest.
fn draw_packed(free: &BTreeSet<u32>, count: usize, is_be: bool) -> Vec<u32> {
    let mut per_se: Vec<Vec<u32>> = vec![Vec::new(); NR_SHADER_ENGINES as usize];
    for cu in free.iter() {
        per_se[shader_engine(*cu) as usize].push(*cu);
    }

    let order: Vec<usize> = if is_be {
        (0..NR_SHADER_ENGINES as usize).rev().collect()
    } else {
        (0..NR_SHADER_ENGINES as usize).collect()
    };

    let mut picked = Vec::with_capacity(count);
    while picked.len() < count {
        let before = picked.len();
        for se in order.iter() {
            let cu = if is_be {
                per_se[*se].pop()
            } else {
                (!per_se[*se].is_empty()).then(|| per_se[*se].remove(0))
            };
            if let Some(cu) = cu {
                picked.push(cu);
                if picked.len() == count {
                    break;
                }
            }
        }
        if picked.len() == before {
            break;
        }
    }
    picked
}

/// Packed policy release: mirror image of the packed draw.
fn release_packed(pool: &BTreeSet<u32>, count: usize, is_be: bool) -> Vec<u32> {
    let mut per_se: Vec<Vec<u32>> = vec![Vec::new(); NR_SHADER_ENGINES as usize];
    for cu in pool.iter() {
        per_se[shader_engine(*cu) as usize].push(*cu);
    }

    let order: Vec<usize> = if is_be {
        (0..NR_SHADER_ENGINES as usize).collect()
    } else {
        (0..NR_SHADER_ENGINES as usize).rev().collect()
    };

    let mut released = Vec::with_capacity(count);
    while released.len() < count {
        let before = released.len();
        for se in order.iter() {
            let cu = if is_be {
                (!per_se[*se].is_empty()).then(|| per_se[*se].remove(0))
            } else {
                per_se[*se].pop()
            };
            if let Some(cu) = cu {
                released.push(cu);
                if released.len() == count {
                    break;
                }
            }
        }
        if released.len() == before {
            break;
        }
    }
    released
}

pub struct GpuResourceManager {
    pools: BTreeMap<u32, GpuPools>,
    policy: AllocPolicy,
    sink: Box<dyn CommandSink>,
    /// (app, GPU) pairs whose cap was changed, reset by cleanup().
    freq_changed: BTreeMap<String, BTreeSet<u32>>,
}

impl GpuResourceManager {
    pub fn new(nr_gpus: u32, policy: AllocPolicy, sink: Box<dyn CommandSink>) -> Self {
        let pools = (0..nr_gpus).map(|gpu| (gpu, GpuPools::new())).collect();
        Self {
            pools,
            policy,
            sink,
            freq_changed: BTreeMap::new(),
        }
    }

    /// Number of CUs a workload class currently holds on a GPU.
    pub fn cu_count(&self, gpu: u32, is_be: bool) -> usize {
        self.pools
            .get(&gpu)
            .map_or(0, |pools| pools.pool(is_be).len())
    }

    pub fn free_count(&self, gpu: u32) -> usize {
        self.pools.get(&gpu).map_or(0, |pools| pools.free.len())
    }

    fn send_mask(&mut self, app_name: &str, gpu: u32, pool: &BTreeSet<u32>) -> bool {
        let mask = match CuMask::from_cus(pool.iter().copied()) {
            Ok(mask) => mask,
            Err(err) => {
                // CU indices never leave [1, 60]; reaching this is a bug.
                error!("CU mask encode failed for gpu {}: {}", gpu, err);
                return false;
            }
        };
        let (mask_low, mask_high) = mask.hex_words();
        info!(
            "Mask for app {} gpu {} generated (low={} high={})",
            app_name, gpu, mask_low, mask_high
        );
        let cmd = ResourceCommand::SetCuMask {
            gpu,
            mask_low,
            mask_high,
        };
        if let Err(err) = self.sink.send(app_name, &cmd) {
            warn!("Failed to send {}: {}", cmd, err);
            return false;
        }
        true
    }

    /// Move `count` CUs from the free pool to a workload's pool and
    /// push the new mask. No state changes unless the send succeeds.
    pub fn add_cu(&mut self, app_name: &str, gpu: u32, count: usize, is_be: bool) -> bool {
        if count == 0 {
            return true;
        }
        let Some(pools) = self.pools.get(&gpu) else {
            warn!("Requested gpu {} is not available", gpu);
            return false;
        };
        if pools.free.len() < count {
            warn!(
                "Requested {} CUs on gpu {} but only {} are free",
                count,
                gpu,
                pools.free.len()
            );
            return false;
        }

        let picked = match self.policy {
            AllocPolicy::Simple => draw_simple(&pools.free, count, is_be),
            AllocPolicy::Packed => draw_packed(&pools.free, count, is_be),
        };
        let mut new_pool = pools.pool(is_be).clone();
        new_pool.extend(picked.iter().copied());

        if !self.send_mask(app_name, gpu, &new_pool) {
            return false;
        }

        let Some(pools) = self.pools.get_mut(&gpu) else {
            return false;
        };
        for cu in picked {
            pools.free.remove(&cu);
            pools.pool_mut(is_be).insert(cu);
        }
        true
    }

    /// Return `count` CUs from a workload's pool to the free pool and
    /// push the new mask. Count 0 is a successful no-op.
    pub fn remove_cu(&mut self, app_name: &str, gpu: u32, count: usize, is_be: bool) -> bool {
        if count == 0 {
            return true;
        }
        let Some(pools) = self.pools.get(&gpu) else {
            warn!("Requested gpu {} is not available", gpu);
            return false;
        };
        if pools.pool(is_be).len() < count {
            warn!(
                "Requested to remove {} CUs on gpu {} but the pool holds {}",
                count,
                gpu,
                pools.pool(is_be).len()
            );
            return false;
        }

        let released = match self.policy {
            AllocPolicy::Simple => release_simple(pools.pool(is_be), count, is_be),
            AllocPolicy::Packed => release_packed(pools.pool(is_be), count, is_be),
        };
        let mut new_pool = pools.pool(is_be).clone();
        for cu in released.iter() {
            new_pool.remove(cu);
        }

        if !self.send_mask(app_name, gpu, &new_pool) {
            return false;
        }

        let Some(pools) = self.pools.get_mut(&gpu) else {
            return false;
        };
        for cu in released {
            pools.pool_mut(is_be).remove(&cu);
            pools.free.insert(cu);
        }
        true
    }

    /// Cap a GPU's power. The cap is per GPU, so a GPU hosting both
    /// workload classes gets a warning before the change goes out.
    pub fn set_freq(&mut self, app_name: &str, gpu: u32, freq: u32) -> bool {
        let Some(pools) = self.pools.get(&gpu) else {
            warn!("Requested gpu {} is not available", gpu);
            return false;
        };
        if !(CAP_MIN_WATTS..=CAP_MAX_WATTS).contains(&freq) {
            warn!(
                "Frequency {} for gpu {} is outside the supported range [{}, {}]",
                freq, gpu, CAP_MIN_WATTS, CAP_MAX_WATTS
            );
            return false;
        }
        if !pools.be.is_empty() && !pools.lc.is_empty() {
            warn!(
                "Both BE and LC hold CUs on gpu {}; capping to {} affects both",
                gpu, freq
            );
        }

        self.freq_changed
            .entry(app_name.to_string())
            .or_default()
            .insert(gpu);

        let cmd = ResourceCommand::SetFreq {
            gpu,
            freq_watts: freq,
        };
        if let Err(err) = self.sink.send(app_name, &cmd) {
            warn!("Failed to send {}: {}", cmd, err);
            return false;
        }
        true
    }

    /// Reset every GPU touched by set_freq() back to the hardware
    /// maximum. Called exactly once when the controller winds down.
    pub fn cleanup(&mut self) {
        let changed = std::mem::take(&mut self.freq_changed);
        for (app_name, gpus) in changed {
            for gpu in gpus {
                info!("Cleanup: resetting gpu {} cap to {}", gpu, CAP_MAX_WATTS);
                self.set_freq(&app_name, gpu, CAP_MAX_WATTS);
            }
        }
        self.freq_changed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SimSink;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn manager(policy: AllocPolicy) -> (GpuResourceManager, Arc<Mutex<Vec<String>>>) {
        let sink = SimSink::new();
        let journal = sink.journal();
        (GpuResourceManager::new(2, policy, Box::new(sink)), journal)
    }

    fn assert_partition(mgr: &GpuResourceManager, gpu: u32) {
        let pools = &mgr.pools[&gpu];
        let mut all: Vec<u32> = pools
            .free
            .iter()
            .chain(pools.be.iter())
            .chain(pools.lc.iter())
            .copied()
            .collect();
        all.sort();
        assert_eq!(all, (1..=MAX_CUS).collect::<Vec<_>>());
    }

    #[test]
    fn test_simple_draw_from_opposite_ends() {
        let (mut mgr, journal) = manager(AllocPolicy::Simple);

        assert!(mgr.add_cu("miniMDock", 0, 5, true));
        assert_eq!(
            mgr.pools[&0].be.iter().copied().collect::<Vec<_>>(),
            [56, 57, 58, 59, 60]
        );
        assert!(mgr.add_cu("Inference-Server", 0, 4, false));
        assert_eq!(
            mgr.pools[&0].lc.iter().copied().collect::<Vec<_>>(),
            [1, 2, 3, 4]
        );
        assert_partition(&mgr, 0);

        // BE releases its lowest-held CUs first.
        assert!(mgr.remove_cu("miniMDock", 0, 2, true));
        assert_eq!(
            mgr.pools[&0].be.iter().copied().collect::<Vec<_>>(),
            [58, 59, 60]
        );
        // LC releases its highest-held CUs first.
        assert!(mgr.remove_cu("Inference-Server", 0, 3, false));
        assert_eq!(mgr.pools[&0].lc.iter().copied().collect::<Vec<_>>(), [1]);
        assert_partition(&mgr, 0);

        let lines = journal.lock().unwrap();
        assert!(lines[0].starts_with("miniMDock SET_CUMASK:0:"));
        assert!(lines[1].starts_with("Inference-Server SET_CUMASK:0:"));
    }

    #[test]
    fn test_packed_round_robin() {
        let (mut mgr, _journal) = manager(AllocPolicy::Packed);

        // Engines hold {se0: 1,5,..57}, {se1: 2,6,..58}, {se2: 3,7,..59},
        // {se3: 4,8,..60}. BE cycles engines 3,2,1,0 taking each
        // engine's highest free CU.
        assert!(mgr.add_cu("miniMDock", 0, 6, true));
        assert_eq!(
            mgr.pools[&0].be.iter().copied().collect::<Vec<_>>(),
            [55, 56, 57, 58, 59, 60]
        );

        // LC cycles engines 0,1,2,3 taking each engine's lowest free CU.
        assert!(mgr.add_cu("Inference-Server", 0, 5, false));
        assert_eq!(
            mgr.pools[&0].lc.iter().copied().collect::<Vec<_>>(),
            [1, 2, 3, 4, 5]
        );
        assert_partition(&mgr, 0);

        // Per-engine counts stay balanced to within one CU.
        let mut per_se = [0usize; NR_SHADER_ENGINES as usize];
        for cu in mgr.pools[&0].be.iter() {
            per_se[shader_engine(*cu) as usize] += 1;
        }
        assert_eq!(per_se.iter().max().unwrap() - per_se.iter().min().unwrap(), 1);

        // BE release walks engines 0,1,2,3 giving back lowest-held CUs.
        assert!(mgr.remove_cu("miniMDock", 0, 4, true));
        assert_eq!(
            mgr.pools[&0].be.iter().copied().collect::<Vec<_>>(),
            [59, 60]
        );
        assert_partition(&mgr, 0);
    }

    #[test]
    fn test_packed_draw_exhausts_engines() {
        let free: BTreeSet<u32> = [1, 4, 8, 12].into_iter().collect();
        // Only engine 3 (CUs 4, 8, 12) and engine 0 (CU 1) have CUs
        // left; the round-robin keeps looping over what remains.
        assert_eq!(draw_packed(&free, 4, true), [12, 1, 8, 4]);
        assert_eq!(draw_packed(&free, 4, false), [1, 4, 8, 12]);
    }

    #[test]
    fn test_add_more_than_free_fails_clean() {
        let (mut mgr, journal) = manager(AllocPolicy::Simple);
        assert!(mgr.add_cu("miniMDock", 0, 60, true));
        assert!(!mgr.add_cu("miniMDock", 0, 1, true));
        assert!(!mgr.add_cu("Inference-Server", 0, 1, false));
        assert_partition(&mgr, 0);
        // Exactly one mask went out.
        assert_eq!(journal.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_zero_and_overdraw() {
        let (mut mgr, journal) = manager(AllocPolicy::Simple);
        assert!(mgr.remove_cu("miniMDock", 0, 0, true));
        assert!(journal.lock().unwrap().is_empty());

        assert!(mgr.add_cu("miniMDock", 0, 3, true));
        assert!(!mgr.remove_cu("miniMDock", 0, 4, true));
        assert_eq!(mgr.cu_count(0, true), 3);
        assert_partition(&mgr, 0);
    }

    #[test]
    fn test_conservation() {
        for policy in [AllocPolicy::Simple, AllocPolicy::Packed] {
            let (mut mgr, _journal) = manager(policy);
            let before = mgr.pools[&0].free.clone();
            assert!(mgr.add_cu("miniMDock", 0, 17, true));
            assert!(mgr.remove_cu("miniMDock", 0, 17, true));
            assert_eq!(mgr.pools[&0].free, before);
            assert!(mgr.pools[&0].be.is_empty());
        }
    }

    #[test]
    fn test_unknown_gpu() {
        let (mut mgr, _journal) = manager(AllocPolicy::Simple);
        assert!(!mgr.add_cu("miniMDock", 9, 1, true));
        assert!(!mgr.remove_cu("miniMDock", 9, 1, true));
        assert!(!mgr.set_freq("miniMDock", 9, 100));
    }

    #[test]
    fn test_set_freq_range_and_cleanup() {
        let (mut mgr, journal) = manager(AllocPolicy::Simple);
        assert!(!mgr.set_freq("miniMDock", 0, 4));
        assert!(!mgr.set_freq("miniMDock", 0, 226));
        assert!(mgr.set_freq("miniMDock", 0, 60));
        assert!(mgr.set_freq("miniMDock", 1, 110));

        mgr.cleanup();
        let lines = journal.lock().unwrap().clone();
        assert_eq!(
            lines,
            [
                "miniMDock SET_FREQ:0:60",
                "miniMDock SET_FREQ:1:110",
                "miniMDock SET_FREQ:0:225",
                "miniMDock SET_FREQ:1:225",
            ]
        );
        assert!(mgr.freq_changed.is_empty());
    }

    #[test]
    fn test_masks_on_the_wire() {
        let (mut mgr, journal) = manager(AllocPolicy::Simple);
        assert!(mgr.add_cu("miniMDock", 1, 60, true));
        assert_eq!(
            journal.lock().unwrap().as_slice(),
            ["miniMDock SET_CUMASK:1:ffffffff:0fffffff"]
        );
    }
}
