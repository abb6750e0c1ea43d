// SPDX-License-Identifier: GPL-2.0

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-GPU, per-workload-class run-state bookkeeping, and the capped
//! stack that orders the running BE GPUs.

use gfr_utils::CapRange;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WorkloadClass {
    Be,
    Lc,
}

impl WorkloadClass {
    pub fn is_be(&self) -> bool {
        matches!(self, Self::Be)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Paused,
    Running,
}

/// Current cap plus the supported envelope it must stay inside.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CapState {
    pub current: u32,
    pub min: u32,
    pub max: u32,
}

impl CapState {
    pub fn at_max(range: CapRange) -> Self {
        Self {
            current: range.max_supported,
            min: range.min_supported,
            max: range.max_supported,
        }
    }
}

/// One registered (GPU, workload class) pairing.
#[derive(Clone, Copy, Debug)]
pub struct WorkloadRecord {
    pub state: RunState,
    pub cap: CapState,
    pub cus: u32,
}

/// Records for every GPU registered to each workload class. Mutated
/// only by the controller; registration happens once at setup.
#[derive(Default)]
pub struct WorkloadStateStore {
    be: BTreeMap<u32, WorkloadRecord>,
    lc: BTreeMap<u32, WorkloadRecord>,
}

impl WorkloadStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(&self, class: WorkloadClass) -> &BTreeMap<u32, WorkloadRecord> {
        match class {
            WorkloadClass::Be => &self.be,
            WorkloadClass::Lc => &self.lc,
        }
    }

    pub fn class_mut(&mut self, class: WorkloadClass) -> &mut BTreeMap<u32, WorkloadRecord> {
        match class {
            WorkloadClass::Be => &mut self.be,
            WorkloadClass::Lc => &mut self.lc,
        }
    }

    pub fn record(&self, class: WorkloadClass, gpu: u32) -> Option<&WorkloadRecord> {
        self.class(class).get(&gpu)
    }

    pub fn record_mut(&mut self, class: WorkloadClass, gpu: u32) -> Option<&mut WorkloadRecord> {
        self.class_mut(class).get_mut(&gpu)
    }

    pub fn insert(&mut self, class: WorkloadClass, gpu: u32, record: WorkloadRecord) {
        self.class_mut(class).insert(gpu, record);
    }

    pub fn clear(&mut self) {
        self.be.clear();
        self.lc.clear();
    }
}

/// Running BE GPUs in resume order. By convention only the top entry
/// may hold a cap strictly between its min and max; every other entry
/// sits at max.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CappedStack {
    stack: Vec<u32>,
}

impl CappedStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a resumed GPU on top, whatever its id.
    pub fn push(&mut self, gpu: u32) {
        self.stack.push(gpu);
    }

    /// Remove a paused GPU wherever it sits in the stack.
    pub fn remove(&mut self, gpu: u32) {
        self.stack.retain(|g| *g != gpu);
    }

    pub fn top(&self) -> Option<u32> {
        self.stack.last().copied()
    }

    pub fn contains(&self, gpu: u32) -> bool {
        self.stack.contains(&gpu)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.stack.iter().copied()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_resume_order() {
        let mut stack = CappedStack::new();
        stack.push(7);
        stack.push(6);
        stack.push(5);
        assert_eq!(stack.top(), Some(5));
        assert_eq!(stack.len(), 3);

        // Removal by value, not by position.
        stack.remove(6);
        assert_eq!(stack.iter().collect::<Vec<_>>(), [7, 5]);
        assert_eq!(stack.top(), Some(5));

        stack.remove(5);
        assert_eq!(stack.top(), Some(7));
        stack.remove(7);
        assert!(stack.is_empty());
        assert_eq!(stack.top(), None);
    }

    #[test]
    fn test_store_classes_are_disjoint() {
        let mut store = WorkloadStateStore::new();
        let record = WorkloadRecord {
            state: RunState::Running,
            cap: CapState {
                current: 225,
                min: 50,
                max: 225,
            },
            cus: 60,
        };
        store.insert(WorkloadClass::Lc, 0, record);
        assert!(store.record(WorkloadClass::Lc, 0).is_some());
        assert!(store.record(WorkloadClass::Be, 0).is_none());

        store.record_mut(WorkloadClass::Lc, 0).unwrap().state = RunState::Paused;
        assert_eq!(
            store.record(WorkloadClass::Lc, 0).unwrap().state,
            RunState::Paused
        );
    }
}
