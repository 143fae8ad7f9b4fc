//! Execution slot bookkeeping.

use serde::{Deserialize, Serialize};

/// The `(job, microtask)` pair a slot is working on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub job_id: String,
    pub task_id: String,
}

impl TaskRef {
    pub fn new(job_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    id: String,
    current: Option<TaskRef>,
}

/// One slot per execution unit, indexed like the pool.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1))
                .map(|i| Slot {
                    id: format!("w{i}"),
                    current: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn id(&self, slot: usize) -> Option<&str> {
        self.slots.get(slot).map(|s| s.id.as_str())
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.current.is_none())
    }

    pub fn free_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.current.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.current.is_some()).count()
    }

    /// Mark `slot` busy with `task`.
    pub fn occupy(&mut self, slot: usize, task: TaskRef) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.current = Some(task);
        }
    }

    /// Free `slot` only if it still holds `task`. Returns whether it did.
    pub fn free_if_holds(&mut self, slot: usize, task: &TaskRef) -> bool {
        match self.slots.get_mut(slot) {
            Some(s) if s.current.as_ref() == Some(task) => {
                s.current = None;
                true
            }
            _ => false,
        }
    }

    /// Free whichever slot holds `task`, returning its index.
    pub fn free_matching(&mut self, task: &TaskRef) -> Option<usize> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.current.as_ref() == Some(task))?;
        self.slots[slot].current = None;
        Some(slot)
    }

    pub fn clear(&mut self) {
        for s in &mut self.slots {
            s.current = None;
        }
    }
}
