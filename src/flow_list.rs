//! Ordered collection of active flows with stable iteration under removal
//! (§4.5 C6). The original keeps an intrusive doubly linked list; here a
//! slot array plus a free list gives the same "iterate while removing the
//! current element" guarantee without unsafe pointer surgery.

use crate::flow::{Flow, MAX_FLOWS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowError;

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow list is full")
    }
}

impl std::error::Error for FlowError {}

#[derive(Default)]
pub struct FlowList {
    slots: Vec<Option<Flow>>,
    free: Vec<usize>,
}

impl FlowList {
    pub fn new() -> FlowList {
        FlowList { slots: Vec::new(), free: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `flow`, returning its slot index. Fails once `MAX_FLOWS` live
    /// flows are present (§4.5 "Size ≤ 2048").
    pub fn insert(&mut self, flow: Flow) -> Result<usize, FlowError> {
        if self.len() >= MAX_FLOWS {
            return Err(FlowError);
        }
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(flow);
            Ok(idx)
        } else {
            self.slots.push(Some(flow));
            Ok(self.slots.len() - 1)
        }
    }

    /// Removes and returns the flow at `idx`, freeing its slot for reuse.
    /// Safe to call while iterating: the slot becomes `None` in place, so
    /// other indices are unaffected.
    pub fn remove(&mut self, idx: usize) -> Option<Flow> {
        let flow = self.slots.get_mut(idx)?.take();
        if flow.is_some() {
            self.free.push(idx);
        }
        flow
    }

    pub fn get(&self, idx: usize) -> Option<&Flow> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Flow> {
        self.slots.get_mut(idx)?.as_mut()
    }

    pub fn find_by_id(&self, id: crate::flow::FlowId) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Some(f) if f.id == id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Flow)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|f| (i, f)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Flow)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| s.as_mut().map(|f| (i, f)))
    }

    /// All live slot indices, snapshotted so the caller can freely remove
    /// entries from `self` while iterating the result (§4.7 "Iteration is
    /// stable under removal of the currently-visited element").
    pub fn indices(&self) -> Vec<usize> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.is_some().then_some(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Flow, FlowSettings, Role};

    fn flow(id: i32) -> Flow {
        Flow::new(id, Role::Source, FlowSettings::default(), None)
    }

    #[test]
    fn insert_and_find_by_id() {
        let mut list = FlowList::new();
        let idx = list.insert(flow(7)).unwrap();
        assert_eq!(list.find_by_id(7), Some(idx));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut list = FlowList::new();
        let idx = list.insert(flow(1)).unwrap();
        list.remove(idx).unwrap();
        assert_eq!(list.len(), 0);
        let idx2 = list.insert(flow(2)).unwrap();
        assert_eq!(idx2, idx);
    }

    #[test]
    fn iteration_is_stable_while_removing_current_element() {
        let mut list = FlowList::new();
        for id in 0..5 {
            list.insert(flow(id)).unwrap();
        }
        for idx in list.indices() {
            if list.get(idx).unwrap().id % 2 == 0 {
                list.remove(idx);
            }
        }
        let remaining: Vec<i32> = list.iter().map(|(_, f)| f.id).collect();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[test]
    fn insert_fails_past_max_flows() {
        let mut list = FlowList::new();
        for id in 0..MAX_FLOWS as i32 {
            list.insert(flow(id)).unwrap();
        }
        assert!(list.insert(flow(9999)).is_err());
    }
}
