//! Min-heap of drones keyed by used capacity.
//!
//! Rebuilt on every refresh and re-keyed after each placement, since a
//! placement changes the chosen drone's optimistic process count.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

use autotest_drone::{Drone, UsedCapacity};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    capacity: UsedCapacity,
    hostname: String,
}

#[derive(Debug, Default)]
pub struct DroneQueue {
    heap: BinaryHeap<Reverse<Slot>>,
}

impl DroneQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, drone: &Drone) {
        self.heap.push(Reverse(Slot {
            capacity: drone.used_capacity(),
            hostname: drone.hostname.clone(),
        }));
    }

    /// Hostname of the least loaded drone. Ties go to the lower hostname.
    pub fn pop(&mut self) -> Option<String> {
        self.heap.pop().map(|Reverse(slot)| slot.hostname)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Re-key every queued drone against its current capacity.
    pub fn reorder(&mut self, drones: &BTreeMap<String, Drone>) {
        let hostnames: Vec<String> = self.hostnames();
        self.heap.clear();
        for hostname in hostnames {
            if let Some(drone) = drones.get(&hostname) {
                self.push(drone);
            }
        }
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.heap.iter().map(|Reverse(slot)| slot.hostname.clone()).collect()
    }
}
