//! Resource Pool
//!
//! Tracks how many units of each declared resource are free. `cores` is
//! always declared. Resources the pool does not declare are unconstrained.
//! Only the scheduler mutates the pool.

use std::collections::BTreeMap;

use log::{debug, info};
use sysinfo::System;

use crate::workflow::model::CORES;

/// Resource name for main memory, filled in by [`ResourcePool::from_system`].
pub const MEM_MB: &str = "mem_mb";

/// Slots for jobs submitted to a cluster. Each remote job takes one slot
/// instead of local cores.
pub const JOBS: &str = "_jobs";

#[derive(Debug, Clone)]
pub struct ResourcePool {
    capacity: BTreeMap<String, u64>,
    available: BTreeMap<String, u64>,
}

impl ResourcePool {
    /// A pool with the given number of cores and no other resources.
    pub fn new(cores: u64) -> Self {
        let capacity = BTreeMap::from([(CORES.to_string(), cores)]);
        Self {
            available: capacity.clone(),
            capacity,
        }
    }

    /// Cores from `num_cpus`, memory from the operating system.
    pub fn from_system() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let mem_mb = system.total_memory() / (1024 * 1024);
        let cores = num_cpus::get() as u64;
        info!("Detected {} cores and {} MB of memory", cores, mem_mb);

        Self::new(cores).with_resource(MEM_MB, mem_mb)
    }

    /// Declares (or redeclares) a resource.
    pub fn with_resource(mut self, name: impl Into<String>, amount: u64) -> Self {
        let name = name.into();
        self.capacity.insert(name.clone(), amount);
        self.available.insert(name, amount);
        self
    }

    pub fn capacity(&self) -> &BTreeMap<String, u64> {
        &self.capacity
    }

    pub fn declares(&self, name: &str) -> bool {
        self.capacity.contains_key(name)
    }

    pub fn available(&self, name: &str) -> Option<u64> {
        self.available.get(name).copied()
    }

    /// True if every declared resource in `request` is currently free.
    pub fn admits(&self, request: &BTreeMap<String, u64>) -> bool {
        request.iter().all(|(name, amount)| match self.available.get(name) {
            Some(free) => amount <= free,
            None => true,
        })
    }

    /// Takes the requested units. Returns false, leaving the pool untouched,
    /// if the request is not admitted.
    pub fn grant(&mut self, request: &BTreeMap<String, u64>) -> bool {
        if !self.admits(request) {
            return false;
        }
        for (name, amount) in request {
            if let Some(free) = self.available.get_mut(name) {
                *free -= amount;
            }
        }
        debug!("Granted {:?}; available {:?}", request, self.available);
        true
    }

    /// Returns units taken by [`grant`](Self::grant).
    pub fn release(&mut self, request: &BTreeMap<String, u64>) {
        for (name, amount) in request {
            if let (Some(free), Some(cap)) = (self.available.get_mut(name), self.capacity.get(name)) {
                *free = (*free + amount).min(*cap);
            }
        }
    }

    /// True when nothing is granted.
    pub fn is_idle(&self) -> bool {
        self.capacity == self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_grant_and_release() {
        let mut pool = ResourcePool::new(4).with_resource("gpu", 1);
        let job = request(&[(CORES, 3), ("gpu", 1)]);

        assert!(pool.grant(&job));
        assert_eq!(pool.available(CORES), Some(1));
        assert_eq!(pool.available("gpu"), Some(0));
        assert!(!pool.admits(&request(&[(CORES, 2)])));
        assert!(pool.admits(&request(&[(CORES, 1)])));

        pool.release(&job);
        assert!(pool.is_idle());
    }

    #[test]
    fn test_rejected_grant_changes_nothing() {
        let mut pool = ResourcePool::new(2);
        assert!(!pool.grant(&request(&[(CORES, 3)])));
        assert!(pool.is_idle());
    }

    #[test]
    fn test_undeclared_resources_are_unconstrained() {
        let mut pool = ResourcePool::new(1);
        assert!(pool.grant(&request(&[(CORES, 1), ("tmpdisk", 1_000_000)])));
        assert_eq!(pool.available("tmpdisk"), None);
    }

    #[test]
    fn test_release_never_exceeds_capacity() {
        let mut pool = ResourcePool::new(2);
        pool.release(&request(&[(CORES, 5)]));
        assert_eq!(pool.available(CORES), Some(2));
    }

    #[test]
    fn test_from_system_declares_cores_and_memory() {
        let pool = ResourcePool::from_system();
        assert!(pool.capacity()[CORES] >= 1);
        assert!(pool.capacity().contains_key(MEM_MB));
    }
}
