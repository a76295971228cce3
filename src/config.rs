//! Boot-time tunables shared by every cache of a registry.

use alloc::vec::Vec;

use crate::slab::order::{DEFAULT_MAX_ORDER, MAX_ORDER};
use crate::{AllocError, AllocResult, CpuId, NodeId};

/// Default cache line size used by `SlabFlags::HWCACHE_ALIGN`.
pub const DEFAULT_CACHE_LINE_SIZE: usize = 64;

const DEFAULT_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Registry-wide slab configuration.
///
/// `None` for `min_partial` / `cpu_partial` and `0` for `min_objects` select
/// the size-derived defaults.
#[derive(Debug, Clone)]
pub struct SlabConfig {
    pub nr_cpus: usize,
    pub nr_nodes: usize,
    /// Explicit cpu to node map; `cpu % nr_nodes` when absent.
    pub cpu_to_node: Option<Vec<NodeId>>,
    pub min_order: u32,
    pub max_order: u32,
    pub min_objects: usize,
    pub min_partial: Option<usize>,
    pub cpu_partial: Option<usize>,
    pub cache_line_size: usize,
    /// Seed for hardening secrets and freelist permutations.
    pub seed: u64,
}

impl SlabConfig {
    /// Defaults for `nr_cpus` cpus spread over `nr_nodes` nodes.
    pub fn new(nr_cpus: usize, nr_nodes: usize) -> Self {
        Self {
            nr_cpus,
            nr_nodes,
            cpu_to_node: None,
            min_order: 0,
            max_order: DEFAULT_MAX_ORDER,
            min_objects: 0,
            min_partial: None,
            cpu_partial: None,
            cache_line_size: DEFAULT_CACHE_LINE_SIZE,
            seed: DEFAULT_SEED,
        }
    }

    /// Map each cpu to a node; defaults to `cpu % nr_nodes`.
    pub fn with_cpu_to_node(mut self, map: Vec<NodeId>) -> Self {
        self.cpu_to_node = Some(map);
        self
    }

    /// Bounds for the slab order chosen at cache creation.
    pub fn with_orders(mut self, min_order: u32, max_order: u32) -> Self {
        self.min_order = min_order;
        self.max_order = max_order;
        self
    }

    /// Objects a slab should hold at least; zero derives it from the cpu count.
    pub fn with_min_objects(mut self, min_objects: usize) -> Self {
        self.min_objects = min_objects;
        self
    }

    /// Override the per-node partial minimum of every cache.
    pub fn with_min_partial(mut self, min_partial: usize) -> Self {
        self.min_partial = Some(min_partial);
        self
    }

    /// Override the per-cpu partial budget of caches that use one.
    pub fn with_cpu_partial(mut self, cpu_partial: usize) -> Self {
        self.cpu_partial = Some(cpu_partial);
        self
    }

    /// Cache line size used for `HWCACHE_ALIGN`.
    pub fn with_cache_line_size(mut self, cache_line_size: usize) -> Self {
        self.cache_line_size = cache_line_size;
        self
    }

    /// Seed for freelist hardening and randomization.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject inconsistent settings with [`AllocError::InvalidParam`].
    pub fn validate(&self) -> AllocResult {
        if self.nr_cpus == 0 || self.nr_nodes == 0 {
            return Err(AllocError::InvalidParam);
        }
        if self.min_order > self.max_order || self.max_order >= MAX_ORDER {
            return Err(AllocError::InvalidParam);
        }
        if !self.cache_line_size.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }
        if let Some(map) = &self.cpu_to_node {
            if map.len() != self.nr_cpus || map.iter().any(|&node| node >= self.nr_nodes) {
                return Err(AllocError::InvalidParam);
            }
        }
        Ok(())
    }

    /// Node that `cpu` allocates from by default.
    pub fn node_of(&self, cpu: CpuId) -> NodeId {
        match &self.cpu_to_node {
            Some(map) => map[cpu],
            None => cpu % self.nr_nodes,
        }
    }
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_default_node_mapping() {
        let config = SlabConfig::new(4, 2);
        assert!(config.validate().is_ok());
        assert_eq!(config.node_of(0), 0);
        assert_eq!(config.node_of(1), 1);
        assert_eq!(config.node_of(3), 1);
    }

    #[test]
    fn test_explicit_node_mapping() {
        let config = SlabConfig::new(3, 2).with_cpu_to_node(vec![1, 1, 0]);
        assert!(config.validate().is_ok());
        assert_eq!(config.node_of(0), 1);
        assert_eq!(config.node_of(2), 0);

        let bad = SlabConfig::new(3, 2).with_cpu_to_node(vec![0, 2, 0]);
        assert_eq!(bad.validate(), Err(AllocError::InvalidParam));
    }

    #[test]
    fn test_rejects_bad_orders() {
        assert!(SlabConfig::new(1, 1).with_orders(2, 1).validate().is_err());
        assert!(SlabConfig::new(1, 1)
            .with_orders(0, MAX_ORDER)
            .validate()
            .is_err());
        assert!(SlabConfig::new(0, 1).validate().is_err());
    }
}
