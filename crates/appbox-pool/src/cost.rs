//! Memory cost model. The pool never measures process memory; it attributes a
//! cost to each instance from its lifecycle state.

use appbox_common::{InstanceConfig, InstanceState};

use crate::config::PoolConfig;

pub trait CostModel: Send + Sync {
    fn estimate_mb(&self, config: &InstanceConfig, state: InstanceState) -> u64;
}

/// Fixed per-state baselines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineCostModel {
    pub active_mb: u64,
    pub suspended_mb: u64,
}

impl BaselineCostModel {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            active_mb: config.active_baseline_mb,
            suspended_mb: config.suspended_baseline_mb,
        }
    }
}

impl Default for BaselineCostModel {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

impl CostModel for BaselineCostModel {
    fn estimate_mb(&self, _config: &InstanceConfig, state: InstanceState) -> u64 {
        match state {
            // A booting runtime is charged as if it were already running.
            InstanceState::Initializing | InstanceState::Active => self.active_mb,
            InstanceState::Suspended => self.suspended_mb,
            InstanceState::Terminating | InstanceState::Terminated | InstanceState::Error => 0,
        }
    }
}

impl<F> CostModel for F
where
    F: Fn(&InstanceConfig, InstanceState) -> u64 + Send + Sync,
{
    fn estimate_mb(&self, config: &InstanceConfig, state: InstanceState) -> u64 {
        self(config, state)
    }
}
