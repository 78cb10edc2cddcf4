//! Executor resource pool: concurrency slots per backend, a memory budget
//! and a cost budget.
//!
//! The context builder reads a snapshot; dispatch reserves atomically
//! before launching. A reservation is all-or-nothing and releases its slots
//! and memory when dropped. Cost is spent, not returned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use arbiter_core::config::ExecutorConfig;
use arbiter_core::{ExecutorKind, PlanStep};

/// Read-only view handed to the context builder.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceSnapshot {
    pub slots: BTreeMap<ExecutorKind, SlotUsage>,
    pub memory_available_mb: u64,
    pub cost_available: f64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SlotUsage {
    pub capacity: usize,
    pub in_use: usize,
}

/// What a plan needs to launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceRequest {
    pub kinds: BTreeSet<ExecutorKind>,
    pub memory_mb: u64,
    pub cost: f64,
}

impl ResourceRequest {
    /// One slot per distinct backend the steps use. Steps run one at a time,
    /// so memory is the largest `memory_mb` hint; `cost` hints add up.
    pub fn for_steps(steps: &[PlanStep]) -> Self {
        let number = |step: &PlanStep, key: &str| {
            step.details
                .get(key)
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
                .max(0.0)
        };
        Self {
            kinds: steps.iter().map(|s| s.executor).collect(),
            memory_mb: steps
                .iter()
                .map(|s| number(s, "memory_mb"))
                .fold(0.0, f64::max) as u64,
            cost: steps.iter().map(|s| number(s, "cost")).sum(),
        }
    }
}

/// Why a reservation could not be made.
#[derive(Debug, Clone, PartialEq)]
pub enum Shortage {
    Slot(ExecutorKind),
    Memory { requested_mb: u64, available_mb: u64 },
    Budget { requested: f64, available: f64 },
}

impl fmt::Display for Shortage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(kind) => write!(f, "executor slot available for {kind}"),
            Self::Memory { requested_mb, .. } => {
                write!(f, "{requested_mb} MB of executor memory available")
            }
            Self::Budget { requested, .. } => write!(f, "cost budget of {requested:.2} available"),
        }
    }
}

struct PoolState {
    capacity: HashMap<ExecutorKind, usize>,
    in_use: HashMap<ExecutorKind, usize>,
    memory_budget_mb: u64,
    memory_used_mb: u64,
    cost_budget: f64,
    cost_spent: f64,
}

pub struct ResourcePool {
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(config: &ExecutorConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                capacity: capacities(config),
                in_use: HashMap::new(),
                memory_budget_mb: config.memory_budget_mb,
                memory_used_mb: 0,
                cost_budget: config.cost_budget,
                cost_spent: 0.0,
            }),
        })
    }

    /// Apply new limits. Reservations in flight keep their slots; a lowered
    /// limit only takes effect as they are released.
    pub fn set_limits(&self, config: &ExecutorConfig) {
        let mut state = self.lock();
        state.capacity = capacities(config);
        state.memory_budget_mb = config.memory_budget_mb;
        state.cost_budget = config.cost_budget;
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let state = self.lock();
        let slots = ExecutorKind::PRIMITIVE
            .iter()
            .map(|k| {
                (
                    *k,
                    SlotUsage {
                        capacity: state.capacity.get(k).copied().unwrap_or(0),
                        in_use: state.in_use.get(k).copied().unwrap_or(0),
                    },
                )
            })
            .collect();
        ResourceSnapshot {
            slots,
            memory_available_mb: state.memory_budget_mb.saturating_sub(state.memory_used_mb),
            cost_available: (state.cost_budget - state.cost_spent).max(0.0),
        }
    }

    /// Reserve everything in `request` or nothing.
    pub fn try_reserve(self: &Arc<Self>, request: &ResourceRequest) -> Result<Reservation, Shortage> {
        let mut state = self.lock();

        for kind in &request.kinds {
            let capacity = state.capacity.get(kind).copied().unwrap_or(0);
            let in_use = state.in_use.get(kind).copied().unwrap_or(0);
            if in_use >= capacity {
                return Err(Shortage::Slot(*kind));
            }
        }
        let available_mb = state.memory_budget_mb.saturating_sub(state.memory_used_mb);
        if request.memory_mb > available_mb {
            return Err(Shortage::Memory {
                requested_mb: request.memory_mb,
                available_mb,
            });
        }
        let available = state.cost_budget - state.cost_spent;
        if request.cost > available {
            return Err(Shortage::Budget {
                requested: request.cost,
                available: available.max(0.0),
            });
        }

        for kind in &request.kinds {
            *state.in_use.entry(*kind).or_insert(0) += 1;
        }
        state.memory_used_mb += request.memory_mb;
        state.cost_spent += request.cost;

        Ok(Reservation {
            pool: Arc::clone(self),
            kinds: request.kinds.clone(),
            memory_mb: request.memory_mb,
            cost: request.cost,
            spent: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn capacities(config: &ExecutorConfig) -> HashMap<ExecutorKind, usize> {
    ExecutorKind::PRIMITIVE
        .iter()
        .map(|k| (*k, config.limits.get(*k)))
        .collect()
}

/// Held for the duration of one plan's execution. Slots and memory return
/// to the pool on drop; the cost does only if the plan never started.
pub struct Reservation {
    pool: Arc<ResourcePool>,
    kinds: BTreeSet<ExecutorKind>,
    memory_mb: u64,
    cost: f64,
    spent: bool,
}

impl Reservation {
    /// Mark the cost as spent; call when execution starts.
    pub fn spend(&mut self) {
        self.spent = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        for kind in &self.kinds {
            if let Some(n) = state.in_use.get_mut(kind) {
                *n = n.saturating_sub(1);
            }
        }
        state.memory_used_mb = state.memory_used_mb.saturating_sub(self.memory_mb);
        if !self.spent {
            state.cost_spent = (state.cost_spent - self.cost).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kinds: &[ExecutorKind]) -> ResourceRequest {
        ResourceRequest {
            kinds: kinds.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn slots_are_released_on_drop() {
        let pool = ResourcePool::new(&ExecutorConfig::default());
        let swarm = request(&[ExecutorKind::Swarm]);

        let held = pool.try_reserve(&swarm).unwrap();
        assert_eq!(pool.snapshot().slots[&ExecutorKind::Swarm].in_use, 1);
        assert_eq!(
            pool.try_reserve(&swarm).err(),
            Some(Shortage::Slot(ExecutorKind::Swarm))
        );

        drop(held);
        assert_eq!(pool.snapshot().slots[&ExecutorKind::Swarm].in_use, 0);
        assert!(pool.try_reserve(&swarm).is_ok());
    }

    #[test]
    fn reservation_is_all_or_nothing() {
        let pool = ResourcePool::new(&ExecutorConfig::default());
        let _swarm = pool.try_reserve(&request(&[ExecutorKind::Swarm])).unwrap();

        let mixed = request(&[ExecutorKind::Script, ExecutorKind::Swarm]);
        assert!(pool.try_reserve(&mixed).is_err());
        assert_eq!(pool.snapshot().slots[&ExecutorKind::Script].in_use, 0);
    }

    #[test]
    fn memory_and_budget_limits() {
        let config = ExecutorConfig {
            memory_budget_mb: 100,
            cost_budget: 1.0,
            ..Default::default()
        };
        let pool = ResourcePool::new(&config);

        let big = ResourceRequest {
            memory_mb: 150,
            ..request(&[ExecutorKind::Script])
        };
        assert!(matches!(pool.try_reserve(&big), Err(Shortage::Memory { .. })));

        let pricey = ResourceRequest {
            cost: 0.75,
            ..request(&[ExecutorKind::Internal])
        };
        // Unspent cost comes back.
        drop(pool.try_reserve(&pricey).unwrap());
        let mut held = pool.try_reserve(&pricey).unwrap();
        held.spend();
        drop(held);
        let err = pool.try_reserve(&pricey).err().unwrap();
        assert!(matches!(err, Shortage::Budget { .. }));
    }

    #[test]
    fn custom_has_no_slots() {
        let pool = ResourcePool::new(&ExecutorConfig::default());
        assert_eq!(
            pool.try_reserve(&request(&[ExecutorKind::Custom])).err(),
            Some(Shortage::Slot(ExecutorKind::Custom))
        );
    }

    #[test]
    fn shortage_reads_as_resume_condition() {
        assert_eq!(
            Shortage::Slot(ExecutorKind::Script).to_string(),
            "executor slot available for script"
        );
    }

    #[test]
    fn request_from_steps() {
        let step = |executor, details: serde_json::Value| PlanStep {
            executor,
            description: String::new(),
            details: details.as_object().cloned().unwrap_or_default(),
        };
        let req = ResourceRequest::for_steps(&[
            step(ExecutorKind::Script, serde_json::json!({"memory_mb": 256, "cost": 0.5})),
            step(ExecutorKind::Script, serde_json::json!({"memory_mb": 512})),
            step(ExecutorKind::Task, serde_json::json!({"cost": 1.5})),
        ]);
        assert_eq!(req.kinds.len(), 2);
        assert_eq!(req.memory_mb, 512);
        assert!((req.cost - 2.0).abs() < 1e-9);
    }
}
