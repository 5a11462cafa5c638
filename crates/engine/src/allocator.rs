//! Shares a limited window of watering time across competing zones.
//!
//! ```text
//!   fits?          ── yes ─▶ everyone gets their request
//!     │ no
//!   floors fit?    ── no ──▶ one cycle each, by priority, until budget runs out
//!     │ yes
//!   one cycle each, then the rest in whole cycles, proportional to request
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    pub zone_id: String,
    pub requested_min: f64,
    /// Priority weight; larger is served first when the budget is short.
    pub deficit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub duration_min: f64,
    pub cycles: u32,
}

impl Allocation {
    pub fn is_funded(&self) -> bool {
        self.cycles > 0 && self.duration_min > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub zone_id: String,
    pub allocation: Allocation,
}

/// Allocations in execution order. Unfunded zones stay listed with a zero
/// allocation so they can be picked up next session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationPlan {
    entries: Vec<PlanEntry>,
}

impl AllocationPlan {
    pub fn get(&self, zone_id: &str) -> Option<&Allocation> {
        self.entries
            .iter()
            .find(|e| e.zone_id == zone_id)
            .map(|e| &e.allocation)
    }

    pub fn position(&self, zone_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.zone_id == zone_id)
    }

    pub fn total_min(&self) -> f64 {
        self.entries.iter().map(|e| e.allocation.duration_min).sum()
    }

    pub fn remove(&mut self, zone_id: &str) -> Option<Allocation> {
        let idx = self.position(zone_id)?;
        Some(self.entries.remove(idx).allocation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FairAllocator {
    cycle_min: f64,
}

impl FairAllocator {
    pub fn new(cycle_min: f64) -> Self {
        Self { cycle_min }
    }

    fn cycles_for(&self, minutes: f64) -> u32 {
        if minutes <= 0.0 {
            return 0;
        }
        ((minutes / self.cycle_min - EPS).ceil() as u32).max(1)
    }

    /// Allocates `budget_min` across `requests`. `None` means no budget limit.
    pub fn allocate(&self, requests: &[AllocationRequest], budget_min: Option<f64>) -> AllocationPlan {
        let mut ordered: Vec<&AllocationRequest> = requests
            .iter()
            .filter(|r| r.requested_min.is_finite() && r.requested_min > 0.0)
            .collect();
        ordered.sort_by(|a, b| {
            b.deficit
                .partial_cmp(&a.deficit)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.zone_id.cmp(&b.zone_id))
        });

        let total: f64 = ordered.iter().map(|r| r.requested_min).sum();
        let budget = match budget_min {
            None => f64::INFINITY,
            Some(b) if b.is_finite() => b.max(0.0),
            Some(_) => 0.0,
        };

        let grants: Vec<Allocation> = if total <= budget + EPS {
            // Full requests, not whole cycles: the last cycle runs short.
            ordered
                .iter()
                .map(|r| Allocation {
                    duration_min: r.requested_min,
                    cycles: self.cycles_for(r.requested_min),
                })
                .collect()
        } else {
            self.constrained(&ordered, total, budget)
        };

        AllocationPlan {
            entries: ordered
                .iter()
                .zip(grants)
                .map(|(r, allocation)| PlanEntry {
                    zone_id: r.zone_id.clone(),
                    allocation,
                })
                .collect(),
        }
    }

    fn constrained(&self, ordered: &[&AllocationRequest], total: f64, budget: f64) -> Vec<Allocation> {
        let cycle = self.cycle_min;
        let floors: Vec<f64> = ordered.iter().map(|r| r.requested_min.min(cycle)).collect();
        let floor_sum: f64 = floors.iter().sum();

        if floor_sum > budget + EPS {
            let mut left = budget;
            return floors
                .iter()
                .map(|&f| {
                    if f <= left + EPS {
                        left -= f;
                        Allocation {
                            duration_min: f,
                            cycles: 1,
                        }
                    } else {
                        Allocation::default()
                    }
                })
                .collect();
        }

        let pool = budget - floor_sum;
        let headroom: Vec<u32> = ordered
            .iter()
            .zip(&floors)
            .map(|(r, f)| ((r.requested_min - f) / cycle + EPS).floor().max(0.0) as u32)
            .collect();

        let mut extra = vec![0u32; ordered.len()];
        let mut remainder = vec![0.0f64; ordered.len()];
        for (i, r) in ordered.iter().enumerate() {
            let share = pool * r.requested_min / total / cycle;
            let whole = (share + EPS).floor() as u32;
            extra[i] = whole.min(headroom[i]);
            remainder[i] = share - f64::from(whole);
        }

        let used: f64 = extra.iter().map(|&n| f64::from(n) * cycle).sum();
        let mut left = pool - used;
        loop {
            let mut candidates: Vec<usize> = (0..ordered.len()).filter(|&i| extra[i] < headroom[i]).collect();
            // Stable sort keeps priority order among equal remainders.
            candidates.sort_by(|&a, &b| remainder[b].partial_cmp(&remainder[a]).unwrap_or(Ordering::Equal));
            let mut progressed = false;
            for i in candidates {
                if left + EPS < cycle {
                    break;
                }
                extra[i] += 1;
                remainder[i] = 0.0;
                left -= cycle;
                progressed = true;
            }
            if !progressed || left + EPS < cycle {
                break;
            }
        }

        floors
            .iter()
            .zip(extra)
            .map(|(&f, n)| Allocation {
                duration_min: f + f64::from(n) * cycle,
                cycles: 1 + n,
            })
            .collect()
    }
}
