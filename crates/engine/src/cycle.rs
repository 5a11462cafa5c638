//! Cycle-and-soak state machine for one zone.
//!
//! ```text
//!   IDLE ──▶ WATERING ──▶ SOAKING ──▶ WATERING ... ──▶ DONE
//!                 │            │
//!                 └────────────┴──▶ ABORTED (window end, disable, fault, max duration)
//! ```
//!
//! The machine never touches hardware. Each step returns a [`Transition`]
//! and the coordinator switches the valve accordingly.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::allocator::Allocation;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Watering,
    Soaking,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    ScheduleEnded,
    Disabled,
    MaxDuration,
    ActuatorFailure,
    SensorFault,
    Removed,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ScheduleEnded => "schedule_ended",
            AbortReason::Disabled => "disabled",
            AbortReason::MaxDuration => "max_duration",
            AbortReason::ActuatorFailure => "actuator_failure",
            AbortReason::SensorFault => "sensor_fault",
            AbortReason::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    TargetReached,
    CyclesExhausted,
    DurationExhausted,
}

impl DoneReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoneReason::TargetReached => "target_reached",
            DoneReason::CyclesExhausted => "cycles_exhausted",
            DoneReason::DurationExhausted => "duration_exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Done(DoneReason),
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleTiming {
    pub cycle_min: f64,
    pub soak_min: f64,
    pub max_duration_min: f64,
    pub max_moisture: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Stay,
    StartedWatering,
    StartedSoaking,
    /// Soak finished and another cycle is owed; the zone waits for the slot.
    SoakComplete,
    Done(DoneReason),
    Aborted(AbortReason),
}

impl Transition {
    /// Valve command implied by the transition.
    pub fn switch(&self) -> Option<bool> {
        match self {
            Transition::StartedWatering => Some(true),
            Transition::StartedSoaking | Transition::Done(_) | Transition::Aborted(_) => Some(false),
            Transition::Stay | Transition::SoakComplete => None,
        }
    }
}

/// A finished stretch of watering, kept for absorption learning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WateringInterval {
    pub watered_min: f64,
    pub moisture_before: f64,
    pub ended_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneCycle {
    phase: Phase,
    allocation: Allocation,
    cycles_completed: u32,
    watered_min: f64,
    phase_started: Option<OffsetDateTime>,
    cycle_budget_min: f64,
    moisture_before: f64,
    soak_ready: bool,
    outcome: Option<Outcome>,
    finished: Option<WateringInterval>,
}

impl Default for ZoneCycle {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_min(since: Option<OffsetDateTime>, now: OffsetDateTime) -> f64 {
    since.map_or(0.0, |s| ((now - s).as_seconds_f64() / 60.0).max(0.0))
}

impl ZoneCycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            allocation: Allocation::default(),
            cycles_completed: 0,
            watered_min: 0.0,
            phase_started: None,
            cycle_budget_min: 0.0,
            moisture_before: 0.0,
            soak_ready: false,
            outcome: None,
            finished: None,
        }
    }

    /// Back to IDLE with a fresh allocation.
    pub fn reset(&mut self, allocation: Allocation) {
        *self = Self {
            allocation,
            ..Self::new()
        };
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn allocation(&self) -> Allocation {
        self.allocation
    }

    pub fn cycles_completed(&self) -> u32 {
        self.cycles_completed
    }

    pub fn watered_min(&self) -> f64 {
        self.watered_min
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Watering | Phase::Soaking)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Aborted)
    }

    /// Ready to take the watering slot: a funded idle zone, or a zone whose
    /// soak ended with cycles still owed.
    pub fn wants_slot(&self) -> bool {
        match self.phase {
            Phase::Idle => self.allocation.is_funded(),
            Phase::Soaking => self.soak_ready,
            _ => false,
        }
    }

    /// Hands out the most recent finished watering stretch, once.
    pub fn take_interval(&mut self) -> Option<WateringInterval> {
        self.finished.take()
    }

    pub fn start_watering(&mut self, now: OffsetDateTime, moisture: f64, t: &CycleTiming) -> Transition {
        if !self.wants_slot() {
            return Transition::Stay;
        }
        let left = self.allocation.duration_min - self.watered_min;
        if left <= EPS {
            return self.finish(DoneReason::DurationExhausted);
        }
        if self.watered_min >= t.max_duration_min - EPS {
            return self.abort(now, AbortReason::MaxDuration);
        }
        self.phase = Phase::Watering;
        self.phase_started = Some(now);
        self.cycle_budget_min = t.cycle_min.min(left);
        self.moisture_before = moisture;
        self.soak_ready = false;
        Transition::StartedWatering
    }

    pub fn advance(&mut self, now: OffsetDateTime, moisture: Option<f64>, t: &CycleTiming) -> Transition {
        match self.phase {
            Phase::Watering => {
                let elapsed = elapsed_min(self.phase_started, now);
                if self.watered_min + elapsed >= t.max_duration_min - EPS {
                    return self.abort(now, AbortReason::MaxDuration);
                }
                if elapsed + EPS < self.cycle_budget_min {
                    return Transition::Stay;
                }
                self.end_watering(now, elapsed);
                self.cycles_completed += 1;
                self.phase = Phase::Soaking;
                self.phase_started = Some(now);
                Transition::StartedSoaking
            }
            Phase::Soaking => {
                if self.soak_ready || elapsed_min(self.phase_started, now) + EPS < t.soak_min {
                    return Transition::Stay;
                }
                if moisture.is_some_and(|m| m >= t.max_moisture) {
                    return self.finish(DoneReason::TargetReached);
                }
                if self.cycles_completed >= self.allocation.cycles {
                    return self.finish(DoneReason::CyclesExhausted);
                }
                if self.allocation.duration_min - self.watered_min <= EPS {
                    return self.finish(DoneReason::DurationExhausted);
                }
                self.soak_ready = true;
                Transition::SoakComplete
            }
            Phase::Idle | Phase::Done | Phase::Aborted => Transition::Stay,
        }
    }

    /// Forces ABORTED. Finished zones stay as they are.
    pub fn abort(&mut self, now: OffsetDateTime, reason: AbortReason) -> Transition {
        if self.is_finished() {
            return Transition::Stay;
        }
        if self.phase == Phase::Watering {
            let elapsed = elapsed_min(self.phase_started, now);
            self.end_watering(now, elapsed);
        }
        self.phase = Phase::Aborted;
        self.phase_started = None;
        self.soak_ready = false;
        self.outcome = Some(Outcome::Aborted(reason));
        Transition::Aborted(reason)
    }

    fn end_watering(&mut self, now: OffsetDateTime, elapsed: f64) {
        self.watered_min += elapsed;
        if elapsed > 0.0 {
            self.finished = Some(WateringInterval {
                watered_min: elapsed,
                moisture_before: self.moisture_before,
                ended_at: now,
            });
        }
    }

    fn finish(&mut self, reason: DoneReason) -> Transition {
        self.phase = Phase::Done;
        self.phase_started = None;
        self.soak_ready = false;
        self.outcome = Some(Outcome::Done(reason));
        Transition::Done(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-06-03 5:00 UTC);

    fn timing(max_duration: f64) -> CycleTiming {
        CycleTiming {
            cycle_min: 15.0,
            soak_min: 30.0,
            max_duration_min: max_duration,
            max_moisture: 25.0,
        }
    }

    fn at(min: i64) -> OffsetDateTime {
        T0 + Duration::minutes(min)
    }

    fn funded(duration: f64, cycles: u32) -> ZoneCycle {
        let mut c = ZoneCycle::new();
        c.reset(Allocation {
            duration_min: duration,
            cycles,
        });
        c
    }

    // ---- watering ----

    #[test]
    fn unfunded_zone_does_not_want_slot() {
        let c = ZoneCycle::new();
        assert!(!c.wants_slot());
    }

    #[test]
    fn watering_ends_after_cycle_time() {
        let t = timing(120.0);
        let mut c = funded(30.0, 2);
        assert_eq!(c.start_watering(T0, 18.0, &t), Transition::StartedWatering);
        assert_eq!(c.phase(), Phase::Watering);
        assert_eq!(c.advance(at(14), Some(18.0), &t), Transition::Stay);
        assert_eq!(c.advance(at(15), Some(18.0), &t), Transition::StartedSoaking);
        assert_eq!(c.cycles_completed(), 1);
        let iv = c.take_interval().unwrap();
        assert_eq!(iv.watered_min, 15.0);
        assert_eq!(iv.moisture_before, 18.0);
        assert!(c.take_interval().is_none());
    }

    #[test]
    fn short_allocation_ends_cycle_early() {
        let t = timing(120.0);
        let mut c = funded(8.0, 1);
        c.start_watering(T0, 18.0, &t);
        assert_eq!(c.advance(at(8), None, &t), Transition::StartedSoaking);
    }

    // ---- soaking ----

    #[test]
    fn soak_then_next_cycle() {
        let t = timing(120.0);
        let mut c = funded(30.0, 2);
        c.start_watering(T0, 18.0, &t);
        c.advance(at(15), Some(19.0), &t);
        assert_eq!(c.advance(at(30), Some(20.0), &t), Transition::Stay);
        assert_eq!(c.advance(at(45), Some(20.0), &t), Transition::SoakComplete);
        assert!(c.wants_slot());
        assert_eq!(c.advance(at(46), Some(20.0), &t), Transition::Stay);
        assert_eq!(c.start_watering(at(47), 20.0, &t), Transition::StartedWatering);
        c.advance(at(62), Some(21.0), &t);
        assert_eq!(
            c.advance(at(92), Some(22.0), &t),
            Transition::Done(DoneReason::CyclesExhausted)
        );
        assert_eq!(c.outcome(), Some(Outcome::Done(DoneReason::CyclesExhausted)));
    }

    #[test]
    fn target_reached_ends_early() {
        let t = timing(120.0);
        let mut c = funded(45.0, 3);
        c.start_watering(T0, 18.0, &t);
        c.advance(at(15), Some(19.0), &t);
        assert_eq!(
            c.advance(at(45), Some(25.5), &t),
            Transition::Done(DoneReason::TargetReached)
        );
        assert_eq!(c.cycles_completed(), 1);
    }

    #[test]
    fn unknown_moisture_at_soak_end_continues() {
        let t = timing(120.0);
        let mut c = funded(30.0, 2);
        c.start_watering(T0, 18.0, &t);
        c.advance(at(15), None, &t);
        assert_eq!(c.advance(at(45), None, &t), Transition::SoakComplete);
    }

    // ---- abort ----

    #[test]
    fn max_duration_aborts_while_watering() {
        let t = timing(20.0);
        let mut c = funded(30.0, 2);
        c.start_watering(T0, 18.0, &t);
        c.advance(at(15), None, &t);
        c.advance(at(45), None, &t);
        c.start_watering(at(45), 19.0, &t);
        let tr = c.advance(at(50), None, &t);
        assert_eq!(tr, Transition::Aborted(AbortReason::MaxDuration));
        assert_eq!(tr.switch(), Some(false));
        assert_eq!(c.phase(), Phase::Aborted);
        assert!(!c.wants_slot());
        assert_eq!(c.watered_min(), 20.0);
    }

    #[test]
    fn abort_from_soaking_and_finished_is_sticky() {
        let t = timing(120.0);
        let mut c = funded(30.0, 2);
        c.start_watering(T0, 18.0, &t);
        c.advance(at(15), None, &t);
        assert_eq!(
            c.abort(at(20), AbortReason::ScheduleEnded),
            Transition::Aborted(AbortReason::ScheduleEnded)
        );
        assert_eq!(c.abort(at(21), AbortReason::Disabled), Transition::Stay);
        assert_eq!(c.outcome(), Some(Outcome::Aborted(AbortReason::ScheduleEnded)));
    }

    #[test]
    fn abort_mid_watering_keeps_interval() {
        let t = timing(120.0);
        let mut c = funded(30.0, 2);
        c.start_watering(T0, 18.0, &t);
        c.abort(at(6), AbortReason::Disabled);
        assert_eq!(c.take_interval().unwrap().watered_min, 6.0);
    }

    #[test]
    fn switch_commands() {
        assert_eq!(Transition::StartedWatering.switch(), Some(true));
        assert_eq!(Transition::StartedSoaking.switch(), Some(false));
        assert_eq!(Transition::Done(DoneReason::TargetReached).switch(), Some(false));
        assert_eq!(Transition::SoakComplete.switch(), None);
        assert_eq!(Transition::Stay.switch(), None);
    }
}
